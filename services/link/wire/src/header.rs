//! Fixed envelope header.
//!
//! Every message on a link starts with this 20-byte little-endian header.
//! The `operation` byte is a handshake step while the HANDSHAKE flag is set
//! and a command id otherwise.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Protocol magic constant
pub const MSG_MAGIC: u8 = 0xF7;

/// Header size in bytes
pub const HEADER_SIZE: usize = 20;

/// First protocol version (no extension block, no ACK, 16-bit ids)
pub const VERSION_LEGACY: u8 = 1;

/// Version that introduced the extension block and the ACK step
pub const VERSION_EXTENDED: u8 = 2;

/// Highest version this implementation speaks
pub const MAX_VERSION: u8 = VERSION_EXTENDED;

/// Handshake steps carried in `operation` when the HANDSHAKE flag is set
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandshakeStep {
    /// Initiator opens negotiation
    Request = 1,
    /// Accepter answers, carrying its extensions
    Response = 2,
    /// Initiator confirms, carrying its extensions
    Ack = 3,
}

impl TryFrom<u8> for HandshakeStep {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(HandshakeStep::Request),
            2 => Ok(HandshakeStep::Response),
            3 => Ok(HandshakeStep::Ack),
            _ => Err(crate::WireError::Step(value)),
        }
    }
}

impl std::fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeStep::Request => write!(f, "REQUEST"),
            HandshakeStep::Response => write!(f, "RESPONSE"),
            HandshakeStep::Ack => write!(f, "ACK"),
        }
    }
}

bitflags! {
    /// Header flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Flags: u8 {
        /// Message is part of the handshake exchange
        const HANDSHAKE = 1 << 0;
        /// Message answers a request
        const RESPONSE = 1 << 1;
        /// Response payload is a le32 remote error code
        const REMOTE_ERROR = 1 << 2;
    }
}

/// Envelope header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireHeader {
    /// Protocol magic
    pub magic: u8,
    /// Protocol version of the sender
    pub version: u8,
    /// Handshake step or command id
    pub operation: u8,
    /// Header flags
    pub flags: Flags,
    /// Total envelope length including this header
    pub data_len: u32,
    /// Sender's instance id
    pub source_id: u64,
    /// Correlation id (low half for extended peers)
    pub msg_id: u16,
    /// Handshake correlation, or high half of the correlation id
    pub request_id: u16,
}

impl WireHeader {
    /// Create a header for a handshake step
    pub fn handshake(step: HandshakeStep, version: u8, source_id: u64, correlation: u16) -> Self {
        Self {
            magic: MSG_MAGIC,
            version,
            operation: step as u8,
            flags: Flags::HANDSHAKE,
            data_len: HEADER_SIZE as u32,
            source_id,
            msg_id: 0,
            request_id: correlation,
        }
    }

    /// Create a request header for a command
    pub fn request(command: u8, version: u8, source_id: u64) -> Self {
        Self {
            magic: MSG_MAGIC,
            version,
            operation: command,
            flags: Flags::empty(),
            data_len: HEADER_SIZE as u32,
            source_id,
            msg_id: 0,
            request_id: 0,
        }
    }

    /// Create the response header for a received request
    pub fn response_to(request: &WireHeader, version: u8, source_id: u64) -> Self {
        Self {
            magic: MSG_MAGIC,
            version,
            operation: request.operation,
            flags: Flags::RESPONSE,
            data_len: HEADER_SIZE as u32,
            source_id,
            msg_id: request.msg_id,
            request_id: request.request_id,
        }
    }

    /// Whether this header belongs to the handshake exchange
    pub fn is_handshake(&self) -> bool {
        self.flags.contains(Flags::HANDSHAKE)
    }

    /// Whether this header carries a response
    pub fn is_response(&self) -> bool {
        self.flags.contains(Flags::RESPONSE)
    }

    /// Payload length implied by `data_len`
    pub fn payload_len(&self) -> usize {
        (self.data_len as usize).saturating_sub(HEADER_SIZE)
    }

    /// Correlation id as seen by a peer speaking `version`
    pub fn correlation_id(&self, version: u8) -> u32 {
        if version >= VERSION_EXTENDED {
            ((self.request_id as u32) << 16) | self.msg_id as u32
        } else {
            self.msg_id as u32
        }
    }

    /// Store a correlation id for a peer speaking `version`
    pub fn set_correlation_id(&mut self, id: u32, version: u8) {
        self.msg_id = (id & 0xFFFF) as u16;
        self.request_id = if version >= VERSION_EXTENDED {
            (id >> 16) as u16
        } else {
            0
        };
    }

    /// Encode the header to bytes (little-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.magic);
        buf.put_u8(self.version);
        buf.put_u8(self.operation);
        buf.put_u8(self.flags.bits());
        buf.put_u32_le(self.data_len);
        buf.put_u64_le(self.source_id);
        buf.put_u16_le(self.msg_id);
        buf.put_u16_le(self.request_id);
    }

    /// Decode the header from bytes (little-endian)
    pub fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(crate::WireError::Incomplete);
        }

        let magic = buf.get_u8();
        if magic != MSG_MAGIC {
            return Err(crate::WireError::Magic(magic));
        }

        let version = buf.get_u8();
        let operation = buf.get_u8();
        let flags = Flags::from_bits(buf.get_u8()).ok_or(crate::WireError::Reserved)?;
        let data_len = buf.get_u32_le();
        if (data_len as usize) < HEADER_SIZE {
            return Err(crate::WireError::Size(data_len as usize));
        }

        let source_id = buf.get_u64_le();
        let msg_id = buf.get_u16_le();
        let request_id = buf.get_u16_le();

        Ok(Self {
            magic,
            version,
            operation,
            flags,
            data_len,
            source_id,
            msg_id,
            request_id,
        })
    }
}
