//! Handshake extension block.
//!
//! ```text
//! +--------------------+
//! | le32 field_count   |
//! +--------------------+----------------+------------------+
//! | le16 code          | le16 length    | body (length B)  |  x field_count
//! +--------------------+----------------+------------------+
//! ```
//!
//! The block is only exchanged by peers at [`VERSION_EXTENDED`](crate::VERSION_EXTENDED)
//! or later. Field bodies have a fixed size per code; a reader accepts longer
//! bodies and reads the known prefix.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::WireError;

const FIELD_HEAD_SIZE: usize = 4;
const BLOCK_HEAD_SIZE: usize = 4;

/// Registered extension codes
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExtensionCode {
    /// Crypto capability bitmap
    Crypto = 0,
    /// Case-sensitivity flag
    CaseSense = 1,
    /// Feature bitmap
    FeatureSupport = 2,
    /// Alternate transport parameters
    TransportParams = 3,
    /// Device class
    DeviceClass = 4,
}

impl ExtensionCode {
    /// Every registered code in wire order
    pub const ALL: [ExtensionCode; 5] = [
        ExtensionCode::Crypto,
        ExtensionCode::CaseSense,
        ExtensionCode::FeatureSupport,
        ExtensionCode::TransportParams,
        ExtensionCode::DeviceClass,
    ];

    /// Fixed body length for this code
    pub const fn body_len(self) -> u16 {
        match self {
            ExtensionCode::Crypto => 4,
            ExtensionCode::CaseSense => 1,
            ExtensionCode::FeatureSupport => 16,
            ExtensionCode::TransportParams => 3,
            ExtensionCode::DeviceClass => 1,
        }
    }

    /// Map a raw code, `None` for codes this build does not know
    pub fn from_raw(code: u16) -> Option<Self> {
        match code {
            0 => Some(ExtensionCode::Crypto),
            1 => Some(ExtensionCode::CaseSense),
            2 => Some(ExtensionCode::FeatureSupport),
            3 => Some(ExtensionCode::TransportParams),
            4 => Some(ExtensionCode::DeviceClass),
            _ => None,
        }
    }
}

bitflags! {
    /// Crypto capability bitmap
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CryptoCaps: u32 {
        /// Kernel TLS with AES-128
        const KTLS_AES128 = 0x0000_0001;
        /// Kernel TLS with AES-256
        const KTLS_AES256 = 0x0000_0002;
    }
}

/// A typed extension value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    /// Crypto algorithms the sender supports
    Crypto(CryptoCaps),
    /// Whether the sender's namespace is case sensitive
    CaseSense(bool),
    /// Sender feature bitmap
    FeatureSupport(u64),
    /// Alternate transport port and version
    TransportParams {
        /// UDP port of the alternate transport, 0 when absent
        udp_port: u16,
        /// Alternate transport protocol version
        version: u8,
    },
    /// Sender device class
    DeviceClass(u8),
}

impl Extension {
    /// Code of this extension
    pub fn code(&self) -> ExtensionCode {
        match self {
            Extension::Crypto(_) => ExtensionCode::Crypto,
            Extension::CaseSense(_) => ExtensionCode::CaseSense,
            Extension::FeatureSupport(_) => ExtensionCode::FeatureSupport,
            Extension::TransportParams { .. } => ExtensionCode::TransportParams,
            Extension::DeviceClass(_) => ExtensionCode::DeviceClass,
        }
    }

    /// Encode into a raw field
    pub fn to_field(&self) -> ExtensionField {
        let code = self.code();
        let mut body = BytesMut::with_capacity(code.body_len() as usize);
        match *self {
            Extension::Crypto(caps) => body.put_u32_le(caps.bits()),
            Extension::CaseSense(sensitive) => body.put_u8(sensitive as u8),
            Extension::FeatureSupport(features) => {
                body.put_u64_le(features);
                body.put_u64_le(0);
            }
            Extension::TransportParams { udp_port, version } => {
                body.put_u16_le(udp_port);
                body.put_u8(version);
            }
            Extension::DeviceClass(class) => body.put_u8(class),
        }
        ExtensionField {
            code: code as u16,
            body: body.freeze(),
        }
    }

    /// Decode a raw field of a known code
    pub fn from_field(code: ExtensionCode, body: &[u8]) -> Result<Self, WireError> {
        if body.len() < code.body_len() as usize {
            return Err(WireError::ExtensionBody {
                code: code as u16,
                len: body.len() as u16,
            });
        }

        let mut body = body;
        let ext = match code {
            ExtensionCode::Crypto => Extension::Crypto(CryptoCaps::from_bits_retain(body.get_u32_le())),
            ExtensionCode::CaseSense => Extension::CaseSense(body.get_u8() != 0),
            ExtensionCode::FeatureSupport => Extension::FeatureSupport(body.get_u64_le()),
            ExtensionCode::TransportParams => Extension::TransportParams {
                udp_port: body.get_u16_le(),
                version: body.get_u8(),
            },
            ExtensionCode::DeviceClass => Extension::DeviceClass(body.get_u8()),
        };
        Ok(ext)
    }
}

/// One raw TLV field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionField {
    /// Raw code, possibly unknown to this build
    pub code: u16,
    /// Opaque body
    pub body: Bytes,
}

impl ExtensionField {
    /// Known code of this field, if any
    pub fn known_code(&self) -> Option<ExtensionCode> {
        ExtensionCode::from_raw(self.code)
    }
}

/// An ordered list of extension fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionBlock {
    /// Fields in wire order
    pub fields: Vec<ExtensionField>,
}

impl ExtensionBlock {
    /// Create an empty block
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a typed extension
    pub fn push(&mut self, ext: Extension) {
        self.fields.push(ext.to_field());
    }

    /// Encoded size of the block
    pub fn encoded_len(&self) -> usize {
        BLOCK_HEAD_SIZE
            + self
                .fields
                .iter()
                .map(|f| FIELD_HEAD_SIZE + f.body.len())
                .sum::<usize>()
    }

    /// Encode the block
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.fields.len() as u32);
        for field in &self.fields {
            buf.put_u16_le(field.code);
            buf.put_u16_le(field.body.len() as u16);
            buf.put_slice(&field.body);
        }
    }

    /// Decode a block, rejecting any field whose declared length overruns the buffer
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.len() < BLOCK_HEAD_SIZE {
            return Err(WireError::Malformed);
        }

        let count = buf.get_u32_le() as usize;
        let mut fields = Vec::with_capacity(count.min(ExtensionCode::ALL.len()));
        for _ in 0..count {
            if buf.len() < FIELD_HEAD_SIZE {
                return Err(WireError::Malformed);
            }
            let code = buf.get_u16_le();
            let len = buf.get_u16_le();
            if len as usize > buf.len() {
                return Err(WireError::ExtensionLength {
                    code,
                    len,
                    remaining: buf.len(),
                });
            }
            let body = buf.split_to(len as usize);
            fields.push(ExtensionField { code, body });
        }

        Ok(Self { fields })
    }

    /// Decode every known field, skipping unknown codes
    pub fn typed(&self) -> Result<Vec<Extension>, WireError> {
        self.fields
            .iter()
            .filter_map(|f| f.known_code().map(|code| Extension::from_field(code, &f.body)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_block() -> ExtensionBlock {
        let mut block = ExtensionBlock::new();
        block.push(Extension::Crypto(CryptoCaps::KTLS_AES128));
        block.push(Extension::CaseSense(true));
        block.push(Extension::FeatureSupport(0xDEAD_BEEF));
        block.push(Extension::TransportParams {
            udp_port: 4500,
            version: 1,
        });
        block.push(Extension::DeviceClass(3));
        block
    }

    #[test]
    fn test_block_encode_decode() {
        let block = full_block();
        let mut buf = BytesMut::new();
        block.encode(&mut buf);
        assert_eq!(buf.len(), block.encoded_len());

        let decoded = ExtensionBlock::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(
            decoded.typed().unwrap(),
            vec![
                Extension::Crypto(CryptoCaps::KTLS_AES128),
                Extension::CaseSense(true),
                Extension::FeatureSupport(0xDEAD_BEEF),
                Extension::TransportParams {
                    udp_port: 4500,
                    version: 1
                },
                Extension::DeviceClass(3),
            ]
        );
    }

    #[test]
    fn test_body_sizes_match_registry() {
        for code in ExtensionCode::ALL {
            let ext = match code {
                ExtensionCode::Crypto => Extension::Crypto(CryptoCaps::empty()),
                ExtensionCode::CaseSense => Extension::CaseSense(false),
                ExtensionCode::FeatureSupport => Extension::FeatureSupport(0),
                ExtensionCode::TransportParams => Extension::TransportParams {
                    udp_port: 0,
                    version: 0,
                },
                ExtensionCode::DeviceClass => Extension::DeviceClass(0),
            };
            assert_eq!(ext.to_field().body.len(), code.body_len() as usize);
        }
    }

    #[test]
    fn test_declared_length_overrun_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1);
        buf.put_u16_le(ExtensionCode::Crypto as u16);
        buf.put_u16_le(64);
        buf.put_u32_le(1);

        let err = ExtensionBlock::decode(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, WireError::ExtensionLength { code: 0, len: 64, remaining: 4 }));
    }

    #[test]
    fn test_field_count_beyond_data_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(2);
        buf.put_u16_le(ExtensionCode::DeviceClass as u16);
        buf.put_u16_le(1);
        buf.put_u8(9);

        assert_eq!(
            ExtensionBlock::decode(&mut buf.freeze()),
            Err(WireError::Malformed)
        );
    }

    #[test]
    fn test_unknown_code_skipped() {
        let mut block = ExtensionBlock::new();
        block.fields.push(ExtensionField {
            code: 0x7FFF,
            body: Bytes::from_static(&[1, 2, 3, 4, 5]),
        });
        block.push(Extension::CaseSense(false));

        let mut buf = BytesMut::new();
        block.encode(&mut buf);
        let decoded = ExtensionBlock::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.fields.len(), 2);
        assert_eq!(decoded.typed().unwrap(), vec![Extension::CaseSense(false)]);
    }

    #[test]
    fn test_short_body_fails_parse() {
        let err = Extension::from_field(ExtensionCode::FeatureSupport, &[0u8; 8]).unwrap_err();
        assert_eq!(err, WireError::ExtensionBody { code: 2, len: 8 });
    }

    #[test]
    fn test_longer_body_reads_prefix() {
        let ext = Extension::from_field(ExtensionCode::DeviceClass, &[7, 0, 0]).unwrap();
        assert_eq!(ext, Extension::DeviceClass(7));
    }
}
