//! Whole messages and the stream decoder.

use crate::header::{WireHeader, HEADER_SIZE, MSG_MAGIC};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Default maximum message size (8 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;
/// Hard maximum message size (64 MiB)
pub const HARD_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Complete wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    /// Envelope header; `data_len` is recomputed on encode
    pub header: WireHeader,
    /// Payload bytes
    pub payload: Bytes,
}

impl WireMessage {
    /// Create a message
    pub fn new(header: WireHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Total encoded size
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode to a contiguous buffer
    pub fn encode(&self, max_message_size: usize) -> Result<Bytes, crate::WireError> {
        let total = self.encoded_size();
        if total > max_message_size || total > u32::MAX as usize {
            return Err(crate::WireError::Size(total));
        }

        let mut header = self.header;
        header.data_len = total as u32;

        let mut buf = BytesMut::with_capacity(total);
        header.encode(&mut buf);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

/// Incremental decoder for a byte stream of messages
#[derive(Debug)]
pub struct MessageDecoder {
    max_message_size: usize,
}

impl MessageDecoder {
    /// Create a decoder with the default size limit
    pub fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Create a decoder with a custom size limit, clamped to the hard maximum
    pub fn with_max_size(max_message_size: usize) -> Self {
        Self {
            max_message_size: max_message_size.min(HARD_MAX_MESSAGE_SIZE),
        }
    }

    /// Decode one message, `Ok(None)` until a whole message is buffered
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<WireMessage>, crate::WireError> {
        if buf.is_empty() {
            return Ok(None);
        }
        if buf[0] != MSG_MAGIC {
            return Err(crate::WireError::Magic(buf[0]));
        }
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let data_len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        if data_len < HEADER_SIZE || data_len > self.max_message_size {
            return Err(crate::WireError::Size(data_len));
        }
        if buf.len() < data_len {
            return Ok(None);
        }

        let mut message = buf.split_to(data_len).freeze();
        let header = WireHeader::decode(&mut message)?;
        let payload = message.split_to(message.remaining());

        Ok(Some(WireMessage { header, payload }))
    }
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{HandshakeStep, VERSION_EXTENDED};

    #[test]
    fn test_message_encode_sets_length() {
        let header = WireHeader::request(11, VERSION_EXTENDED, 5);
        let msg = WireMessage::new(header, Bytes::from_static(b"0123456789abcdef"));
        let bytes = msg.encode(DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 16);
        assert_eq!(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 36);
    }

    #[test]
    fn test_decoder_handles_partial_and_multiple() {
        let first = WireMessage::new(
            WireHeader::handshake(HandshakeStep::Request, VERSION_EXTENDED, 1, 9),
            Bytes::from_static(b"abc"),
        );
        let second = WireMessage::new(
            WireHeader::request(11, VERSION_EXTENDED, 1),
            Bytes::new(),
        );
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&first.encode(DEFAULT_MAX_MESSAGE_SIZE).unwrap());
        stream.extend_from_slice(&second.encode(DEFAULT_MAX_MESSAGE_SIZE).unwrap());

        let mut decoder = MessageDecoder::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&stream[..10]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&stream[10..]);
        let a = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(a.header.operation, HandshakeStep::Request as u8);
        assert_eq!(a.payload, Bytes::from_static(b"abc"));

        let b = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(b.header.operation, 11);
        assert!(b.payload.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decoder_rejects_oversize_and_magic() {
        let mut decoder = MessageDecoder::with_max_size(64);
        let msg = WireMessage::new(
            WireHeader::request(11, VERSION_EXTENDED, 1),
            Bytes::from(vec![0u8; 100]),
        );
        let mut buf = BytesMut::from(&msg.encode(DEFAULT_MAX_MESSAGE_SIZE).unwrap()[..]);
        assert!(decoder.decode(&mut buf).is_err());

        let mut garbage = BytesMut::from(&b"\x00garbage"[..]);
        assert_eq!(
            decoder.decode(&mut garbage),
            Err(crate::WireError::Magic(0))
        );
    }

    #[test]
    fn test_encode_respects_limit() {
        let msg = WireMessage::new(
            WireHeader::request(11, VERSION_EXTENDED, 1),
            Bytes::from(vec![0u8; 64]),
        );
        assert!(msg.encode(32).is_err());
    }
}
