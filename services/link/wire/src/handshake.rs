//! Handshake payload: device id field plus optional extension block.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::extension::ExtensionBlock;
use crate::WireError;

/// Maximum device id length in bytes
pub const MAX_DEVICE_ID_LEN: usize = 64;

/// Payload of every handshake step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePayload {
    /// Sender's stable device id
    pub device_id: String,
    /// Extension block, present on RESPONSE/ACK of extended peers
    pub extensions: Option<ExtensionBlock>,
}

impl HandshakePayload {
    /// Create a payload without extensions
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            extensions: None,
        }
    }

    /// Attach an extension block
    pub fn with_extensions(mut self, block: ExtensionBlock) -> Self {
        self.extensions = Some(block);
        self
    }

    /// Encoded size of the payload
    pub fn encoded_len(&self) -> usize {
        4 + self.device_id.len()
            + self
                .extensions
                .as_ref()
                .map(ExtensionBlock::encoded_len)
                .unwrap_or(0)
    }

    /// Encode the payload
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        if self.device_id.len() > MAX_DEVICE_ID_LEN {
            return Err(WireError::DeviceId);
        }
        buf.put_u32_le(self.device_id.len() as u32);
        buf.put_slice(self.device_id.as_bytes());
        if let Some(ref block) = self.extensions {
            block.encode(buf);
        }
        Ok(())
    }

    /// Decode a payload; trailing bytes after the device id are an extension block
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        if buf.len() < 4 {
            return Err(WireError::Malformed);
        }

        let id_len = buf.get_u32_le() as usize;
        if id_len > buf.len() {
            return Err(WireError::Malformed);
        }
        if id_len > MAX_DEVICE_ID_LEN {
            return Err(WireError::DeviceId);
        }

        let id_bytes = buf.split_to(id_len);
        let device_id = std::str::from_utf8(&id_bytes)
            .map_err(|_| WireError::DeviceId)?
            .to_string();

        let extensions = if buf.is_empty() {
            None
        } else {
            Some(ExtensionBlock::decode(&mut buf)?)
        };

        Ok(Self {
            device_id,
            extensions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{CryptoCaps, Extension};

    #[test]
    fn test_payload_without_extensions() {
        let payload = HandshakePayload::new("device-a");
        let mut buf = BytesMut::new();
        payload.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), payload.encoded_len());

        let decoded = HandshakePayload::decode(buf.freeze()).unwrap();
        assert_eq!(decoded.device_id, "device-a");
        assert!(decoded.extensions.is_none());
    }

    #[test]
    fn test_payload_with_extensions() {
        let mut block = ExtensionBlock::new();
        block.push(Extension::Crypto(CryptoCaps::KTLS_AES256));
        let payload = HandshakePayload::new("device-b").with_extensions(block.clone());

        let mut buf = BytesMut::new();
        payload.encode(&mut buf).unwrap();
        let decoded = HandshakePayload::decode(buf.freeze()).unwrap();
        assert_eq!(decoded.extensions, Some(block));
    }

    #[test]
    fn test_device_id_length_checks() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(10);
        buf.put_slice(b"abc");
        assert_eq!(
            HandshakePayload::decode(buf.freeze()),
            Err(WireError::Malformed)
        );

        let long = HandshakePayload::new("x".repeat(MAX_DEVICE_ID_LEN + 1));
        assert_eq!(
            long.encode(&mut BytesMut::new()),
            Err(WireError::DeviceId)
        );
    }
}
