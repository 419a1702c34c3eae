//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Incomplete message (need more data)
    #[error("incomplete message")]
    Incomplete,

    /// Magic byte mismatch
    #[error("bad magic 0x{0:02x}")]
    Magic(u8),

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Size limit exceeded or length field inconsistent
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Reserved bits nonzero
    #[error("reserved bits nonzero")]
    Reserved,

    /// Unknown handshake step
    #[error("unknown handshake step {0}")]
    Step(u8),

    /// Unknown command id
    #[error("unknown command {0}")]
    Command(u8),

    /// Extension declared a length larger than the remaining buffer
    #[error("extension {code} length {len} exceeds remaining {remaining}")]
    ExtensionLength {
        /// Extension code
        code: u16,
        /// Declared body length
        len: u16,
        /// Bytes left in the block
        remaining: usize,
    },

    /// Extension body shorter than its fixed size
    #[error("extension {code} body too short: {len}")]
    ExtensionBody {
        /// Extension code
        code: u16,
        /// Actual body length
        len: u16,
    },

    /// Device id field too long or not valid utf-8
    #[error("invalid device id")]
    DeviceId,

    /// Message length outside the rule for its command
    #[error("command {command} length {len} rejected")]
    Verify {
        /// Command id
        command: u8,
        /// Payload length
        len: usize,
    },

    /// Malformed message structure
    #[error("malformed message")]
    Malformed,
}
