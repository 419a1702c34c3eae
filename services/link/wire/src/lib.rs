//! Envelope, handshake extension block and command table for dfs-link.
//!
//! This crate holds the byte-level protocol spoken between two mounted
//! instances of the distributed filesystem: the fixed envelope header, the
//! handshake payload with its TLV extension block, and the closed set of
//! remote commands with their timeout classes and length rules.
//!
//! ## Wire Format
//!
//! ```text
//! +-----------+-----------+-----------+-----------+
//! | magic u8  | version u8| operation | flags u8  |
//! +-----------+-----------+-----------+-----------+
//! | le32 data_len (whole message incl. header)    |
//! +-----------------------------------------------+
//! | le64 source_id                                |
//! +-----------------------+-----------------------+
//! | le16 msg_id           | le16 request_id       |
//! +-----------------------+-----------------------+
//! | payload (data_len - 20 bytes)                 |
//! +-----------------------------------------------+
//! ```
//!
//! Handshake payloads carry `le32 len | device id | extension block`;
//! command payloads are opaque to this crate apart from the echo body.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod error;
pub mod extension;
pub mod frame;
pub mod handshake;
pub mod header;

// Re-export main types
pub use command::{Command, EchoParam, LenJudge, LengthRule, TimeoutClass};
pub use error::WireError;
pub use extension::{CryptoCaps, Extension, ExtensionBlock, ExtensionCode, ExtensionField};
pub use frame::{MessageDecoder, WireMessage, DEFAULT_MAX_MESSAGE_SIZE, HARD_MAX_MESSAGE_SIZE};
pub use handshake::{HandshakePayload, MAX_DEVICE_ID_LEN};
pub use header::{
    Flags, HandshakeStep, WireHeader, HEADER_SIZE, MAX_VERSION, MSG_MAGIC, VERSION_EXTENDED,
    VERSION_LEGACY,
};
