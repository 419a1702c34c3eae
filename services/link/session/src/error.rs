//! Error taxonomy shared by every link operation.

use link_wire::WireError;
use thiserror::Error;

/// Errno-style code returned to a peer for commands nobody serves
pub const EOPNOTSUPP: i32 = 95;

/// Errno-style code for a request the receiver could not parse
pub const EINVAL: i32 = 22;

/// Errors surfaced by connections, the correlator and the peer registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Handshake aborted: version, extension or identity mismatch
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// No response before the deadline
    #[error("request timed out")]
    Timeout,

    /// Stream write or read failed; the connection is unusable
    #[error("transport failure: {0}")]
    Transport(String),

    /// No working connection or the peer is draining; retry later
    #[error("resource temporarily unavailable")]
    Again,

    /// Response for an id that is unknown, expired or from an older generation
    #[error("stale correlation id {0:#x}")]
    StaleCorrelation(u32),

    /// The peer answered with an error code
    #[error("remote error {0}")]
    Remote(i32),

    /// The peer went offline while the request was outstanding
    #[error("peer not reachable")]
    NotReachable,

    /// Caller misuse
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Malformed bytes on the wire
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Transport(err.to_string())
    }
}

impl LinkError {
    /// Whether this error means the connection itself is broken
    pub fn is_transport(&self) -> bool {
        matches!(self, LinkError::Transport(_))
    }
}
