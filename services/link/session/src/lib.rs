//! Connections, handshake negotiation, message correlation and peer events for dfs-link.
//!
//! This crate turns byte streams into negotiated links between two mounted
//! instances of the distributed filesystem and carries request/response
//! traffic over them.
//!
//! ## Features
//!
//! - **Handshake**: REQUEST/RESPONSE/ACK exchange with a TLV extension block
//! - **Correlation**: synchronous and asynchronous requests with deadlines
//! - **Peer events**: ADD/ONLINE/OFFLINE/DEL callbacks in strict order
//! - **Reconnect**: replacement of failed connections with exponential backoff
//!
//! ## Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use link_session::{CallbackMode, EventKind, LinkConfig, LinkNodeBuilder};
//! use link_wire::Command;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = LinkConfig {
//!     device_id: "device-a".to_string(),
//!     ..LinkConfig::default()
//! };
//! let node = LinkNodeBuilder::new(config).build()?;
//!
//! node.register_event_callback(EventKind::Online, CallbackMode::Sync, 1, "log", |ctx| {
//!     println!("peer {} online (seq {})", ctx.peer_cid, ctx.seq);
//!     Ok(())
//! })?;
//!
//! let addr = "127.0.0.1:9000".parse()?;
//! node.connect("device-b", addr).await?;
//! let stat = node
//!     .send_request("device-b", Command::Statfs, Bytes::new(), None)
//!     .await?;
//! println!("statfs reply: {} bytes", stat.len());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod correlator;
pub mod crypto;
pub mod error;
pub mod event;
pub mod failure_tracker;
pub mod handshake;
pub mod node;
pub mod observer;
pub mod peer;
pub mod reconnect;
pub mod stats;
pub mod transport;

// Re-export main types
pub use config::LinkConfig;
pub use connection::{ConnStatus, Connection, ConnectionStatsSnapshot, LinkRole, TransportParams};
pub use correlator::{Continuation, MessageCorrelator, Outcome};
pub use crypto::SessionKeys;
pub use error::{LinkError, EINVAL, EOPNOTSUPP};
pub use event::{CallbackMode, EventContext, EventKind, EventSequencer};
pub use handshake::{ExtensionHandler, HandshakeNegotiator, DEFAULT_EXTENSIONS};
pub use node::{LinkNode, LinkNodeBuilder};
pub use observer::{LinkObserver, LoggingObserver, RequestHandler};
pub use peer::{Peer, PeerSnapshot, PeerStatus};
pub use reconnect::{Connector, ReconnectPolicy, TcpConnector};
pub use stats::{CommandStats, ResponseStats};
pub use transport::{connect_tcp, listen_tcp, IoStream};
