//! Hooks for collaborators outside the link layer.

use async_trait::async_trait;
use bytes::Bytes;
use link_wire::Command;
use tracing::info;

use crate::connection::TransportParams;

/// Receives the notifications a userspace daemon would act on
pub trait LinkObserver: Send + Sync + std::fmt::Debug {
    /// Handshake finished and the peer is online
    fn notify_handshake_done(&self, peer_cid: &str);
    /// Peer cannot be reached (negotiation failure or no working connection)
    fn notify_offline(&self, peer_cid: &str, reason: &str);
    /// A connection to the peer was torn down
    fn notify_connection_closed(&self, peer_cid: &str, conn_id: u64);
    /// Peer announced an alternate transport endpoint
    fn notify_transport_params(&self, peer_cid: &str, params: TransportParams);
}

/// Observer that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl LinkObserver for LoggingObserver {
    fn notify_handshake_done(&self, peer_cid: &str) {
        info!("Handshake with peer {} done", peer_cid);
    }

    fn notify_offline(&self, peer_cid: &str, reason: &str) {
        info!("Peer {} offline: {}", peer_cid, reason);
    }

    fn notify_connection_closed(&self, peer_cid: &str, conn_id: u64) {
        info!("Connection {} to peer {} closed", conn_id, peer_cid);
    }

    fn notify_transport_params(&self, peer_cid: &str, params: TransportParams) {
        info!(
            "Peer {} offers alternate transport on udp port {} (version {})",
            peer_cid, params.udp_port, params.version
        );
    }
}

/// Serves inbound commands other than the built-in echo.
///
/// `Ok(Some(payload))` is sent back as the response, `Ok(None)` sends
/// nothing, and `Err(code)` answers with a remote error code.
#[async_trait]
pub trait RequestHandler: Send + Sync + std::fmt::Debug {
    /// Handle one request from `peer_cid`
    async fn handle(&self, peer_cid: &str, command: Command, payload: Bytes)
        -> Result<Option<Bytes>, i32>;
}
