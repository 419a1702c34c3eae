//! Replacing failed connections.
//!
//! A transport failure stops the connection at once and hands the rest to a
//! per-peer task: drop the stale connection, then dial again through the
//! node's [`Connector`] with exponential backoff. When every attempt fails,
//! or nothing can dial the peer, the peer is disconnected, which raises
//! OFFLINE.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{ConnStatus, Connection, LinkRole};
use crate::failure_tracker::ReconnectFailureTracker;
use crate::node::NodeInner;
use crate::peer::{Peer, PeerStatus};
use crate::transport::{connect_tcp, IoStream};
use crate::{LinkConfig, LinkError};

/// Opens a fresh stream to a peer
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// Dial `peer_cid`
    async fn connect(&self, peer_cid: &str) -> Result<(IoStream, LinkRole), LinkError>;
}

/// Dials peers over TCP at addresses registered per peer
#[derive(Debug, Default)]
pub struct TcpConnector {
    addresses: DashMap<String, SocketAddr>,
}

impl TcpConnector {
    /// Create a connector with no known peers
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember where `peer_cid` listens
    pub fn set_address(&self, peer_cid: impl Into<String>, addr: SocketAddr) {
        self.addresses.insert(peer_cid.into(), addr);
    }

    /// Address of `peer_cid`, if known
    pub fn address(&self, peer_cid: &str) -> Option<SocketAddr> {
        self.addresses.get(peer_cid).map(|addr| *addr)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, peer_cid: &str) -> Result<(IoStream, LinkRole), LinkError> {
        let addr = self.address(peer_cid).ok_or(LinkError::NotReachable)?;
        let stream = connect_tcp(addr).await?;
        Ok((stream, LinkRole::Primary))
    }
}

/// Retry bounds of a reconnect episode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts before giving up
    pub max_attempts: u32,
    /// Wait after the first failure
    pub initial_backoff: Duration,
    /// Backoff cap
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    /// Policy from node configuration
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts.max(1),
            initial_backoff: config.reconnect_backoff,
            max_backoff: config.reconnect_backoff_max,
        }
    }

    /// Wait after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

/// Reacts to broken connections
#[derive(Debug)]
pub struct ReconnectManager {
    policy: ReconnectPolicy,
    connector: Option<Arc<dyn Connector>>,
    tracker: ReconnectFailureTracker,
    tasks: DashMap<String, JoinHandle<()>>,
}

impl ReconnectManager {
    /// Create a manager; without a connector failed peers go offline directly
    pub fn new(policy: ReconnectPolicy, connector: Option<Arc<dyn Connector>>) -> Self {
        let window = policy.max_backoff * (policy.max_attempts + 1);
        Self {
            policy,
            connector,
            tracker: ReconnectFailureTracker::new(policy.max_attempts, window),
            tasks: DashMap::new(),
        }
    }

    /// Retry policy in use
    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Whether a reconnect task is running for `peer_cid`
    pub fn is_reconnecting(&self, peer_cid: &str) -> bool {
        self.tasks
            .get(peer_cid)
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Abort the reconnect task of `peer_cid`, if any
    pub(crate) fn cancel(&self, peer_cid: &str) {
        if let Some((_, task)) = self.tasks.remove(peer_cid) {
            task.abort();
            debug!("Cancelled reconnect of peer {}", peer_cid);
        }
    }

    /// A send or read on `conn` failed
    pub(crate) fn on_link_failure(
        &self,
        node: &Arc<NodeInner>,
        peer: &Arc<Peer>,
        conn: &Arc<Connection>,
        error: &LinkError,
    ) {
        if !error.is_transport() || conn.status() == ConnStatus::Stopped {
            return;
        }
        conn.set_status(ConnStatus::Stopped);
        peer.sequencer().bump_sequence();
        warn!(
            "Connection {} to peer {} failed: {}",
            conn.id(),
            peer.cid(),
            error
        );

        if peer.status() == PeerStatus::Offline {
            debug!("Peer {} already offline, not reconnecting", peer.cid());
            return;
        }

        let node = Arc::clone(node);
        let peer = Arc::clone(peer);
        let conn = Arc::clone(conn);
        tokio::spawn(async move {
            node.reconnect.retire(&node, &peer, &conn).await;
        });
    }

    async fn retire(&self, node: &Arc<NodeInner>, peer: &Arc<Peer>, conn: &Arc<Connection>) {
        if peer.remove_connection(conn) {
            conn.shutdown().await;
            node.observer().notify_connection_closed(peer.cid(), conn.id());
        }
        if peer.working_count() > 0 {
            return;
        }
        if peer.transition(PeerStatus::Online, PeerStatus::Shaking) {
            info!("Peer {} lost its last working connection", peer.cid());
        }

        let cid = peer.cid().to_string();
        match self.tasks.entry(cid.clone()) {
            Entry::Occupied(mut running) => {
                if running.get().is_finished() {
                    running.insert(spawn_episode(node, peer));
                } else {
                    debug!("Reconnect of peer {} already running", cid);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(spawn_episode(node, peer));
            }
        }
    }

    async fn run_episode(&self, node: &Arc<NodeInner>, peer: &Arc<Peer>) {
        let cid = peer.cid().to_string();
        let Some(connector) = self.connector.clone() else {
            self.tasks.remove(&cid);
            node.disconnect(peer, "no connector to re-establish the link").await;
            return;
        };

        self.tracker.clear(&cid).await;
        for attempt in 1..=self.policy.max_attempts {
            if peer.status() == PeerStatus::Offline || peer.working_count() > 0 {
                self.tasks.remove(&cid);
                return;
            }
            info!(
                "Reconnecting to peer {} (attempt {}/{})",
                cid, attempt, self.policy.max_attempts
            );
            let result = match connector.connect(&cid).await {
                Ok((stream, role)) => node.establish(peer, stream, role).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    self.tracker.clear(&cid).await;
                    self.tasks.remove(&cid);
                    info!("Reconnected to peer {}", cid);
                    return;
                }
                Err(e) => {
                    let verdict = self.tracker.record_failure(&cid, &e.to_string()).await;
                    if verdict.give_up {
                        break;
                    }
                    let delay = self.policy.backoff(attempt);
                    debug!("Retrying peer {} in {:?}", cid, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.tasks.remove(&cid);
        if peer.working_count() == 0 {
            node.disconnect(peer, "reconnect attempts exhausted").await;
        }
    }
}

fn spawn_episode(node: &Arc<NodeInner>, peer: &Arc<Peer>) -> JoinHandle<()> {
    let node = Arc::clone(node);
    let peer = Arc::clone(peer);
    tokio::spawn(async move {
        node.reconnect.run_episode(&node, &peer).await;
    })
}
