//! A remote node and the connections that reach it.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::debug;

use crate::connection::{ConnStatus, Connection, LinkRole};
use crate::correlator::MessageCorrelator;
use crate::event::{EventCallbackRegistry, EventSequencer};
use crate::stats::ResponseStats;
use crate::LinkConfig;

/// Reachability of a peer
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    /// Handshake in progress on at least one connection
    Shaking = 0,
    /// At least one working connection
    Online = 1,
    /// Unreachable; requests fail fast
    Offline = 2,
}

impl PeerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PeerStatus::Shaking,
            1 => PeerStatus::Online,
            _ => PeerStatus::Offline,
        }
    }
}

/// Summary of a peer for logs and status output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    /// Stable id
    pub cid: String,
    /// Local device id
    pub device_id: u64,
    /// Instance id learned from headers
    pub iid: u64,
    /// Negotiated version
    pub version: u8,
    /// Reachability
    pub status: PeerStatus,
    /// Feature bitmap the peer announced
    pub features: u64,
    /// Connections in any state
    pub connections: usize,
    /// Outstanding requests
    pub pending_requests: usize,
    /// Latest event sequence number
    pub event_seq: u64,
}

/// A remote node
#[derive(Debug)]
pub struct Peer {
    cid: String,
    device_id: u64,
    iid: AtomicU64,
    version: Arc<AtomicU8>,
    features: AtomicU64,
    status: AtomicU8,
    cookie: AtomicU64,
    conn_time: Mutex<Option<Instant>>,
    connections: Mutex<Vec<Arc<Connection>>>,
    correlator: Arc<MessageCorrelator>,
    sequencer: Arc<EventSequencer>,
}

impl Peer {
    pub(crate) fn new(
        cid: impl Into<String>,
        device_id: u64,
        config: &LinkConfig,
        registry: Arc<EventCallbackRegistry>,
        stats: Arc<ResponseStats>,
    ) -> Self {
        let cid = cid.into();
        let version = Arc::new(AtomicU8::new(config.protocol_version));
        let sequencer = EventSequencer::new(
            cid.clone(),
            device_id,
            Arc::clone(&version),
            registry,
            config.async_cb_delay,
        );
        Self {
            cid,
            device_id,
            iid: AtomicU64::new(0),
            version,
            features: AtomicU64::new(0),
            status: AtomicU8::new(PeerStatus::Shaking as u8),
            cookie: AtomicU64::new(0),
            conn_time: Mutex::new(None),
            connections: Mutex::new(Vec::new()),
            correlator: Arc::new(MessageCorrelator::new(stats, config.arm_spin_limit)),
            sequencer: Arc::new(sequencer),
        }
    }

    /// Stable id
    pub fn cid(&self) -> &str {
        &self.cid
    }

    /// Local device id
    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    /// Instance id from the peer's headers
    pub fn iid(&self) -> u64 {
        self.iid.load(Ordering::Acquire)
    }

    pub(crate) fn set_iid(&self, iid: u64) {
        self.iid.store(iid, Ordering::Release);
    }

    /// Protocol version used with this peer
    pub fn version(&self) -> u8 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn set_version(&self, version: u8) {
        self.version.store(version, Ordering::Release);
    }

    /// Feature bitmap the peer announced
    pub fn features(&self) -> u64 {
        self.features.load(Ordering::Acquire)
    }

    pub(crate) fn set_features(&self, features: u64) {
        self.features.store(features, Ordering::Release);
    }

    /// Reachability
    pub fn status(&self) -> PeerStatus {
        PeerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Store a status, returning the previous one
    pub(crate) fn swap_status(&self, status: PeerStatus) -> PeerStatus {
        PeerStatus::from_u8(self.status.swap(status as u8, Ordering::AcqRel))
    }

    /// Move from `from` to `to` if still in `from`
    pub(crate) fn transition(&self, from: PeerStatus, to: PeerStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether the peer is online
    pub fn is_online(&self) -> bool {
        self.status() == PeerStatus::Online
    }

    /// Handle-validity cookie; changes every time the peer goes offline
    pub fn cookie(&self) -> u64 {
        self.cookie.load(Ordering::Acquire)
    }

    pub(crate) fn bump_cookie(&self) {
        self.cookie.fetch_add(1, Ordering::AcqRel);
    }

    /// When the peer last came online
    pub fn connected_since(&self) -> Option<Instant> {
        self.conn_time.lock().ok().and_then(|t| *t)
    }

    pub(crate) fn record_conn_time(&self) {
        if let Ok(mut slot) = self.conn_time.lock() {
            *slot = Some(Instant::now());
        }
    }

    /// Outstanding request table
    pub fn correlator(&self) -> &Arc<MessageCorrelator> {
        &self.correlator
    }

    /// Event sequencer
    pub fn sequencer(&self) -> &Arc<EventSequencer> {
        &self.sequencer
    }

    fn conns(&self) -> MutexGuard<'_, Vec<Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn add_connection(&self, conn: Arc<Connection>) {
        debug!("Peer {} gained connection {}", self.cid, conn.id());
        self.conns().push(conn);
    }

    /// Remove a connection; returns whether it was present
    pub(crate) fn remove_connection(&self, conn: &Connection) -> bool {
        let mut conns = self.conns();
        let before = conns.len();
        conns.retain(|c| c.id() != conn.id());
        before != conns.len()
    }

    pub(crate) fn take_connections(&self) -> Vec<Arc<Connection>> {
        std::mem::take(&mut *self.conns())
    }

    /// Make `conn` the working connection of its role.
    ///
    /// Any other working connection of the same role is stopped and returned
    /// so the caller can close it.
    pub(crate) fn promote(&self, conn: &Arc<Connection>) -> Vec<Arc<Connection>> {
        let mut conns = self.conns();
        let mut replaced = Vec::new();
        conns.retain(|c| {
            if c.id() != conn.id() && c.role() == conn.role() && c.is_working() {
                c.set_status(ConnStatus::Stopped);
                replaced.push(Arc::clone(c));
                false
            } else {
                true
            }
        });
        conn.set_status(ConnStatus::Working);
        replaced
    }

    /// Move every negotiating connection to working (legacy peers skip ACK)
    pub(crate) fn promote_negotiating(&self) -> usize {
        let conns = self.conns();
        let mut promoted = 0;
        for conn in conns.iter() {
            if conn.transition(ConnStatus::WaitRequest, ConnStatus::Working)
                || conn.transition(ConnStatus::WaitResponse, ConnStatus::Working)
            {
                promoted += 1;
            }
        }
        promoted
    }

    /// Working connection to send on, primary role first
    pub fn working_connection(&self) -> Option<Arc<Connection>> {
        let conns = self.conns();
        [LinkRole::Primary, LinkRole::PeerToPeer]
            .iter()
            .find_map(|role| {
                conns
                    .iter()
                    .find(|c| c.role() == *role && c.is_working())
                    .cloned()
            })
    }

    /// Number of connections in any state
    pub fn connection_count(&self) -> usize {
        self.conns().len()
    }

    /// Number of working connections
    pub fn working_count(&self) -> usize {
        self.conns().iter().filter(|c| c.is_working()).count()
    }

    /// Summary for status output
    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            cid: self.cid.clone(),
            device_id: self.device_id,
            iid: self.iid(),
            version: self.version(),
            status: self.status(),
            features: self.features(),
            connections: self.connection_count(),
            pending_requests: self.correlator.pending(),
            event_seq: self.sequencer.current_sequence(),
        }
    }
}
