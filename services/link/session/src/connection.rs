//! One byte stream to a peer and its negotiated state.

use bytes::BytesMut;
use link_wire::{CryptoCaps, WireMessage};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::crypto::SessionKeys;
use crate::transport::IoStream;
use crate::LinkError;

/// Connection lifecycle
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnStatus {
    /// Accepted, waiting for the initiator's REQUEST
    WaitRequest = 0,
    /// REQUEST sent, waiting for RESPONSE
    WaitResponse = 1,
    /// Negotiated; carries commands
    Working = 2,
    /// Closed or failed; never reused
    Stopped = 3,
    /// RESPONSE sent, waiting for ACK
    WaitAck = 4,
    /// Negotiation aborted
    NegotiationFailed = 5,
}

impl ConnStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnStatus::WaitRequest,
            1 => ConnStatus::WaitResponse,
            2 => ConnStatus::Working,
            4 => ConnStatus::WaitAck,
            5 => ConnStatus::NegotiationFailed,
            _ => ConnStatus::Stopped,
        }
    }

    /// Whether the handshake on this connection is still running
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            ConnStatus::WaitRequest | ConnStatus::WaitResponse | ConnStatus::WaitAck
        )
    }
}

/// Transport role of a connection; at most one working connection per role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkRole {
    /// Main stream transport
    Primary,
    /// Alternate peer-to-peer transport, used when no primary link works
    PeerToPeer,
}

/// Counters of a connection
#[derive(Debug, Default)]
pub struct ConnectionStats {
    send_bytes: AtomicU64,
    send_messages: AtomicU64,
    recv_bytes: AtomicU64,
    recv_messages: AtomicU64,
}

/// Point-in-time copy of [`ConnectionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStatsSnapshot {
    /// Bytes written
    pub send_bytes: u64,
    /// Messages written
    pub send_messages: u64,
    /// Bytes read
    pub recv_bytes: u64,
    /// Messages read
    pub recv_messages: u64,
}

impl ConnectionStats {
    pub(crate) fn record_send(&self, bytes: usize) {
        self.send_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.send_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recv(&self, bytes: usize) {
        self.recv_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.recv_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters
    pub fn snapshot(&self) -> ConnectionStatsSnapshot {
        ConnectionStatsSnapshot {
            send_bytes: self.send_bytes.load(Ordering::Relaxed),
            send_messages: self.send_messages.load(Ordering::Relaxed),
            recv_bytes: self.recv_bytes.load(Ordering::Relaxed),
            recv_messages: self.recv_messages.load(Ordering::Relaxed),
        }
    }
}

/// Alternate transport endpoint learned from the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportParams {
    /// UDP port, 0 when the peer has none
    pub udp_port: u16,
    /// Protocol version of the alternate transport
    pub version: u8,
}

/// A negotiated (or negotiating) stream to a peer
#[derive(Debug)]
pub struct Connection {
    id: u64,
    role: LinkRole,
    initiator: bool,
    remote: String,
    status: AtomicU8,
    crypto: AtomicU32,
    device_class: AtomicU8,
    transport: Mutex<Option<TransportParams>>,
    keys: OnceLock<SessionKeys>,
    writer: tokio::sync::Mutex<Option<WriteHalf<IoStream>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    stop: Notify,
    status_changed: Notify,
    max_message_size: usize,
    created: Instant,
    stats: ConnectionStats,
}

impl Connection {
    /// Create a connection around the write half of a stream
    pub(crate) fn new(
        id: u64,
        role: LinkRole,
        initiator: bool,
        remote: String,
        writer: WriteHalf<IoStream>,
        max_message_size: usize,
    ) -> Self {
        let status = if initiator {
            ConnStatus::WaitResponse
        } else {
            ConnStatus::WaitRequest
        };
        Self {
            id,
            role,
            initiator,
            remote,
            status: AtomicU8::new(status as u8),
            crypto: AtomicU32::new(0),
            device_class: AtomicU8::new(0),
            transport: Mutex::new(None),
            keys: OnceLock::new(),
            writer: tokio::sync::Mutex::new(Some(writer)),
            reader: Mutex::new(None),
            stop: Notify::new(),
            status_changed: Notify::new(),
            max_message_size,
            created: Instant::now(),
            stats: ConnectionStats::default(),
        }
    }

    /// Local connection id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Transport role
    pub fn role(&self) -> LinkRole {
        self.role
    }

    /// Whether this side dialed and sent REQUEST
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Remote end for logs
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Current status
    pub fn status(&self) -> ConnStatus {
        ConnStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Overwrite the status
    pub fn set_status(&self, status: ConnStatus) {
        self.status.store(status as u8, Ordering::Release);
        self.status_changed.notify_waiters();
    }

    /// Move from `from` to `to` if still in `from`
    pub fn transition(&self, from: ConnStatus, to: ConnStatus) -> bool {
        let moved = self
            .status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            self.status_changed.notify_waiters();
        }
        moved
    }

    /// Wait until the handshake settles, up to `limit`; returns the settled status
    pub async fn wait_negotiated(&self, limit: Duration) -> Result<ConnStatus, LinkError> {
        let settled = async {
            loop {
                let changed = self.status_changed.notified();
                tokio::pin!(changed);
                changed.as_mut().enable();
                let status = self.status();
                if !status.is_negotiating() {
                    return status;
                }
                changed.await;
            }
        };
        tokio::time::timeout(limit, settled)
            .await
            .map_err(|_| LinkError::Timeout)
    }

    /// Whether the connection carries commands
    pub fn is_working(&self) -> bool {
        self.status() == ConnStatus::Working
    }

    /// Crypto suites the peer offered
    pub fn remote_crypto(&self) -> CryptoCaps {
        CryptoCaps::from_bits_retain(self.crypto.load(Ordering::Acquire))
    }

    pub(crate) fn set_remote_crypto(&self, caps: CryptoCaps) {
        self.crypto.store(caps.bits(), Ordering::Release);
    }

    /// Device class the peer announced
    pub fn remote_device_class(&self) -> u8 {
        self.device_class.load(Ordering::Acquire)
    }

    pub(crate) fn set_remote_device_class(&self, class: u8) {
        self.device_class.store(class, Ordering::Release);
    }

    /// Alternate transport the peer announced
    pub fn transport_params(&self) -> Option<TransportParams> {
        self.transport.lock().ok().and_then(|params| *params)
    }

    pub(crate) fn set_transport_params(&self, params: TransportParams) {
        if let Ok(mut slot) = self.transport.lock() {
            *slot = Some(params);
        }
    }

    /// Install keys; fails if this connection already has keys
    pub fn install_keys(&self, keys: SessionKeys) -> Result<(), LinkError> {
        self.keys
            .set(keys)
            .map_err(|_| LinkError::Negotiation("link keys already installed".to_string()))
    }

    /// Negotiated keys, if any
    pub fn keys(&self) -> Option<&SessionKeys> {
        self.keys.get()
    }

    /// Age of the connection
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Traffic counters
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Write one message
    pub async fn send(&self, message: &WireMessage) -> Result<(), LinkError> {
        if self.status() == ConnStatus::Stopped {
            return Err(LinkError::Transport(format!(
                "connection {} is stopped",
                self.id
            )));
        }

        let bytes = message.encode(self.max_message_size)?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            LinkError::Transport(format!("connection {} has no writer", self.id))
        })?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        drop(guard);

        self.stats.record_send(bytes.len());
        trace!(
            "Sent {} bytes (op {}) on connection {}",
            bytes.len(),
            message.header.operation,
            self.id
        );
        Ok(())
    }

    pub(crate) fn attach_reader(&self, handle: JoinHandle<()>) {
        if let Ok(mut slot) = self.reader.lock() {
            *slot = Some(handle);
        }
    }

    /// Resolves once [`shutdown`](Self::shutdown) was requested
    pub(crate) async fn stopped(&self) {
        self.stop.notified().await
    }

    /// Stop the connection: mark it stopped, close the writer, wake the reader
    pub async fn shutdown(&self) {
        self.set_status(ConnStatus::Stopped);
        self.stop.notify_one();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        debug!("Connection {} to {} shut down", self.id, self.remote);
    }

    /// Wait for the reader task to finish, up to `limit`
    pub(crate) async fn join_reader(&self, limit: Duration) {
        let handle = self.reader.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if tokio::time::timeout(limit, handle).await.is_err() {
                debug!("Reader of connection {} still running after {:?}", self.id, limit);
            }
        }
    }
}

/// Fresh read buffer for a connection
pub(crate) fn read_buffer() -> BytesMut {
    BytesMut::with_capacity(16 * 1024)
}
