//! Per-mount link node.
//!
//! [`LinkNode`] owns the peer registry and is the only surface other layers
//! talk to: they register event callbacks, hand it streams to negotiate over,
//! and send commands by peer id. Everything below it (connections, the
//! correlation table, event ordering, reconnects) is driven from here.
//!
//! Each connection gets one reader task. Readers decode envelopes and route
//! them: handshake steps go to the [`HandshakeNegotiator`], responses to the
//! peer's [`MessageCorrelator`], requests to a spawned dispatch task.
//! A reader never runs event callbacks or observer hooks; handshake
//! completion and failure are finished on a spawned task.

use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use link_wire::{
    Command, EchoParam, Flags, HandshakePayload, HandshakeStep, MessageDecoder, TimeoutClass,
    WireHeader, WireMessage, MAX_DEVICE_ID_LEN, MAX_VERSION, VERSION_LEGACY,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::connection::{read_buffer, ConnStatus, Connection, LinkRole};
use crate::correlator::Continuation;
use crate::event::{CallbackMode, EventCallbackRegistry, EventContext, EventKind};
use crate::handshake::{HandshakeContext, HandshakeNegotiator, HandshakeOutcome};
use crate::observer::{LinkObserver, LoggingObserver, RequestHandler};
use crate::peer::{Peer, PeerSnapshot, PeerStatus};
use crate::reconnect::{Connector, ReconnectManager, ReconnectPolicy, TcpConnector};
use crate::stats::ResponseStats;
use crate::transport::IoStream;
use crate::{LinkConfig, LinkError, EINVAL, EOPNOTSUPP};

/// Builder for [`LinkNode`]
#[derive(Debug)]
pub struct LinkNodeBuilder {
    config: LinkConfig,
    handler: Option<Arc<dyn RequestHandler>>,
    observer: Option<Arc<dyn LinkObserver>>,
    connector: Option<Arc<dyn Connector>>,
    negotiator: Option<HandshakeNegotiator>,
}

impl LinkNodeBuilder {
    /// Start from `config`
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            handler: None,
            observer: None,
            connector: None,
            negotiator: None,
        }
    }

    /// Serve inbound commands with `handler`
    pub fn request_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Report lifecycle notifications to `observer`
    pub fn observer(mut self, observer: Arc<dyn LinkObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Re-dial failed peers through `connector`
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Convenience for a [`TcpConnector`]
    pub fn tcp_connector(self, connector: Arc<TcpConnector>) -> Self {
        self.connector(connector)
    }

    /// Negotiate with a custom extension registry
    pub fn negotiator(mut self, negotiator: HandshakeNegotiator) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    /// Validate the configuration and create the node
    pub fn build(self) -> Result<LinkNode, LinkError> {
        let config = self.config;
        if config.device_id.is_empty() || config.device_id.len() > MAX_DEVICE_ID_LEN {
            return Err(LinkError::Invalid(format!(
                "device id must be 1..={} bytes",
                MAX_DEVICE_ID_LEN
            )));
        }
        if !(VERSION_LEGACY..=MAX_VERSION).contains(&config.protocol_version) {
            return Err(LinkError::Invalid(format!(
                "protocol version {} unsupported",
                config.protocol_version
            )));
        }

        let reconnect = ReconnectManager::new(ReconnectPolicy::from_config(&config), self.connector);
        info!(
            "Link node {} ready (version {}, iid {})",
            config.device_id, config.protocol_version, config.iid
        );
        Ok(LinkNode {
            inner: Arc::new(NodeInner {
                config,
                peers: RwLock::new(HashMap::new()),
                next_device_id: AtomicU64::new(1),
                next_conn_id: AtomicU64::new(1),
                hs_correlation: AtomicU16::new(1),
                callbacks: Arc::new(EventCallbackRegistry::new()),
                negotiator: self.negotiator.unwrap_or_default(),
                handler: self.handler,
                observer: self.observer.unwrap_or_else(|| Arc::new(LoggingObserver)),
                reconnect,
                stats: Arc::new(ResponseStats::new()),
            }),
        })
    }
}

/// Handle to a running link node; cheap to clone
#[derive(Debug, Clone)]
pub struct LinkNode {
    inner: Arc<NodeInner>,
}

#[derive(Debug)]
pub(crate) struct NodeInner {
    pub(crate) config: LinkConfig,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    next_device_id: AtomicU64,
    next_conn_id: AtomicU64,
    hs_correlation: AtomicU16,
    callbacks: Arc<EventCallbackRegistry>,
    negotiator: HandshakeNegotiator,
    handler: Option<Arc<dyn RequestHandler>>,
    observer: Arc<dyn LinkObserver>,
    pub(crate) reconnect: ReconnectManager,
    stats: Arc<ResponseStats>,
}

impl LinkNode {
    /// Node configuration
    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    /// Response statistics across all peers
    pub fn stats(&self) -> &Arc<ResponseStats> {
        &self.inner.stats
    }

    /// Reconnect state
    pub fn reconnect(&self) -> &ReconnectManager {
        &self.inner.reconnect
    }

    /// Register a peer event callback
    pub fn register_event_callback<F>(
        &self,
        kind: EventKind,
        mode: CallbackMode,
        min_version: u8,
        name: impl Into<String>,
        func: F,
    ) -> Result<(), LinkError>
    where
        F: Fn(&EventContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .register(kind, mode, min_version, name, func)
    }

    /// Look up a peer, creating it (and raising ADD) on first contact
    pub async fn get_or_create_peer(&self, peer_cid: &str) -> Result<Arc<Peer>, LinkError> {
        self.inner.get_or_create_peer(peer_cid).await
    }

    /// Look up a known peer
    pub async fn find_peer(&self, peer_cid: &str) -> Option<Arc<Peer>> {
        self.inner.find_peer(peer_cid).await
    }

    /// Snapshot of every known peer
    pub async fn peers(&self) -> Vec<PeerSnapshot> {
        let peers = self.inner.peers.read().await;
        let mut snapshots: Vec<PeerSnapshot> = peers.values().map(|p| p.snapshot()).collect();
        snapshots.sort_by(|a, b| a.cid.cmp(&b.cid));
        snapshots
    }

    /// Disconnect and forget a peer, raising DEL
    pub async fn del_peer(&self, peer_cid: &str) -> Result<(), LinkError> {
        let peer = self
            .inner
            .find_peer(peer_cid)
            .await
            .ok_or(LinkError::NotReachable)?;
        if peer.status() != PeerStatus::Offline || peer.connection_count() > 0 {
            self.inner.disconnect(&peer, "peer deleted").await;
        }
        self.inner.peers.write().await.remove(peer_cid);
        peer.sequencer().raise(EventKind::Del).await;
        info!("Deleted peer {}", peer_cid);
        Ok(())
    }

    /// Take a peer offline: stop its connections and fail its pending requests
    pub async fn disconnect_peer(&self, peer_cid: &str) -> Result<(), LinkError> {
        let peer = self
            .inner
            .find_peer(peer_cid)
            .await
            .ok_or(LinkError::NotReachable)?;
        self.inner.disconnect(&peer, "disconnect requested").await;
        Ok(())
    }

    /// Take every peer offline
    pub async fn connections_stop(&self) {
        let peers: Vec<Arc<Peer>> = self.inner.peers.read().await.values().cloned().collect();
        info!("Stopping connections to {} peers", peers.len());
        join_all(
            peers
                .iter()
                .map(|peer| self.inner.disconnect(peer, "node stopping")),
        )
        .await;
    }

    /// Dial `addr` over TCP and negotiate with `peer_cid`
    pub async fn connect(
        &self,
        peer_cid: &str,
        addr: std::net::SocketAddr,
    ) -> Result<Arc<Connection>, LinkError> {
        let stream = crate::transport::connect_tcp(addr).await?;
        self.attach(peer_cid, stream, LinkRole::Primary).await
    }

    /// Start negotiating with `peer_cid` over an already open stream
    pub async fn attach(
        &self,
        peer_cid: &str,
        stream: IoStream,
        role: LinkRole,
    ) -> Result<Arc<Connection>, LinkError> {
        let peer = self.inner.get_or_create_peer(peer_cid).await?;
        self.inner.initiate(&peer, stream, role).await
    }

    /// Negotiate over an inbound stream; the peer is named by its REQUEST
    pub async fn accept(&self, stream: IoStream, role: LinkRole) -> Result<Arc<Peer>, LinkError> {
        self.inner.accept(stream, role).await
    }

    /// Accept TCP connections until the listener fails
    pub async fn serve(&self, listener: TcpListener) -> Result<(), LinkError> {
        let local = listener.local_addr()?;
        info!("Link node {} listening on {}", self.inner.config.device_id, local);
        loop {
            let (stream, addr) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set nodelay for {}: {}", addr, e);
            }
            let node = self.clone();
            tokio::spawn(async move {
                match node.accept(IoStream::Plain(stream), LinkRole::Primary).await {
                    Ok(peer) => debug!("Accepted connection from {} for peer {}", addr, peer.cid()),
                    Err(e) => warn!("Rejected connection from {}: {}", addr, e),
                }
            });
        }
    }

    /// Send a command and wait for its response.
    ///
    /// `timeout` overrides the command's class deadline. Commands that take
    /// no response are rejected with `Invalid`; use [`send_oneway`](Self::send_oneway).
    pub async fn send_request(
        &self,
        peer_cid: &str,
        command: Command,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> Result<Bytes, LinkError> {
        let inner = &self.inner;
        let deadline = inner.deadline_for(command, timeout)?;
        let peer = inner.reachable_peer(peer_cid).await?;
        let version = peer.version();
        let correlator = Arc::clone(peer.correlator());

        let mut ticket = correlator.register_sync(version, command as u8)?;
        let mut header = WireHeader::request(command as u8, version, inner.config.iid);
        header.set_correlation_id(ticket.id, version);
        let message = inner.checked_message(header, payload)?;

        if let Err(e) = inner.transmit(&peer, &message).await {
            correlator.cancel(ticket);
            return Err(e);
        }
        ticket.sent();
        correlator.wait(ticket, deadline).await
    }

    /// Send a command whose response is handed to `continuation`.
    ///
    /// The continuation runs exactly once (response, deadline or peer
    /// offline) unless this call returns an error.
    pub async fn send_request_async(
        &self,
        peer_cid: &str,
        command: Command,
        payload: Bytes,
        deadline: Option<Duration>,
        continuation: Continuation,
    ) -> Result<(), LinkError> {
        let inner = &self.inner;
        let deadline = inner.deadline_for(command, deadline)?;
        let peer = inner.reachable_peer(peer_cid).await?;
        let version = peer.version();
        let correlator = Arc::clone(peer.correlator());

        let ticket = correlator.register_async(version, command as u8, continuation)?;
        let mut header = WireHeader::request(command as u8, version, inner.config.iid);
        header.set_correlation_id(ticket.id, version);
        let sent = match inner.checked_message(header, payload) {
            Ok(message) => inner.transmit(&peer, &message).await,
            Err(e) => Err(e),
        };

        match sent {
            Ok(()) => {
                correlator.arm(ticket, deadline);
                Ok(())
            }
            Err(e) => {
                if correlator.abandon(ticket) {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Send a command that takes no response
    pub async fn send_oneway(
        &self,
        peer_cid: &str,
        command: Command,
        payload: Bytes,
    ) -> Result<(), LinkError> {
        if command.timeout_class() != TimeoutClass::None {
            return Err(LinkError::Invalid(format!(
                "{:?} expects a response",
                command
            )));
        }
        let inner = &self.inner;
        let peer = inner.reachable_peer(peer_cid).await?;
        let header = WireHeader::request(command as u8, peer.version(), inner.config.iid);
        let message = inner.checked_message(header, payload)?;
        inner.transmit(&peer, &message).await
    }

    /// Whether `peer_cid` is online with a working connection
    pub async fn peer_is_reachable(&self, peer_cid: &str) -> bool {
        match self.inner.find_peer(peer_cid).await {
            Some(peer) => peer.is_online() && peer.working_connection().is_some(),
            None => false,
        }
    }

    /// Event sequence of `peer_cid`; changes whenever its link state does
    pub async fn current_event_sequence(&self, peer_cid: &str) -> Option<u64> {
        self.inner
            .find_peer(peer_cid)
            .await
            .map(|peer| peer.sequencer().current_sequence())
    }

    /// Round trip an echo; returns the peer's instance id
    pub async fn echo(&self, peer_cid: &str) -> Result<u64, LinkError> {
        let body = EchoParam::new(self.inner.config.iid).encode();
        let reply = self
            .send_request(peer_cid, Command::ConnectEcho, body, None)
            .await?;
        let param = EchoParam::decode(&reply)?;
        if let Some(peer) = self.inner.find_peer(peer_cid).await {
            peer.set_iid(param.iid);
        }
        Ok(param.iid)
    }

    /// Echo without waiting; `done` receives the peer's instance id
    pub async fn echo_async<F>(&self, peer_cid: &str, done: F) -> Result<(), LinkError>
    where
        F: FnOnce(Result<u64, LinkError>) + Send + 'static,
    {
        let peer = self.inner.reachable_peer(peer_cid).await?;
        let body = EchoParam::new(self.inner.config.iid).encode();
        let continuation: Continuation = Box::new(move |outcome| {
            let result = outcome
                .and_then(|reply| EchoParam::decode(&reply).map_err(LinkError::from))
                .map(|param| {
                    peer.set_iid(param.iid);
                    param.iid
                });
            done(result)
        });
        self.send_request_async(peer_cid, Command::ConnectEcho, body, None, continuation)
            .await
    }
}

impl NodeInner {
    pub(crate) fn observer(&self) -> &Arc<dyn LinkObserver> {
        &self.observer
    }

    async fn find_peer(&self, peer_cid: &str) -> Option<Arc<Peer>> {
        self.peers.read().await.get(peer_cid).cloned()
    }

    async fn get_or_create_peer(&self, peer_cid: &str) -> Result<Arc<Peer>, LinkError> {
        if peer_cid.is_empty() || peer_cid.len() > MAX_DEVICE_ID_LEN {
            return Err(LinkError::Invalid(format!(
                "peer id must be 1..={} bytes",
                MAX_DEVICE_ID_LEN
            )));
        }

        let peer = {
            let mut peers = self.peers.write().await;
            if let Some(peer) = peers.get(peer_cid) {
                return Ok(Arc::clone(peer));
            }
            let device_id = self.next_device_id.fetch_add(1, Ordering::Relaxed);
            let peer = Arc::new(Peer::new(
                peer_cid,
                device_id,
                &self.config,
                Arc::clone(&self.callbacks),
                Arc::clone(&self.stats),
            ));
            peers.insert(peer_cid.to_string(), Arc::clone(&peer));
            peer
        };

        info!("Added peer {} (device {})", peer_cid, peer.device_id());
        peer.sequencer().raise(EventKind::Add).await;
        Ok(peer)
    }

    async fn reachable_peer(&self, peer_cid: &str) -> Result<Arc<Peer>, LinkError> {
        let peer = self
            .find_peer(peer_cid)
            .await
            .ok_or(LinkError::NotReachable)?;
        if peer.status() == PeerStatus::Offline {
            debug!("Peer {} is offline", peer_cid);
            return Err(LinkError::Again);
        }
        Ok(peer)
    }

    fn deadline_for(&self, command: Command, timeout: Option<Duration>) -> Result<Duration, LinkError> {
        let class = command
            .timeout_class()
            .duration(self.config.common_timeout)
            .ok_or_else(|| {
                LinkError::Invalid(format!("{:?} takes no response", command))
            })?;
        Ok(timeout.unwrap_or(class))
    }

    fn checked_message(&self, header: WireHeader, payload: Bytes) -> Result<WireMessage, LinkError> {
        let message = WireMessage::new(header, payload);
        if message.encoded_size() > self.config.max_message_size {
            return Err(LinkError::Invalid(format!(
                "message of {} bytes exceeds limit {}",
                message.encoded_size(),
                self.config.max_message_size
            )));
        }
        Ok(message)
    }

    /// Write on the best working connection, failing over until none is left
    async fn transmit(self: &Arc<Self>, peer: &Arc<Peer>, message: &WireMessage) -> Result<(), LinkError> {
        while peer.status() != PeerStatus::Offline {
            let Some(conn) = peer.working_connection() else {
                break;
            };
            match conn.send(message).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transport() => {
                    self.reconnect.on_link_failure(self, peer, &conn, &e);
                }
                Err(e) => return Err(e),
            }
        }
        self.observer
            .notify_offline(peer.cid(), "no working connection");
        debug!("No working connection to peer {}", peer.cid());
        Err(LinkError::Again)
    }

    fn open_connection(
        &self,
        peer: &Arc<Peer>,
        stream: IoStream,
        role: LinkRole,
        initiator: bool,
    ) -> (Arc<Connection>, ReadHalf<IoStream>) {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let remote = stream.describe_remote();
        let (reader, writer) = tokio::io::split(stream);
        let conn = Arc::new(Connection::new(
            id,
            role,
            initiator,
            remote,
            writer,
            self.config.max_message_size,
        ));
        peer.add_connection(Arc::clone(&conn));
        (conn, reader)
    }

    fn spawn_reader(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        conn: &Arc<Connection>,
        reader: ReadHalf<IoStream>,
        buffered: BytesMut,
    ) {
        let node = Arc::clone(self);
        let task_peer = Arc::clone(peer);
        let task_conn = Arc::clone(conn);
        let handle = tokio::spawn(async move {
            node.read_loop(task_peer, task_conn, reader, buffered).await;
        });
        conn.attach_reader(handle);
    }

    async fn initiate(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        stream: IoStream,
        role: LinkRole,
    ) -> Result<Arc<Connection>, LinkError> {
        let (conn, reader) = self.open_connection(peer, stream, role, true);
        self.spawn_reader(peer, &conn, reader, read_buffer());

        let correlation = self.hs_correlation.fetch_add(1, Ordering::Relaxed);
        let ctx = HandshakeContext {
            config: &self.config,
            peer,
            conn: &conn,
        };
        if let Err(e) = self
            .negotiator
            .send(&ctx, HandshakeStep::Request, correlation)
            .await
        {
            warn!("Failed to open handshake with peer {}: {}", peer.cid(), e);
            peer.remove_connection(&conn);
            conn.shutdown().await;
            return Err(e);
        }
        Ok(conn)
    }

    /// Dial-side handshake that waits until the connection works
    pub(crate) async fn establish(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        stream: IoStream,
        role: LinkRole,
    ) -> Result<(), LinkError> {
        let conn = self.initiate(peer, stream, role).await?;
        match conn.wait_negotiated(self.config.handshake_timeout).await {
            Ok(ConnStatus::Working) => Ok(()),
            Ok(_) => {
                peer.remove_connection(&conn);
                Err(LinkError::Negotiation(format!(
                    "connection {} closed during handshake",
                    conn.id()
                )))
            }
            Err(e) => {
                peer.remove_connection(&conn);
                conn.shutdown().await;
                Err(e)
            }
        }
    }

    async fn accept(self: &Arc<Self>, mut stream: IoStream, role: LinkRole) -> Result<Arc<Peer>, LinkError> {
        let mut decoder = MessageDecoder::with_max_size(self.config.max_message_size);
        let mut buffer = read_buffer();
        let first = tokio::time::timeout(
            self.config.handshake_timeout,
            recv_first_message(&mut stream, &mut decoder, &mut buffer),
        )
        .await
        .map_err(|_| LinkError::Timeout)??;

        let header = &first.header;
        if !header.is_handshake() || header.operation != HandshakeStep::Request as u8 {
            return Err(LinkError::Negotiation(format!(
                "expected handshake REQUEST, got op {}",
                header.operation
            )));
        }
        let hello = HandshakePayload::decode(first.payload.clone())?;
        let peer = self.get_or_create_peer(&hello.device_id).await?;

        let (conn, reader) = self.open_connection(&peer, stream, role, false);
        conn.stats().record_recv(first.encoded_size());
        self.handle_message(&peer, &conn, first).await;
        if matches!(
            conn.status(),
            ConnStatus::Stopped | ConnStatus::NegotiationFailed
        ) {
            return Err(LinkError::Negotiation(format!(
                "handshake with peer {} failed",
                peer.cid()
            )));
        }
        self.spawn_reader(&peer, &conn, reader, buffer);
        Ok(peer)
    }

    async fn read_loop(
        self: Arc<Self>,
        peer: Arc<Peer>,
        conn: Arc<Connection>,
        mut reader: ReadHalf<IoStream>,
        mut buffer: BytesMut,
    ) {
        let mut decoder = MessageDecoder::with_max_size(self.config.max_message_size);
        let failure = loop {
            if conn.status() == ConnStatus::Stopped {
                break None;
            }
            match decoder.decode(&mut buffer) {
                Ok(Some(message)) => {
                    conn.stats().record_recv(message.encoded_size());
                    self.handle_message(&peer, &conn, message).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => break Some(LinkError::Transport(format!("undecodable stream: {}", e))),
            }

            tokio::select! {
                _ = conn.stopped() => break None,
                read = reader.read_buf(&mut buffer) => match read {
                    Ok(0) => break Some(LinkError::Transport("connection closed by peer".to_string())),
                    Ok(_) => {}
                    Err(e) => break Some(e.into()),
                },
            }
        };

        match failure {
            Some(e) => self.reconnect.on_link_failure(&self, &peer, &conn, &e),
            None => debug!("Reader of connection {} stopped", conn.id()),
        }
    }

    async fn handle_message(self: &Arc<Self>, peer: &Arc<Peer>, conn: &Arc<Connection>, message: WireMessage) {
        if message.header.is_handshake() {
            self.handle_handshake(peer, conn, &message).await;
            return;
        }
        if !conn.is_working() {
            debug!(
                "Dropping op {} on connection {} in {:?}",
                message.header.operation,
                conn.id(),
                conn.status()
            );
            return;
        }

        let header = message.header;
        let command = match Command::try_from(header.operation) {
            Ok(command) => command,
            Err(e) => {
                info!("Dropping message from peer {}: {}", peer.cid(), e);
                return;
            }
        };
        let remote_error = header.flags.contains(Flags::REMOTE_ERROR);
        if !remote_error {
            if let Err(e) = command.verify(header.is_response(), message.payload.len()) {
                info!("Message from peer {} abandoned: {}", peer.cid(), e);
                return;
            }
        }

        if header.is_response() {
            let outcome = if remote_error {
                match <[u8; 4]>::try_from(message.payload.as_ref()) {
                    Ok(code) => Err(LinkError::Remote(i32::from_le_bytes(code))),
                    Err(_) => {
                        info!("Malformed remote error from peer {} abandoned", peer.cid());
                        return;
                    }
                }
            } else {
                Ok(message.payload)
            };
            if let Err(e) = peer
                .correlator()
                .on_response(peer.version(), &header, outcome)
                .await
            {
                debug!("Response from peer {} not delivered: {}", peer.cid(), e);
            }
            return;
        }

        let node = Arc::clone(self);
        let peer = Arc::clone(peer);
        tokio::spawn(async move {
            node.dispatch(peer, command, header, message.payload).await;
        });
    }

    async fn handle_handshake(self: &Arc<Self>, peer: &Arc<Peer>, conn: &Arc<Connection>, message: &WireMessage) {
        let ctx = HandshakeContext {
            config: &self.config,
            peer,
            conn,
        };
        match self.negotiator.receive(&ctx, message).await {
            HandshakeOutcome::Replied | HandshakeOutcome::Ignored => {}
            outcome => self.spawn_handshake_settle(peer, conn, outcome),
        }
    }

    fn spawn_handshake_settle(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        conn: &Arc<Connection>,
        outcome: HandshakeOutcome,
    ) {
        let node = Arc::clone(self);
        let peer = Arc::clone(peer);
        let conn = Arc::clone(conn);
        tokio::spawn(async move {
            match outcome {
                HandshakeOutcome::Completed { replaced } => {
                    for old in replaced {
                        old.shutdown().await;
                        node.observer.notify_connection_closed(peer.cid(), old.id());
                    }
                    if let Some(params) = conn.transport_params() {
                        node.observer.notify_transport_params(peer.cid(), params);
                    }
                    // torn down again before we got here
                    if conn.is_working() {
                        node.peer_online(&peer).await;
                    }
                }
                HandshakeOutcome::Failed(e) => {
                    node.observer.notify_offline(peer.cid(), &e.to_string());
                    peer.remove_connection(&conn);
                    conn.shutdown().await;
                }
                HandshakeOutcome::Replied | HandshakeOutcome::Ignored => {}
            }
        });
    }

    async fn peer_online(&self, peer: &Arc<Peer>) {
        peer.correlator().resume();
        let previous = peer.swap_status(PeerStatus::Online);
        if previous != PeerStatus::Online {
            peer.record_conn_time();
            info!(
                "Peer {} online (version {}, features {:#x})",
                peer.cid(),
                peer.version(),
                peer.features()
            );
            peer.sequencer().raise(EventKind::Online).await;
            self.observer.notify_handshake_done(peer.cid());
        }
    }

    async fn dispatch(self: Arc<Self>, peer: Arc<Peer>, command: Command, request: WireHeader, payload: Bytes) {
        let reply = match command {
            Command::ConnectEcho => match EchoParam::decode(&payload) {
                Ok(param) => {
                    peer.set_iid(param.iid);
                    Ok(Some(EchoParam::new(self.config.iid).encode()))
                }
                Err(_) => Err(EINVAL),
            },
            _ => match &self.handler {
                Some(handler) => handler.handle(peer.cid(), command, payload).await,
                None => {
                    debug!("No handler for {:?} from peer {}", command, peer.cid());
                    Err(EOPNOTSUPP)
                }
            },
        };
        if command.timeout_class() == TimeoutClass::None {
            return;
        }

        let mut header = WireHeader::response_to(&request, peer.version(), self.config.iid);
        let body = match reply {
            Ok(Some(body)) => body,
            Ok(None) => return,
            Err(code) => {
                header.flags |= Flags::REMOTE_ERROR;
                Bytes::copy_from_slice(&code.to_le_bytes())
            }
        };
        let message = WireMessage::new(header, body);
        if let Err(e) = self.transmit(&peer, &message).await {
            debug!("Failed to answer {:?} from peer {}: {}", command, peer.cid(), e);
        }
    }

    /// Take `peer` offline and release everything it holds
    pub(crate) async fn disconnect(&self, peer: &Arc<Peer>, reason: &str) {
        peer.sequencer().bump_sequence();
        let previous = peer.swap_status(PeerStatus::Offline);
        peer.set_features(0);
        self.reconnect.cancel(peer.cid());

        let conns = peer.take_connections();
        join_all(conns.iter().map(|conn| conn.shutdown())).await;
        for conn in &conns {
            conn.join_reader(self.config.release_wait).await;
            self.observer.notify_connection_closed(peer.cid(), conn.id());
        }

        let drained = peer.correlator().drain().await;
        if !peer.correlator().wait_idle(self.config.release_wait).await {
            error!(
                "Senders to peer {} still in flight after {:?}",
                peer.cid(),
                self.config.release_wait
            );
        }
        peer.bump_cookie();
        info!(
            "Peer {} offline: {} ({} connections closed, {} requests failed)",
            peer.cid(),
            reason,
            conns.len(),
            drained
        );

        if previous != PeerStatus::Offline {
            peer.sequencer().raise(EventKind::Offline).await;
            self.observer.notify_offline(peer.cid(), reason);
        }
    }
}

/// Read until one whole message is buffered
async fn recv_first_message(
    stream: &mut IoStream,
    decoder: &mut MessageDecoder,
    buffer: &mut BytesMut,
) -> Result<WireMessage, LinkError> {
    loop {
        if let Some(message) = decoder.decode(buffer)? {
            return Ok(message);
        }
        if stream.read_buf(buffer).await? == 0 {
            return Err(LinkError::Transport(
                "connection closed before handshake".to_string(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use link_wire::{CryptoCaps, VERSION_EXTENDED};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use tokio::io::AsyncWriteExt;

    fn config(device: &str, iid: u64) -> LinkConfig {
        LinkConfig {
            device_id: device.to_string(),
            iid,
            async_cb_delay: Duration::from_millis(10),
            release_wait: Duration::from_millis(500),
            reconnect_backoff: Duration::from_millis(10),
            ..LinkConfig::default()
        }
    }

    async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = Instant::now();
        while start.elapsed() < limit {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn linked(a: LinkNode, b: LinkNode) -> (LinkNode, LinkNode) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let acceptor = b.clone();
        tokio::spawn(async move { acceptor.accept(IoStream::Memory(right), LinkRole::Primary).await });
        let b_cid = b.config().device_id.clone();
        let a_cid = a.config().device_id.clone();
        a.attach(&b_cid, IoStream::Memory(left), LinkRole::Primary)
            .await
            .unwrap();

        let (na, nb) = (a.clone(), b.clone());
        assert!(
            wait_until(Duration::from_secs(2), || {
                let (na, nb, a_cid, b_cid) = (na.clone(), nb.clone(), a_cid.clone(), b_cid.clone());
                async move { na.peer_is_reachable(&b_cid).await && nb.peer_is_reachable(&a_cid).await }
            })
            .await
        );
        (a, b)
    }

    fn node(config: LinkConfig) -> LinkNode {
        LinkNodeBuilder::new(config).build().unwrap()
    }

    #[derive(Debug)]
    struct SlowHandler;

    #[async_trait]
    impl RequestHandler for SlowHandler {
        async fn handle(&self, _peer: &str, command: Command, payload: Bytes) -> Result<Option<Bytes>, i32> {
            match command {
                Command::Getattr => {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(Some(payload))
                }
                Command::Statfs => Ok(Some(Bytes::from_static(b"stat"))),
                _ => Err(EOPNOTSUPP),
            }
        }
    }

    #[test]
    fn test_builder_validates_config() {
        assert!(LinkNodeBuilder::new(config("", 1)).build().is_err());
        let bad_version = LinkConfig {
            protocol_version: 9,
            ..config("a", 1)
        };
        assert!(LinkNodeBuilder::new(bad_version).build().is_err());
    }

    #[tokio::test]
    async fn test_handshake_brings_both_sides_online() {
        let a = node(LinkConfig {
            features: 0x5,
            ..config("node-a", 1)
        });
        let b = node(LinkConfig {
            features: 0xA,
            crypto_caps: CryptoCaps::KTLS_AES128,
            master_key: Some(b"shared secret".to_vec()),
            ..config("node-b", 2)
        });
        let (a, b) = linked(a, b).await;

        let peer_b = a.find_peer("node-b").await.unwrap();
        assert_eq!(peer_b.features(), 0xA);
        assert_eq!(peer_b.version(), VERSION_EXTENDED);
        assert_eq!(peer_b.iid(), 2);
        let conn = peer_b.working_connection().unwrap();
        assert_eq!(conn.status(), ConnStatus::Working);
        assert_eq!(conn.remote_crypto(), CryptoCaps::KTLS_AES128);

        let peer_a = b.find_peer("node-a").await.unwrap();
        assert_eq!(peer_a.features(), 0x5);
        assert!(peer_a.is_online());
    }

    #[tokio::test]
    async fn test_echo_round_trip_records_iids() {
        let (a, b) = linked(node(config("node-a", 11)), node(config("node-b", 22))).await;
        assert_eq!(a.echo("node-b").await.unwrap(), 22);
        let peer_a = b.find_peer("node-a").await.unwrap();
        assert_eq!(peer_a.iid(), 11);
        assert_eq!(a.stats().command(Command::ConnectEcho as u8).normal, 1);

        let (tx, rx) = tokio::sync::oneshot::channel();
        a.echo_async("node-b", move |result| {
            let _ = tx.send(result);
        })
        .await
        .unwrap();
        assert_eq!(rx.await.unwrap(), Ok(22));
    }

    #[tokio::test]
    async fn test_unhandled_command_returns_remote_error() {
        let (a, _b) = linked(node(config("node-a", 1)), node(config("node-b", 2))).await;
        let result = a
            .send_request("node-b", Command::Statfs, Bytes::new(), None)
            .await;
        assert_eq!(result, Err(LinkError::Remote(EOPNOTSUPP)));
    }

    #[tokio::test]
    async fn test_handler_answers_requests() {
        let a = node(config("node-a", 1));
        let b = LinkNodeBuilder::new(config("node-b", 2))
            .request_handler(Arc::new(SlowHandler))
            .build()
            .unwrap();
        let (a, _b) = linked(a, b).await;
        let reply = a
            .send_request("node-b", Command::Statfs, Bytes::new(), None)
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"stat"));
    }

    #[tokio::test]
    async fn test_send_argument_errors() {
        let a = node(config("node-a", 1));
        assert_eq!(
            a.send_request("ghost", Command::Open, Bytes::new(), None).await,
            Err(LinkError::NotReachable)
        );
        assert!(matches!(
            a.send_request("ghost", Command::Release, Bytes::new(), None).await,
            Err(LinkError::Invalid(_))
        ));
        assert!(matches!(
            a.send_oneway("ghost", Command::Open, Bytes::new()).await,
            Err(LinkError::Invalid(_))
        ));
        assert!(a.get_or_create_peer("").await.is_err());
    }

    #[tokio::test]
    async fn test_oversize_request_releases_its_id() {
        let (a, _b) = linked(
            node(LinkConfig {
                max_message_size: 4096,
                ..config("node-a", 1)
            }),
            node(config("node-b", 2)),
        )
        .await;

        let result = a
            .send_request("node-b", Command::Statfs, Bytes::from(vec![0u8; 8000]), None)
            .await;
        assert!(matches!(result, Err(LinkError::Invalid(_))));
        let peer_b = a.find_peer("node-b").await.unwrap();
        assert_eq!(peer_b.correlator().pending(), 0);
        assert_eq!(peer_b.correlator().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_dropped_sender_releases_its_id() {
        let a = node(config("node-a", 1));
        let b = LinkNodeBuilder::new(config("node-b", 2))
            .request_handler(Arc::new(SlowHandler))
            .build()
            .unwrap();
        let (a, _b) = linked(a, b).await;

        let waiting = tokio::time::timeout(
            Duration::from_millis(100),
            a.send_request("node-b", Command::Getattr, Bytes::new(), Some(Duration::from_secs(30))),
        )
        .await;
        assert!(waiting.is_err());
        let peer_b = a.find_peer("node-b").await.unwrap();
        assert_eq!(peer_b.correlator().pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slow_online_callback_does_not_block_reader() {
        let b = node(config("node-b", 2));
        b.register_event_callback(EventKind::Online, CallbackMode::Sync, VERSION_LEGACY, "slow", |_| {
            std::thread::sleep(Duration::from_millis(800));
            Ok(())
        })
        .unwrap();
        let (a, _b) = linked(node(config("node-a", 1)), b).await;

        let start = Instant::now();
        assert_eq!(a.echo("node-b").await.unwrap(), 2);
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_disconnect_wakes_blocked_sender() {
        let a = node(config("node-a", 1));
        let b = LinkNodeBuilder::new(config("node-b", 2))
            .request_handler(Arc::new(SlowHandler))
            .build()
            .unwrap();
        let (a, _b) = linked(a, b).await;

        let sender = a.clone();
        let blocked = tokio::spawn(async move {
            sender
                .send_request("node-b", Command::Getattr, Bytes::new(), Some(Duration::from_secs(30)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let seq_before = a.current_event_sequence("node-b").await.unwrap();
        a.disconnect_peer("node-b").await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), blocked)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(LinkError::NotReachable));
        assert!(a.current_event_sequence("node-b").await.unwrap() > seq_before);
        assert!(!a.peer_is_reachable("node-b").await);
        assert_eq!(
            a.send_request("node-b", Command::Open, Bytes::new(), None).await,
            Err(LinkError::Again)
        );
    }

    #[tokio::test]
    async fn test_lost_link_without_connector_goes_offline() {
        let a = node(config("node-a", 1));
        let offline = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&offline);
        a.register_event_callback(EventKind::Offline, CallbackMode::Sync, VERSION_LEGACY, "count", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        let (a, b) = linked(a, node(config("node-b", 2))).await;

        b.connections_stop().await;
        let peer_b = a.find_peer("node-b").await.unwrap();
        assert!(
            wait_until(Duration::from_secs(2), || {
                let peer_b = Arc::clone(&peer_b);
                async move { peer_b.status() == PeerStatus::Offline }
            })
            .await
        );
        assert!(wait_until(Duration::from_secs(1), || {
            let offline = Arc::clone(&offline);
            async move { offline.load(Ordering::SeqCst) == 1 }
        })
        .await);
        assert_eq!(peer_b.connection_count(), 0);
        assert_eq!(peer_b.features(), 0);
    }

    #[derive(Debug)]
    struct PipeConnector {
        acceptor: LinkNode,
    }

    #[async_trait]
    impl Connector for PipeConnector {
        async fn connect(&self, _peer_cid: &str) -> Result<(IoStream, LinkRole), LinkError> {
            let (left, right) = tokio::io::duplex(64 * 1024);
            let acceptor = self.acceptor.clone();
            tokio::spawn(async move { acceptor.accept(IoStream::Memory(right), LinkRole::Primary).await });
            Ok((IoStream::Memory(left), LinkRole::Primary))
        }
    }

    #[tokio::test]
    async fn test_lost_link_is_replaced_through_connector() {
        let b = node(config("node-b", 2));
        let a = LinkNodeBuilder::new(config("node-a", 1))
            .connector(Arc::new(PipeConnector { acceptor: b.clone() }))
            .build()
            .unwrap();
        let (a, b) = linked(a, b).await;

        let peer_b = a.find_peer("node-b").await.unwrap();
        let first = peer_b.working_connection().unwrap().id();
        let remote_end = b
            .find_peer("node-a")
            .await
            .unwrap()
            .working_connection()
            .unwrap();
        remote_end.shutdown().await;

        assert!(
            wait_until(Duration::from_secs(3), || {
                let peer_b = Arc::clone(&peer_b);
                async move {
                    peer_b.is_online()
                        && peer_b
                            .working_connection()
                            .map(|conn| conn.id() != first)
                            .unwrap_or(false)
                }
            })
            .await
        );
        assert_eq!(a.echo("node-b").await.unwrap(), 2);
        let node_a = a.clone();
        assert!(
            wait_until(Duration::from_secs(1), || {
                let node_a = node_a.clone();
                async move { !node_a.reconnect().is_reconnecting("node-b") }
            })
            .await
        );
    }

    #[tokio::test]
    async fn test_del_peer_raises_del() {
        let a = node(config("node-a", 1));
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        for kind in [EventKind::Add, EventKind::Del] {
            let events = Arc::clone(&events);
            a.register_event_callback(kind, CallbackMode::Sync, VERSION_LEGACY, "record", move |ctx| {
                events.lock().unwrap().push(ctx.event);
                Ok(())
            })
            .unwrap();
        }
        a.get_or_create_peer("node-z").await.unwrap();
        a.get_or_create_peer("node-z").await.unwrap();
        a.del_peer("node-z").await.unwrap();
        assert!(a.find_peer("node-z").await.is_none());
        assert_eq!(*events.lock().unwrap(), vec![EventKind::Add, EventKind::Del]);
    }

    #[tokio::test]
    async fn test_late_echo_reply_times_out_and_is_counted() {
        let a = node(config("node-a", 1));
        let (left, right) = tokio::io::duplex(64 * 1024);
        a.attach("fake", IoStream::Memory(left), LinkRole::Primary)
            .await
            .unwrap();

        let fake_config = config("fake", 9);
        let fake = tokio::spawn(async move {
            let mut stream = IoStream::Memory(right);
            let mut decoder = MessageDecoder::new();
            let mut buffer = BytesMut::new();

            let request = recv_first_message(&mut stream, &mut decoder, &mut buffer).await.unwrap();
            let block = HandshakeNegotiator::default().build_extensions(&fake_config);
            let payload = HandshakePayload::new("fake").with_extensions(block);
            let mut body = BytesMut::new();
            payload.encode(&mut body).unwrap();
            let header = WireHeader::handshake(
                HandshakeStep::Response,
                VERSION_EXTENDED,
                9,
                request.header.request_id,
            );
            let reply = WireMessage::new(header, body.freeze()).encode(1 << 20).unwrap();
            stream.write_all(&reply).await.unwrap();

            let ack = recv_first_message(&mut stream, &mut decoder, &mut buffer).await.unwrap();
            assert_eq!(ack.header.operation, HandshakeStep::Ack as u8);

            let echo = recv_first_message(&mut stream, &mut decoder, &mut buffer).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1200)).await;
            let header = WireHeader::response_to(&echo.header, VERSION_EXTENDED, 9);
            let late = WireMessage::new(header, EchoParam::new(9).encode())
                .encode(1 << 20)
                .unwrap();
            stream.write_all(&late).await.unwrap();
            stream
        });

        let node_a = a.clone();
        assert!(
            wait_until(Duration::from_secs(2), || {
                let node_a = node_a.clone();
                async move { node_a.peer_is_reachable("fake").await }
            })
            .await
        );

        let body = EchoParam::new(1).encode();
        let result = a
            .send_request("fake", Command::ConnectEcho, body, Some(Duration::from_secs(1)))
            .await;
        assert_eq!(result, Err(LinkError::Timeout));
        assert_eq!(a.stats().command(Command::ConnectEcho as u8).timeouts, 1);

        let _stream = fake.await.unwrap();
        let stats = Arc::clone(a.stats());
        assert!(
            wait_until(Duration::from_secs(1), || {
                let stats = Arc::clone(&stats);
                async move { stats.delayed_total() == 1 }
            })
            .await
        );
    }
}
