//! Peer lifecycle events: callback registry, ordering and merging.
//!
//! ADD and DEL run their synchronous callbacks immediately under the
//! sequence lock. ONLINE and OFFLINE go through a per-peer queue: the
//! synchronous half of an event runs as soon as it becomes current, the
//! asynchronous half runs after a delay, and only then does the next queued
//! event become current. Opposite events that cancel out while queued are
//! merged away so callbacks never observe a pointless flap.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::LinkError;

/// Peer lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Peer record created
    Add,
    /// Peer reachable
    Online,
    /// Peer unreachable
    Offline,
    /// Peer record removed
    Del,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Add => write!(f, "ADD"),
            EventKind::Online => write!(f, "ONLINE"),
            EventKind::Offline => write!(f, "OFFLINE"),
            EventKind::Del => write!(f, "DEL"),
        }
    }
}

/// When a callback runs relative to its event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackMode {
    /// Inline, as soon as the event becomes current
    Sync,
    /// After the node's async callback delay
    Async,
}

/// What a callback is told about the event
#[derive(Debug, Clone, Copy)]
pub struct EventContext<'a> {
    /// Stable id of the peer
    pub peer_cid: &'a str,
    /// Local device id of the peer
    pub device_id: u64,
    /// Negotiated protocol version of the peer
    pub version: u8,
    /// The event
    pub event: EventKind,
    /// Sequence number assigned when the event was raised
    pub seq: u64,
}

/// Callback signature
pub type EventCallbackFn = Arc<dyn Fn(&EventContext<'_>) -> anyhow::Result<()> + Send + Sync>;

struct Registered {
    name: String,
    kind: EventKind,
    mode: CallbackMode,
    min_version: u8,
    func: EventCallbackFn,
}

/// Callbacks of a node, invoked in registration order
#[derive(Default)]
pub struct EventCallbackRegistry {
    callbacks: RwLock<Vec<Registered>>,
}

impl fmt::Debug for EventCallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.callbacks.read().map(|c| c.len()).unwrap_or(0);
        f.debug_struct("EventCallbackRegistry")
            .field("callbacks", &count)
            .finish()
    }
}

impl EventCallbackRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for `kind`, run only for peers at `min_version` or newer
    pub fn register<F>(
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
        let name = name.into();
        if mode == CallbackMode::Async && matches!(kind, EventKind::Add | EventKind::Del) {
            return Err(LinkError::Invalid(format!(
                "{} events take synchronous callbacks only ({})",
                kind, name
            )));
        }
        let mut callbacks = self
            .callbacks
            .write()
            .map_err(|_| LinkError::Invalid("callback registry poisoned".to_string()))?;
        debug!("Registered {:?} callback {} for {}", mode, name, kind);
        callbacks.push(Registered {
            name,
            kind,
            mode,
            min_version,
            func: Arc::new(func),
        });
        Ok(())
    }

    /// Run matching callbacks; failures are logged and do not stop the rest
    pub fn run(&self, mode: CallbackMode, ctx: &EventContext<'_>) -> usize {
        let selected: Vec<(String, EventCallbackFn)> = match self.callbacks.read() {
            Ok(callbacks) => callbacks
                .iter()
                .filter(|cb| cb.kind == ctx.event && cb.mode == mode)
                .filter(|cb| ctx.version >= cb.min_version)
                .map(|cb| (cb.name.clone(), Arc::clone(&cb.func)))
                .collect(),
            Err(_) => return 0,
        };

        for (name, func) in &selected {
            if let Err(e) = func(ctx) {
                error!(
                    "Event callback {} failed for {} on peer {}: {:#}",
                    name, ctx.event, ctx.peer_cid, e
                );
            }
        }
        selected.len()
    }
}

/// An ONLINE/OFFLINE event with its sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedEvent {
    /// The event
    pub kind: EventKind,
    /// Sequence number assigned at raise time
    pub seq: u64,
}

/// What [`EventQueue::raise`] did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaiseAction {
    /// Queue was idle; the event is current and its sync callbacks are due
    Start(QueuedEvent),
    /// Event waits behind the current one
    Queued(QueuedEvent),
    /// Same as the last event seen; dropped
    Duplicate,
    /// Cancelled out together with the queued event before it
    Merged,
}

/// Pure ordering state of one peer's ONLINE/OFFLINE events
#[derive(Debug, Default)]
pub struct EventQueue {
    current: Option<QueuedEvent>,
    pending: VecDeque<QueuedEvent>,
    last: Option<EventKind>,
    duplicates: u64,
    merged: u64,
}

impl EventQueue {
    /// Create an idle queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer an event; `seq` is called only if the event is kept
    pub fn raise(&mut self, kind: EventKind, seq: impl FnOnce() -> u64) -> RaiseAction {
        let Some(current) = self.current else {
            if self.last == Some(kind) {
                self.duplicates += 1;
                return RaiseAction::Duplicate;
            }
            let event = QueuedEvent { kind, seq: seq() };
            self.current = Some(event);
            return RaiseAction::Start(event);
        };

        let tail = self.pending.back().map(|e| e.kind).unwrap_or(current.kind);
        if tail == kind {
            self.duplicates += 1;
            return RaiseAction::Duplicate;
        }

        let event = QueuedEvent { kind, seq: seq() };
        self.pending.push_back(event);
        if self.merge_tail(current.kind) {
            self.merged += 2;
            return RaiseAction::Merged;
        }
        RaiseAction::Queued(event)
    }

    // OFF,ON,OFF collapses to OFF. ON,OFF,ON collapses to ON only when the
    // leading ON is still queued: once current, its sync callbacks have run
    // and the OFF in between must be observed.
    fn merge_tail(&mut self, current: EventKind) -> bool {
        let n = self.pending.len();
        if n < 2 {
            return false;
        }
        let (head, head_queued) = if n >= 3 {
            (self.pending[n - 3].kind, true)
        } else {
            (current, false)
        };
        let collapse = match (head, self.pending[n - 2].kind, self.pending[n - 1].kind) {
            (EventKind::Offline, EventKind::Online, EventKind::Offline) => true,
            (EventKind::Online, EventKind::Offline, EventKind::Online) => head_queued,
            _ => false,
        };
        if collapse {
            self.pending.truncate(n - 2);
        }
        collapse
    }

    /// Finish the current event; returns the next one, now current
    pub fn complete(&mut self) -> Option<QueuedEvent> {
        if let Some(done) = self.current.take() {
            self.last = Some(done.kind);
        }
        self.current = self.pending.pop_front();
        self.current
    }

    /// Forget the current and queued events
    pub fn reset(&mut self) {
        if let Some(current) = self.current.take() {
            self.last = Some(current.kind);
        }
        self.pending.clear();
    }

    /// Event whose callbacks are running
    pub fn current(&self) -> Option<QueuedEvent> {
        self.current
    }

    /// Whether no event is current
    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    /// Events waiting behind the current one
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Duplicates dropped so far
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Events removed by merging so far
    pub fn merged(&self) -> u64 {
        self.merged
    }
}

/// Runs one peer's events through the queue and the callback registry
pub struct EventSequencer {
    peer_cid: String,
    device_id: u64,
    version: Arc<AtomicU8>,
    registry: Arc<EventCallbackRegistry>,
    async_delay: Duration,
    seq: AtomicU64,
    queue: tokio::sync::Mutex<EventQueue>,
    seq_lock: tokio::sync::Mutex<()>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for EventSequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSequencer")
            .field("peer_cid", &self.peer_cid)
            .field("seq", &self.current_sequence())
            .finish_non_exhaustive()
    }
}

impl EventSequencer {
    /// Create a sequencer for one peer
    pub fn new(
        peer_cid: impl Into<String>,
        device_id: u64,
        version: Arc<AtomicU8>,
        registry: Arc<EventCallbackRegistry>,
        async_delay: Duration,
    ) -> Self {
        Self {
            peer_cid: peer_cid.into(),
            device_id,
            version,
            registry,
            async_delay,
            seq: AtomicU64::new(0),
            queue: tokio::sync::Mutex::new(EventQueue::new()),
            seq_lock: tokio::sync::Mutex::new(()),
            worker: std::sync::Mutex::new(None),
        }
    }

    /// Latest sequence number handed out
    pub fn current_sequence(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Advance the sequence without an event, invalidating older snapshots
    pub fn bump_sequence(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Duplicates dropped and events merged so far
    pub async fn counters(&self) -> (u64, u64) {
        let queue = self.queue.lock().await;
        (queue.duplicates(), queue.merged())
    }

    /// Whether no ONLINE/OFFLINE event is in progress
    pub async fn is_idle(&self) -> bool {
        self.queue.lock().await.is_idle()
    }

    fn run_phase(&self, mode: CallbackMode, kind: EventKind, seq: u64) {
        let ctx = EventContext {
            peer_cid: &self.peer_cid,
            device_id: self.device_id,
            version: self.version.load(Ordering::Acquire),
            event: kind,
            seq,
        };
        let ran = self.registry.run(mode, &ctx);
        debug!(
            "Peer {} ran {} {:?} callbacks for {} (seq {})",
            self.peer_cid, ran, mode, kind, seq
        );
    }

    /// Raise an event for this peer
    pub async fn raise(self: &Arc<Self>, kind: EventKind) {
        match kind {
            EventKind::Add => self.raise_simple(kind).await,
            EventKind::Del => {
                self.cancel_pending().await;
                self.raise_simple(kind).await;
            }
            EventKind::Online | EventKind::Offline => self.raise_queued(kind).await,
        }
    }

    async fn raise_simple(&self, kind: EventKind) {
        let _guard = self.seq_lock.lock().await;
        let seq = self.bump_sequence();
        info!("Peer {} event {} (seq {})", self.peer_cid, kind, seq);
        self.run_phase(CallbackMode::Sync, kind, seq);
    }

    async fn raise_queued(self: &Arc<Self>, kind: EventKind) {
        let mut queue = self.queue.lock().await;
        match queue.raise(kind, || self.bump_sequence()) {
            RaiseAction::Start(event) => {
                let guard = self.seq_lock.lock().await;
                drop(queue);
                info!("Peer {} event {} (seq {})", self.peer_cid, kind, event.seq);
                self.run_phase(CallbackMode::Sync, event.kind, event.seq);
                drop(guard);
                self.spawn_worker();
            }
            RaiseAction::Queued(event) => {
                debug!(
                    "Peer {} queued event {} (seq {}), {} pending",
                    self.peer_cid,
                    kind,
                    event.seq,
                    queue.pending_len()
                );
            }
            RaiseAction::Duplicate => {
                info!(
                    "Peer {} dropped duplicate event {} ({} so far)",
                    self.peer_cid,
                    kind,
                    queue.duplicates()
                );
            }
            RaiseAction::Merged => {
                info!(
                    "Peer {} merged event {} with the pending opposite ({} merged)",
                    self.peer_cid,
                    kind,
                    queue.merged()
                );
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>) {
        let sequencer = Arc::clone(self);
        let handle = tokio::spawn(async move { sequencer.drive().await });
        if let Ok(mut slot) = self.worker.lock() {
            *slot = Some(handle);
        }
    }

    async fn drive(&self) {
        loop {
            tokio::time::sleep(self.async_delay).await;
            let current = self.queue.lock().await.current();
            if let Some(event) = current {
                self.run_phase(CallbackMode::Async, event.kind, event.seq);
            }

            let mut queue = self.queue.lock().await;
            let Some(next) = queue.complete() else {
                return;
            };
            let guard = self.seq_lock.lock().await;
            drop(queue);
            info!("Peer {} event {} (seq {})", self.peer_cid, next.kind, next.seq);
            self.run_phase(CallbackMode::Sync, next.kind, next.seq);
            drop(guard);
        }
    }

    async fn cancel_pending(&self) {
        let worker = self.worker.lock().ok().and_then(|mut slot| slot.take());
        if let Some(worker) = worker {
            worker.abort();
        }
        let mut queue = self.queue.lock().await;
        if !queue.is_idle() {
            debug!(
                "Peer {} cancelled {} pending events",
                self.peer_cid,
                queue.pending_len() + 1
            );
        }
        queue.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(registry: &EventCallbackRegistry, log: &Log, kind: EventKind, mode: CallbackMode) {
        let log = Arc::clone(log);
        let tag = format!("{:?}:{}", mode, kind);
        registry
            .register(kind, mode, 1, tag.clone(), move |_ctx| {
                log.lock().unwrap().push(tag.clone());
                Ok(())
            })
            .unwrap();
    }

    fn sequencer(registry: Arc<EventCallbackRegistry>, delay: Duration) -> Arc<EventSequencer> {
        Arc::new(EventSequencer::new(
            "peer-a",
            1,
            Arc::new(AtomicU8::new(2)),
            registry,
            delay,
        ))
    }

    fn counter() -> impl FnMut() -> u64 {
        let mut n = 0;
        move || {
            n += 1;
            n
        }
    }

    async fn settle(seq: &EventSequencer) {
        for _ in 0..200 {
            if seq.is_idle().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("sequencer never went idle");
    }

    #[test]
    fn test_queue_starts_and_drops_idle_duplicate() {
        let mut queue = EventQueue::new();
        let mut next = counter();
        assert!(matches!(
            queue.raise(EventKind::Online, &mut next),
            RaiseAction::Start(QueuedEvent { seq: 1, .. })
        ));
        assert_eq!(queue.complete(), None);
        assert_eq!(queue.raise(EventKind::Online, &mut next), RaiseAction::Duplicate);
        assert_eq!(queue.duplicates(), 1);
    }

    #[test]
    fn test_queue_drops_duplicate_of_tail() {
        let mut queue = EventQueue::new();
        let mut next = counter();
        queue.raise(EventKind::Online, &mut next);
        assert_eq!(queue.raise(EventKind::Online, &mut next), RaiseAction::Duplicate);
        assert!(matches!(
            queue.raise(EventKind::Offline, &mut next),
            RaiseAction::Queued(_)
        ));
        assert_eq!(queue.raise(EventKind::Offline, &mut next), RaiseAction::Duplicate);
    }

    #[test]
    fn test_off_on_off_collapses() {
        let mut queue = EventQueue::new();
        let mut next = counter();
        queue.raise(EventKind::Offline, &mut next);
        queue.raise(EventKind::Online, &mut next);
        assert_eq!(queue.raise(EventKind::Offline, &mut next), RaiseAction::Merged);
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.merged(), 2);
        assert_eq!(queue.complete(), None);
    }

    #[test]
    fn test_on_off_on_keeps_off_behind_current_on() {
        let mut queue = EventQueue::new();
        let mut next = counter();
        queue.raise(EventKind::Online, &mut next);
        queue.raise(EventKind::Offline, &mut next);
        assert!(matches!(
            queue.raise(EventKind::Online, &mut next),
            RaiseAction::Queued(_)
        ));
        assert_eq!(queue.complete().map(|e| e.kind), Some(EventKind::Offline));
        assert_eq!(queue.complete().map(|e| e.kind), Some(EventKind::Online));
    }

    #[test]
    fn test_async_registration_rejected_for_add_and_del() {
        let registry = EventCallbackRegistry::new();
        for kind in [EventKind::Add, EventKind::Del] {
            assert!(matches!(
                registry.register(kind, CallbackMode::Async, 1, "x", |_| Ok(())),
                Err(LinkError::Invalid(_))
            ));
        }
        assert!(registry
            .register(EventKind::Online, CallbackMode::Async, 1, "x", |_| Ok(()))
            .is_ok());
    }

    #[test]
    fn test_registry_filters_version_and_survives_errors() {
        let registry = EventCallbackRegistry::new();
        let log: Log = Arc::default();
        registry
            .register(EventKind::Online, CallbackMode::Sync, 1, "fails", |_| {
                anyhow::bail!("boom")
            })
            .unwrap();
        let l = Arc::clone(&log);
        registry
            .register(EventKind::Online, CallbackMode::Sync, 2, "v2-only", move |ctx| {
                l.lock().unwrap().push(format!("{}@{}", ctx.peer_cid, ctx.seq));
                Ok(())
            })
            .unwrap();

        let mut ctx = EventContext {
            peer_cid: "p",
            device_id: 1,
            version: 1,
            event: EventKind::Online,
            seq: 4,
        };
        assert_eq!(registry.run(CallbackMode::Sync, &ctx), 1);
        assert!(log.lock().unwrap().is_empty());

        ctx.version = 2;
        assert_eq!(registry.run(CallbackMode::Sync, &ctx), 2);
        assert_eq!(*log.lock().unwrap(), vec!["p@4".to_string()]);
    }

    #[tokio::test]
    async fn test_sync_then_async_then_next_event() {
        let registry = Arc::new(EventCallbackRegistry::new());
        let log: Log = Arc::default();
        for kind in [EventKind::Online, EventKind::Offline] {
            recording(&registry, &log, kind, CallbackMode::Sync);
            recording(&registry, &log, kind, CallbackMode::Async);
        }
        let seq = sequencer(registry, Duration::from_millis(20));

        seq.raise(EventKind::Online).await;
        seq.raise(EventKind::Offline).await;
        assert_eq!(*log.lock().unwrap(), vec!["Sync:ONLINE".to_string()]);

        settle(&seq).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["Sync:ONLINE", "Async:ONLINE", "Sync:OFFLINE", "Async:OFFLINE"]
        );
        assert_eq!(seq.current_sequence(), 2);
    }

    #[tokio::test]
    async fn test_flap_is_merged_away() {
        let registry = Arc::new(EventCallbackRegistry::new());
        let log: Log = Arc::default();
        recording(&registry, &log, EventKind::Online, CallbackMode::Sync);
        recording(&registry, &log, EventKind::Offline, CallbackMode::Sync);
        let seq = sequencer(registry, Duration::from_millis(30));

        seq.raise(EventKind::Offline).await;
        seq.raise(EventKind::Online).await;
        seq.raise(EventKind::Offline).await;
        settle(&seq).await;

        assert_eq!(*log.lock().unwrap(), vec!["Sync:OFFLINE".to_string()]);
        assert_eq!(seq.counters().await, (0, 2));
    }

    #[tokio::test]
    async fn test_del_cancels_async_half() {
        let registry = Arc::new(EventCallbackRegistry::new());
        let log: Log = Arc::default();
        recording(&registry, &log, EventKind::Online, CallbackMode::Sync);
        recording(&registry, &log, EventKind::Online, CallbackMode::Async);
        recording(&registry, &log, EventKind::Del, CallbackMode::Sync);
        let seq = sequencer(registry, Duration::from_millis(100));

        seq.raise(EventKind::Online).await;
        seq.raise(EventKind::Del).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(*log.lock().unwrap(), vec!["Sync:ONLINE", "Sync:DEL"]);
        assert!(seq.is_idle().await);
    }

    #[tokio::test]
    async fn test_simple_events_take_sequence_numbers() {
        let registry = Arc::new(EventCallbackRegistry::new());
        let seqs = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seqs);
        registry
            .register(EventKind::Add, CallbackMode::Sync, 1, "seq", move |ctx| {
                s.lock().unwrap().push(ctx.seq);
                Ok(())
            })
            .unwrap();
        let seq = sequencer(registry, Duration::from_millis(10));

        seq.raise(EventKind::Add).await;
        assert_eq!(seq.bump_sequence(), 2);
        seq.raise(EventKind::Add).await;
        assert_eq!(*seqs.lock().unwrap(), vec![1, 3]);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone, Copy)]
        enum Op {
            Raise(EventKind),
            Complete,
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                Just(Op::Raise(EventKind::Online)),
                Just(Op::Raise(EventKind::Offline)),
                Just(Op::Complete),
            ]
        }

        /// Straight-line model: index 0 is current, the rest are queued.
        #[derive(Default)]
        struct Model {
            line: Vec<EventKind>,
            last: Option<EventKind>,
            observed: Vec<EventKind>,
        }

        impl Model {
            fn raise(&mut self, kind: EventKind) {
                if self.line.is_empty() {
                    if self.last != Some(kind) {
                        self.line.push(kind);
                        self.observed.push(kind);
                    }
                    return;
                }
                if self.line.last() == Some(&kind) {
                    return;
                }
                self.line.push(kind);
                let n = self.line.len();
                if n >= 3 {
                    let window = &self.line[n - 3..];
                    let off_on_off =
                        window == [EventKind::Offline, EventKind::Online, EventKind::Offline];
                    let on_off_on = window == [EventKind::Online, EventKind::Offline, EventKind::Online]
                        && n - 3 >= 1;
                    if off_on_off || on_off_on {
                        self.line.truncate(n - 2);
                    }
                }
            }

            fn complete(&mut self) {
                if self.line.is_empty() {
                    return;
                }
                self.last = Some(self.line.remove(0));
                if let Some(next) = self.line.first() {
                    self.observed.push(*next);
                }
            }
        }

        proptest! {
            #[test]
            fn queue_matches_model(ops in prop::collection::vec(op(), 0..64)) {
                let mut queue = EventQueue::new();
                let mut model = Model::default();
                let mut observed = Vec::new();
                let mut seqs = Vec::new();
                let mut next = counter();
                let mut last_raised = None;

                let steps = ops.into_iter().chain(std::iter::repeat(Op::Complete).take(70));
                for step in steps {
                    match step {
                        Op::Raise(kind) => {
                            last_raised = Some(kind);
                            model.raise(kind);
                            if let RaiseAction::Start(event) = queue.raise(kind, &mut next) {
                                observed.push(event.kind);
                                seqs.push(event.seq);
                            }
                        }
                        Op::Complete => {
                            model.complete();
                            if let Some(event) = queue.complete() {
                                observed.push(event.kind);
                                seqs.push(event.seq);
                            }
                        }
                    }
                }

                prop_assert!(queue.is_idle());
                prop_assert_eq!(&observed, &model.observed);
                prop_assert!(observed.windows(2).all(|w| w[0] != w[1]));
                prop_assert!(seqs.windows(2).all(|w| w[0] < w[1]));
                if let Some(kind) = last_raised {
                    prop_assert_eq!(observed.last().copied(), Some(kind));
                }
            }
        }
    }
}
