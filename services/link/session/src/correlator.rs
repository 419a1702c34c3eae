//! Request/response matching for one peer.
//!
//! Every outstanding request owns one entry in the peer's table, keyed by a
//! correlation id. Whoever removes the entry (the response path, the
//! deadline, or the offline drain) is the only party that completes it,
//! which makes completion exactly-once without further coordination.
//!
//! Extended peers get 32-bit ids whose top byte is the table generation; the
//! generation moves on every offline drain so answers to requests of an
//! earlier session are recognised as stale. Legacy peers use 1..=65535.

use bytes::Bytes;
use link_wire::{WireHeader, VERSION_EXTENDED};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::stats::ResponseStats;
use crate::LinkError;

/// Result delivered to a waiter or continuation
pub type Outcome = Result<Bytes, LinkError>;

/// Completion callback of an asynchronous request
pub type Continuation = Box<dyn FnOnce(Outcome) + Send + 'static>;

const LEGACY_ID_MAX: u32 = 0xFFFF;
const GENERATION_SHIFT: u32 = 24;
const COUNTER_MAX: u32 = (1 << GENERATION_SHIFT) - 1;
const IDLE_POLL: Duration = Duration::from_micros(20);
const ARM_WAIT: Duration = Duration::from_micros(50);

struct AsyncEntry {
    armed: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    continuation: Mutex<Option<Continuation>>,
}

impl AsyncEntry {
    fn complete(&self, outcome: Outcome) {
        let continuation = self
            .continuation
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(continuation) = continuation {
            continuation(outcome);
        }
    }

    fn cancel_timer(&self) {
        let timer = self.timer.lock().ok().and_then(|mut slot| slot.take());
        if let Some(timer) = timer {
            timer.abort();
        }
    }
}

enum Waiter {
    Sync(oneshot::Sender<Outcome>),
    Async(Arc<AsyncEntry>),
}

struct Pending {
    command: u8,
    serial: u64,
    sent_at: Instant,
    waiter: Waiter,
}

enum Found {
    Sync,
    Async(Arc<AsyncEntry>),
    Missing,
}

#[derive(Default)]
struct Table {
    entries: HashMap<u32, Pending>,
    cursor: u32,
    generation: u8,
    draining: bool,
    next_serial: u64,
}

impl Table {
    fn next_free(&mut self, version: u8) -> Option<u32> {
        let extended = version >= VERSION_EXTENDED;
        let max = if extended { COUNTER_MAX } else { LEGACY_ID_MAX };
        for _ in 0..max {
            self.cursor = if self.cursor >= max { 1 } else { self.cursor + 1 };
            let id = if extended {
                ((self.generation as u32) << GENERATION_SHIFT) | self.cursor
            } else {
                self.cursor
            };
            if !self.entries.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }
}

/// Marks a sender between id allocation and the end of its send
pub struct InFlight<'a> {
    correlator: &'a MessageCorrelator,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.correlator.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A registered synchronous request.
///
/// Dropping the ticket before its answer arrived releases the id.
pub struct SyncTicket<'a> {
    /// Correlation id to place in the header
    pub id: u32,
    serial: u64,
    command: u8,
    rx: oneshot::Receiver<Outcome>,
    correlator: &'a MessageCorrelator,
    in_flight: Option<InFlight<'a>>,
}

impl SyncTicket<'_> {
    /// The request left the node; the sender no longer counts as in flight
    pub fn sent(&mut self) {
        self.in_flight = None;
    }
}

impl Drop for SyncTicket<'_> {
    fn drop(&mut self) {
        if self.correlator.release(self.id, self.serial).is_some() {
            debug!("Released request {:#x} (op {}) without an answer", self.id, self.command);
        }
    }
}

/// A registered asynchronous request.
///
/// Dropping the ticket before [`arm`](MessageCorrelator::arm) abandons the
/// request and drops its continuation unrun.
pub struct AsyncTicket<'a> {
    /// Correlation id to place in the header
    pub id: u32,
    entry: Arc<AsyncEntry>,
    correlator: &'a MessageCorrelator,
    _in_flight: InFlight<'a>,
}

impl Drop for AsyncTicket<'_> {
    fn drop(&mut self) {
        if !self.entry.armed.load(Ordering::Acquire)
            && self.correlator.abandon_entry(self.id, &self.entry)
        {
            debug!("Abandoned async request {:#x} before it was sent", self.id);
        }
    }
}

/// Outstanding request table of one peer
pub struct MessageCorrelator {
    table: Mutex<Table>,
    in_flight: AtomicUsize,
    stats: Arc<ResponseStats>,
    arm_spin_limit: u32,
}

impl std::fmt::Debug for MessageCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCorrelator")
            .field("pending", &self.pending())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

fn generation_of(id: u32) -> u8 {
    (id >> GENERATION_SHIFT) as u8
}

impl MessageCorrelator {
    /// Create an empty table reporting into `stats`
    pub fn new(stats: Arc<ResponseStats>, arm_spin_limit: u32) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            in_flight: AtomicUsize::new(0),
            stats,
            arm_spin_limit,
        }
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, version: u8, command: u8, waiter: Waiter) -> Result<(u32, u64), LinkError> {
        let mut table = self.table();
        if table.draining {
            return Err(LinkError::Again);
        }
        let id = table.next_free(version).ok_or(LinkError::Again)?;
        let serial = table.next_serial;
        table.next_serial += 1;
        table.entries.insert(
            id,
            Pending {
                command,
                serial,
                sent_at: Instant::now(),
                waiter,
            },
        );
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok((id, serial))
    }

    // Removes `id` only while it still belongs to the registration `serial`
    fn release(&self, id: u32, serial: u64) -> Option<Pending> {
        let mut table = self.table();
        if table.entries.get(&id).is_some_and(|p| p.serial == serial) {
            table.entries.remove(&id)
        } else {
            None
        }
    }

    /// Allocate an id for a request whose caller will wait for the answer
    pub fn register_sync(&self, version: u8, command: u8) -> Result<SyncTicket<'_>, LinkError> {
        let (tx, rx) = oneshot::channel();
        let (id, serial) = self.insert(version, command, Waiter::Sync(tx))?;
        Ok(SyncTicket {
            id,
            serial,
            command,
            rx,
            correlator: self,
            in_flight: Some(InFlight { correlator: self }),
        })
    }

    /// Wait for the answer to a synchronous request
    pub async fn wait(&self, mut ticket: SyncTicket<'_>, deadline: Duration) -> Outcome {
        ticket.sent();
        let (id, command) = (ticket.id, ticket.command);

        match tokio::time::timeout(deadline, &mut ticket.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(LinkError::NotReachable),
            Err(_) => {
                if self.release(id, ticket.serial).is_some() {
                    self.stats.record_timeout(command);
                    debug!("Request {:#x} (op {}) timed out after {:?}", id, command, deadline);
                    Err(LinkError::Timeout)
                } else {
                    // completed under the table lock right before we looked
                    ticket.rx.try_recv().unwrap_or(Err(LinkError::Timeout))
                }
            }
        }
    }

    /// Allocate an id for a request answered through `continuation`
    pub fn register_async(
        &self,
        version: u8,
        command: u8,
        continuation: Continuation,
    ) -> Result<AsyncTicket<'_>, LinkError> {
        let entry = Arc::new(AsyncEntry {
            armed: AtomicBool::new(false),
            timer: Mutex::new(None),
            continuation: Mutex::new(Some(continuation)),
        });
        let (id, _) = self.insert(version, command, Waiter::Async(Arc::clone(&entry)))?;
        Ok(AsyncTicket {
            id,
            entry,
            correlator: self,
            _in_flight: InFlight { correlator: self },
        })
    }

    /// Start the deadline of a sent asynchronous request
    pub fn arm(self: &Arc<Self>, ticket: AsyncTicket<'_>, deadline: Duration) {
        let id = ticket.id;
        let correlator = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            correlator.expire(id);
        });
        if let Ok(mut slot) = ticket.entry.timer.lock() {
            *slot = Some(timer);
        }
        ticket.entry.armed.store(true, Ordering::Release);
    }

    /// Give up on an asynchronous request whose send failed.
    ///
    /// Returns `true` when the continuation was dropped unrun; `false` when
    /// another path already claimed the entry and will complete it.
    pub fn abandon(&self, ticket: AsyncTicket<'_>) -> bool {
        self.abandon_entry(ticket.id, &ticket.entry)
    }

    fn abandon_entry(&self, id: u32, entry: &Arc<AsyncEntry>) -> bool {
        let removed = self.claim_async(id, entry).is_some();
        entry.armed.store(true, Ordering::Release);
        if removed {
            if let Ok(mut slot) = entry.continuation.lock() {
                slot.take();
            }
        }
        removed
    }

    /// Drop a synchronous entry whose send failed
    pub fn cancel(&self, ticket: SyncTicket<'_>) {
        self.release(ticket.id, ticket.serial);
    }

    fn claim_async(&self, id: u32, entry: &Arc<AsyncEntry>) -> Option<Pending> {
        let mut table = self.table();
        let ours = matches!(
            table.entries.get(&id),
            Some(Pending { waiter: Waiter::Async(current), .. }) if Arc::ptr_eq(current, entry)
        );
        if ours {
            table.entries.remove(&id)
        } else {
            None
        }
    }

    fn expire(&self, id: u32) {
        let claimed = {
            let mut table = self.table();
            let expirable = matches!(
                table.entries.get(&id),
                Some(Pending { waiter: Waiter::Async(_), .. })
            );
            if expirable {
                table.entries.remove(&id)
            } else {
                None
            }
        };
        if let Some(Pending {
            command,
            waiter: Waiter::Async(entry),
            ..
        }) = claimed
        {
            self.stats.record_timeout(command);
            debug!("Async request {:#x} (op {}) timed out", id, command);
            entry.complete(Err(LinkError::Timeout));
        }
    }

    // Arming follows the send within microseconds; never waits past ARM_WAIT
    async fn wait_armed(&self, entry: &AsyncEntry) -> bool {
        let start = Instant::now();
        for _ in 0..self.arm_spin_limit {
            if entry.armed.load(Ordering::Acquire) || start.elapsed() >= ARM_WAIT {
                break;
            }
            tokio::task::yield_now().await;
        }
        entry.armed.load(Ordering::Acquire)
    }

    fn late(&self, id: u32, command: u8) -> LinkError {
        self.stats.record_delayed(command);
        info!("cannot find msg_id {:#x} (op {}), response delayed", id, command);
        LinkError::StaleCorrelation(id)
    }

    /// Deliver a response received from a peer speaking `version`
    pub async fn on_response(
        &self,
        version: u8,
        header: &WireHeader,
        outcome: Outcome,
    ) -> Result<(), LinkError> {
        let id = header.correlation_id(version);
        let command = header.operation;

        let entry = {
            let mut table = self.table();
            if version >= VERSION_EXTENDED && generation_of(id) != table.generation {
                drop(table);
                return Err(self.late(id, command));
            }
            let found = match table.entries.get(&id) {
                Some(pending) if pending.command == command => match &pending.waiter {
                    Waiter::Sync(_) => Found::Sync,
                    Waiter::Async(entry) => Found::Async(Arc::clone(entry)),
                },
                _ => Found::Missing,
            };
            match found {
                Found::Sync => {
                    if let Some(Pending {
                        sent_at,
                        waiter: Waiter::Sync(tx),
                        ..
                    }) = table.entries.remove(&id)
                    {
                        let _ = tx.send(outcome);
                        self.stats.record_normal(command, sent_at.elapsed());
                    }
                    return Ok(());
                }
                Found::Async(entry) => entry,
                Found::Missing => {
                    drop(table);
                    return Err(self.late(id, command));
                }
            }
        };

        if !self.wait_armed(&entry).await {
            debug!("Async request {:#x} answered before it was armed", id);
        }
        match self.claim_async(id, &entry) {
            Some(pending) => {
                entry.cancel_timer();
                self.stats.record_normal(command, pending.sent_at.elapsed());
                tokio::spawn(async move { entry.complete(outcome) });
                Ok(())
            }
            None => Err(self.late(id, command)),
        }
    }

    /// Fail every outstanding request with `NotReachable` and refuse new ones.
    ///
    /// Returns the number of requests completed by the drain.
    pub async fn drain(&self) -> usize {
        let drained: Vec<(u32, Pending)> = {
            let mut table = self.table();
            table.draining = true;
            table.generation = table.generation.wrapping_add(1);
            table.entries.drain().collect()
        };

        let count = drained.len();
        for (id, pending) in drained {
            match pending.waiter {
                Waiter::Sync(tx) => {
                    let _ = tx.send(Err(LinkError::NotReachable));
                }
                Waiter::Async(entry) => {
                    self.wait_armed(&entry).await;
                    entry.cancel_timer();
                    entry.complete(Err(LinkError::NotReachable));
                }
            }
            debug!("Drained request {:#x} (op {})", id, pending.command);
        }
        count
    }

    /// Accept new requests again after a drain
    pub fn resume(&self) {
        self.table().draining = false;
    }

    /// Wait until no sender sits between allocation and send, up to `limit`
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let start = Instant::now();
        while self.in_flight() > 0 {
            if start.elapsed() >= limit {
                return false;
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
        true
    }

    /// Outstanding requests
    pub fn pending(&self) -> usize {
        self.table().entries.len()
    }

    /// Senders between allocation and send
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Current table generation
    pub fn generation(&self) -> u8 {
        self.table().generation
    }

    /// Whether the table refuses new requests
    pub fn is_draining(&self) -> bool {
        self.table().draining
    }
}
