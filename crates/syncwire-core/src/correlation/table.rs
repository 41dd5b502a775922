//! Token → waiter table.
//!
//! Invariant: a token is in the table if and only if its exchange is
//! outstanding and unfulfilled. Entries leave the table exactly once, by
//! one of: delivery, the [`WaitHandle`] being dropped (timeout, caller gave
//! up, send failed), or [`CorrelationTable::abandon_all`].
//!
//! The lock is a plain `std::sync::Mutex`; no critical section awaits.

use crate::error::{Result, SyncwireError};
use crate::transport::CloseReason;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// What a waiter receives.
#[derive(Debug)]
pub enum Delivery {
    Reply(Vec<u8>),
    Abandoned(CloseReason),
}

/// Result of routing one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handed to the registered waiter.
    Delivered,
    /// No waiter registered under the token.
    Orphaned,
    /// The waiter was registered but stopped listening first.
    WaiterGone,
}

/// Snapshot of table counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub outstanding: usize,
    pub registered: u64,
    pub delivered: u64,
    pub orphaned: u64,
    pub abandoned: u64,
    pub malformed: u64,
}

struct PendingExchange {
    slot: u64,
    tx: oneshot::Sender<Delivery>,
    created_at: Instant,
}

#[derive(Default)]
struct TableState {
    pending: HashMap<String, PendingExchange>,
    closed: Option<CloseReason>,
    next_slot: u64,
}

#[derive(Default)]
struct Counters {
    registered: AtomicU64,
    delivered: AtomicU64,
    orphaned: AtomicU64,
    abandoned: AtomicU64,
    malformed: AtomicU64,
}

/// Outstanding exchanges of one connection.
#[derive(Default)]
pub struct CorrelationTable {
    state: Mutex<TableState>,
    counters: Counters,
}

impl std::fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("stats", &self.stats())
            .finish()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter for `token`.
    ///
    /// Fails with `DuplicateToken` if the token is outstanding and with
    /// `ConnectionClosed` once the table has been abandoned.
    pub fn register(self: &Arc<Self>, token: impl Into<String>) -> Result<WaitHandle> {
        let token = token.into();
        let (tx, rx) = oneshot::channel();
        let created_at = Instant::now();

        let slot = {
            let mut state = self.lock();
            if let Some(reason) = &state.closed {
                return Err(SyncwireError::ConnectionClosed {
                    reason: reason.clone(),
                });
            }
            if state.pending.contains_key(&token) {
                return Err(SyncwireError::DuplicateToken(token));
            }
            let slot = state.next_slot;
            state.next_slot += 1;
            state.pending.insert(
                token.clone(),
                PendingExchange {
                    slot,
                    tx,
                    created_at,
                },
            );
            slot
        };

        self.counters.registered.fetch_add(1, Ordering::Relaxed);
        trace!("Registered exchange {}", token);

        Ok(WaitHandle {
            table: Arc::clone(self),
            token,
            slot,
            rx,
            created_at,
        })
    }

    /// Hand `frame` to the waiter registered under `token`, removing it.
    pub fn deliver(&self, token: &str, frame: Vec<u8>) -> DeliveryOutcome {
        let exchange = self.lock().pending.remove(token);

        let Some(exchange) = exchange else {
            self.counters.orphaned.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping orphan response for {}", token);
            return DeliveryOutcome::Orphaned;
        };

        let elapsed = exchange.created_at.elapsed();
        match exchange.tx.send(Delivery::Reply(frame)) {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                trace!("Delivered {} after {:?}", token, elapsed);
                DeliveryOutcome::Delivered
            }
            Err(_) => {
                self.counters.orphaned.fetch_add(1, Ordering::Relaxed);
                debug!("Waiter for {} left before its reply arrived", token);
                DeliveryOutcome::WaiterGone
            }
        }
    }

    /// Fail every outstanding exchange with `ConnectionClosed` and refuse new
    /// registrations. Returns the number of waiters notified.
    pub fn abandon_all(&self, reason: CloseReason) -> usize {
        let drained: Vec<(String, PendingExchange)> = {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.clone());
            }
            state.pending.drain().collect()
        };

        let count = drained.len();
        for (token, exchange) in drained {
            trace!("Abandoning {}: {}", token, reason);
            let _ = exchange.tx.send(Delivery::Abandoned(reason.clone()));
        }
        self.counters
            .abandoned
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Count a frame that carried no usable token.
    pub fn record_malformed(&self) {
        self.counters.malformed.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self, token: &str, slot: u64) -> bool {
        let mut state = self.lock();
        match state.pending.get(token) {
            Some(exchange) if exchange.slot == slot => {
                state.pending.remove(token);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, token: &str) -> bool {
        self.lock().pending.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Why the table was closed, if it was.
    pub fn closed_reason(&self) -> Option<CloseReason> {
        self.lock().closed.clone()
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            outstanding: self.len(),
            registered: self.counters.registered.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            orphaned: self.counters.orphaned.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
        }
    }
}

/// A caller's claim on one outstanding exchange.
///
/// Dropping the handle releases the table entry if it is still there, so
/// every exit path (reply, timeout, closure, cancellation of the awaiting
/// future) leaves the table clean.
#[derive(Debug)]
pub struct WaitHandle {
    table: Arc<CorrelationTable>,
    token: String,
    slot: u64,
    rx: oneshot::Receiver<Delivery>,
    created_at: Instant,
}

impl WaitHandle {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Time since registration.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Wait for the reply, the timeout, or connection closure.
    pub async fn wait(mut self, timeout: Duration) -> Result<Vec<u8>> {
        let delivery = match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(delivery) => delivery,
            Err(_) => {
                // A reply may have landed between the deadline and now.
                match self.rx.try_recv() {
                    Ok(delivery) => Ok(delivery),
                    Err(_) => {
                        debug!("Exchange {} timed out after {:?}", self.token, timeout);
                        return Err(SyncwireError::Timeout(timeout));
                    }
                }
            }
        };

        match delivery {
            Ok(Delivery::Reply(frame)) => Ok(frame),
            Ok(Delivery::Abandoned(reason)) => Err(SyncwireError::ConnectionClosed { reason }),
            // Sender dropped without a delivery: only possible if the table
            // itself went away.
            Err(_) => Err(SyncwireError::ConnectionClosed {
                reason: CloseReason::LocalShutdown,
            }),
        }
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        if self.table.release(&self.token, self.slot) {
            trace!("Released exchange {}", self.token);
        }
    }
}
