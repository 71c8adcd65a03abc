//! Priority-ordered admission for network downloads.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::domain::entities::Priority;

struct Waiter {
    priority: Priority,
    sequence: u64,
    tx: oneshot::Sender<DownloadPermit>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Max-heap: higher priority first, then earlier arrival.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct GateState {
    available: usize,
    waiters: BinaryHeap<Waiter>,
    next_sequence: u64,
}

/// Limits concurrent downloads, admitting waiters by request priority.
pub struct DownloadGate {
    state: Mutex<GateState>,
}

impl std::fmt::Debug for DownloadGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DownloadGate")
            .field("available", &state.available)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

/// Held for the duration of one download. Dropping it admits the next waiter.
#[derive(Debug)]
pub struct DownloadPermit {
    gate: Option<Arc<DownloadGate>>,
}

impl Drop for DownloadPermit {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}

impl DownloadGate {
    /// Creates a gate admitting `permits` downloads at once (at least one).
    #[must_use]
    pub fn new(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState {
                available: permits.max(1),
                waiters: BinaryHeap::new(),
                next_sequence: 0,
            }),
        })
    }

    /// Waits for a download slot.
    ///
    /// Cancel safe: dropping the future before or after admission gives the
    /// slot to the next waiter.
    pub async fn acquire(self: &Arc<Self>, priority: Priority) -> DownloadPermit {
        let rx = {
            let mut state = self.state.lock();
            if state.available > 0 && state.waiters.is_empty() {
                state.available -= 1;
                return DownloadPermit {
                    gate: Some(self.clone()),
                };
            }
            let (tx, rx) = oneshot::channel();
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.waiters.push(Waiter {
                priority,
                sequence,
                tx,
            });
            rx
        };
        match rx.await {
            Ok(permit) => permit,
            // Senders are only dropped by `release` after handing the slot on,
            // which cannot happen while this future holds the gate alive.
            Err(_) => DownloadPermit { gate: None },
        }
    }

    /// Number of waiting acquirers.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Number of free slots.
    #[must_use]
    pub fn available(&self) -> usize {
        self.state.lock().available
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop() {
            let permit = DownloadPermit {
                gate: Some(self.clone()),
            };
            match waiter.tx.send(permit) {
                Ok(()) => return,
                Err(mut unclaimed) => {
                    // Waiter gave up; keep the slot without re-entering release.
                    unclaimed.gate = None;
                }
            }
        }
        state.available += 1;
    }
}
