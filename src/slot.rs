//! Depth-one snapshot slots between parser workers and the display poll.
//!
//! A slot holds at most one pending snapshot. Publishing never blocks: when the
//! consumer has not drained the previous snapshot yet, that snapshot is discarded
//! and the new one takes its place. The producer learns about it through
//! [`DaqError::SnapshotDropped`], which is informational only. Draining returns the
//! latest snapshot or nothing.
//!
//! Snapshots are cumulative histogram states, so the newest one always supersedes
//! the older one without losing counts.

use crate::error::{AppResult, DaqError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct Shared<T> {
    value: Mutex<Option<T>>,
    receiver_alive: AtomicBool,
    superseded: AtomicU64,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        // The critical sections cannot panic half-way, so a poisoned value is intact
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Producer half of a snapshot slot.
#[derive(Debug)]
pub struct SlotSender<T> {
    shared: Arc<Shared<T>>,
}

/// Consumer half of a snapshot slot.
#[derive(Debug)]
pub struct SlotReceiver<T> {
    shared: Arc<Shared<T>>,
}

/// Create a connected sender/receiver pair around an empty slot.
pub fn snapshot_slot<T>() -> (SlotSender<T>, SlotReceiver<T>) {
    let shared = Arc::new(Shared {
        value: Mutex::new(None),
        receiver_alive: AtomicBool::new(true),
        superseded: AtomicU64::new(0),
    });
    (
        SlotSender {
            shared: shared.clone(),
        },
        SlotReceiver { shared },
    )
}

impl<T> SlotSender<T> {
    /// Store `value` as the pending snapshot without blocking.
    ///
    /// # Errors
    ///
    /// - [`DaqError::SnapshotDropped`] if an undrained snapshot was replaced. `value`
    ///   is stored regardless.
    /// - [`DaqError::SlotClosed`] if the receiver is gone. `value` is discarded.
    pub fn try_publish(&self, value: T) -> AppResult<()> {
        if !self.shared.receiver_alive.load(Ordering::Acquire) {
            return Err(DaqError::SlotClosed);
        }
        let previous = self.shared.lock().replace(value);
        match previous {
            None => Ok(()),
            Some(_) => {
                self.shared.superseded.fetch_add(1, Ordering::Relaxed);
                Err(DaqError::SnapshotDropped)
            }
        }
    }

    /// Whether the consumer half has been dropped.
    pub fn is_closed(&self) -> bool {
        !self.shared.receiver_alive.load(Ordering::Acquire)
    }
}

impl<T> SlotReceiver<T> {
    /// Take the pending snapshot, if any.
    pub fn try_take(&self) -> Option<T> {
        self.shared.lock().take()
    }

    /// Whether a snapshot is waiting.
    pub fn has_pending(&self) -> bool {
        self.shared.lock().is_some()
    }

    /// Number of snapshots replaced before they were drained.
    pub fn superseded(&self) -> u64 {
        self.shared.superseded.load(Ordering::Relaxed)
    }
}

impl<T> Drop for SlotReceiver<T> {
    fn drop(&mut self) {
        self.shared.receiver_alive.store(false, Ordering::Release);
    }
}
