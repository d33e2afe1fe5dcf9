//! Queue reservation ledger.
//!
//! A [`QueuePool`] records how many queues of each (device, queue family)
//! pair are held by live solvers. Its mutex doubles as the construction lock:
//! a solver holds it from instance creation until every device object exists,
//! so two constructions never act on the same snapshot.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, MutexGuard};

use crate::device::{select_queue_family, DeviceCandidate, QueueSelection};
use crate::error::Result;

/// One queue family on one physical device, by enumeration index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueSlot {
    pub device_index: u32,
    pub family_index: u32,
}

/// Reserved queue counts per slot.
#[derive(Debug, Default)]
pub struct Ledger {
    reserved: HashMap<QueueSlot, u32>,
}

impl Ledger {
    pub fn reserved(&self, slot: QueueSlot) -> u32 {
        self.reserved.get(&slot).copied().unwrap_or(0)
    }

    pub fn total_reserved(&self) -> u32 {
        self.reserved.values().sum()
    }

    /// Pick a queue family from `candidates` and hold one of its queues.
    ///
    /// The hold is undone when the returned guard drops, unless it is
    /// committed first.
    pub fn reserve<'a>(
        &'a mut self,
        candidates: &[DeviceCandidate],
    ) -> Result<PendingReservation<'a>> {
        let selection = select_queue_family(candidates, self)?;
        *self.reserved.entry(selection.slot).or_insert(0) += 1;
        tracing::debug!(
            device = selection.slot.device_index,
            family = selection.slot.family_index,
            reserved = self.reserved(selection.slot),
            capacity = selection.queue_count,
            "queue reserved"
        );
        Ok(PendingReservation {
            ledger: self,
            selection,
            committed: false,
        })
    }

    fn release(&mut self, slot: QueueSlot) {
        match self.reserved.get_mut(&slot) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.reserved.remove(&slot);
            }
            None => tracing::warn!(?slot, "released a queue that was never reserved"),
        }
    }
}

/// Process-wide (or test-local) pool of queue reservations.
#[derive(Debug, Default)]
pub struct QueuePool {
    ledger: Mutex<Ledger>,
}

impl QueuePool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Lazily created pool shared by every caller that asks for it.
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<QueuePool>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(QueuePool::new))
    }

    /// Take the construction lock.
    pub fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock()
    }

    pub fn reserved(&self, slot: QueueSlot) -> u32 {
        self.ledger.lock().reserved(slot)
    }

    pub fn total_reserved(&self) -> u32 {
        self.ledger.lock().total_reserved()
    }
}

/// A queue held while construction is still in progress.
///
/// Borrows the locked ledger, so it cannot outlive the construction lock.
/// Dropping it without [`commit`](Self::commit) gives the queue back.
#[derive(Debug)]
pub struct PendingReservation<'a> {
    ledger: &'a mut Ledger,
    selection: QueueSelection,
    committed: bool,
}

impl PendingReservation<'_> {
    pub fn selection(&self) -> &QueueSelection {
        &self.selection
    }

    /// Keep the queue for the lifetime of the returned [`Reservation`].
    pub fn commit(mut self, pool: &Arc<QueuePool>) -> Reservation {
        self.committed = true;
        Reservation {
            pool: Arc::clone(pool),
            slot: self.selection.slot,
        }
    }
}

impl Drop for PendingReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            tracing::debug!(slot = ?self.selection.slot, "construction failed, queue returned");
            self.ledger.release(self.selection.slot);
        }
    }
}

/// A committed queue reservation. Dropping it returns the queue to the pool.
///
/// Must not be dropped while the same pool's lock is held by this thread.
#[derive(Debug)]
pub struct Reservation {
    pool: Arc<QueuePool>,
    slot: QueueSlot,
}

impl Reservation {
    pub fn slot(&self) -> QueueSlot {
        self.slot
    }

    pub fn pool(&self) -> &Arc<QueuePool> {
        &self.pool
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.pool.lock().release(self.slot);
    }
}
