//! Process/cache-lookup/IPC slot counters. Plain `AtomicU32` CAS loops,
//! per §5 "slot CAS loops do not suspend" -- no lock, no await, ever.

use std::sync::atomic::{AtomicU32, Ordering};

pub struct SlotCounter {
    acquired: AtomicU32,
    total: AtomicU32,
}

impl SlotCounter {
    pub fn new(total: u32) -> Self {
        Self { acquired: AtomicU32::new(0), total: AtomicU32::new(total) }
    }

    pub fn acquired(&self) -> u32 {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u32 {
        self.total.load(Ordering::SeqCst)
    }

    /// Sets the effective total, e.g. when a resource-available transition
    /// throttles capacity (§4.6 "State machine").
    pub fn set_total(&self, total: u32) {
        self.total.store(total, Ordering::SeqCst);
    }

    /// Unconditional increment, used by `tryAcquireCacheLookup(pip, force=true)`.
    pub fn force_acquire(&self) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }

    /// CAS loop: succeeds while `acquired + weight <= total`, with one
    /// exception -- a request arriving when nothing is acquired always
    /// succeeds, even if its own weight exceeds `total`. This lets a single
    /// oversized pip run alone; the worker then refuses to admit anything
    /// else until it releases (enforced in `Worker::try_acquire`).
    pub fn try_acquire_weighted(&self, weight: u32) -> bool {
        loop {
            let current = self.acquired.load(Ordering::SeqCst);
            let total = self.total.load(Ordering::SeqCst);
            if current > 0 && current.saturating_add(weight) > total {
                return false;
            }
            if self
                .acquired
                .compare_exchange(current, current + weight, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_weighted(1)
    }

    pub fn release_weighted(&self, weight: u32) {
        self.acquired.fetch_sub(weight, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.release_weighted(1);
    }
}
