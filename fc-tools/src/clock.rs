use std::sync::atomic::{AtomicI64, Ordering};

/// Injectable wall clock, per Design Note "No ambient global state": every
/// component that needs "now" takes a `&dyn Clock` instead of calling
/// `proxmox_time::epoch_i64()` directly, so eviction-ordering and
/// access-time tests are deterministic.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
}

#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        proxmox_time::epoch_i64()
    }
}

/// A clock tests can advance by hand.
pub struct TestClock {
    now: AtomicI64,
}

impl TestClock {
    pub fn new(start: i64) -> Self {
        Self { now: AtomicI64::new(start) }
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, value: i64) {
        self.now.store(value, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_unix(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
