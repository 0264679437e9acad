//! Worker-side slot and resource coordination (§4.6): process/cache-lookup/
//! IPC slot accounting, RAM/commit semaphores, content-availability
//! tracking, and the per-step operation surface a local or remote worker
//! implements.

pub mod availability;
pub mod resources;
pub mod slots;
pub mod worker;

pub use availability::AvailabilityTracker;
pub use resources::{
    default_commit_per_proc_mb, default_memory_per_proc_mb, scale_historical_mb, LimitingResource,
    ResourceReservation, ResourceSemaphores,
};
pub use slots::SlotCounter;
pub use worker::{AcquireOutcome, AcquiredSlot, AcquiredSlotKind, SlotLimits, StepOutcome, Worker, WorkerStepOps};
