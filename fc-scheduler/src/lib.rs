//! Scheduler / Pip Runner (§4.7): advances pips through their execution
//! steps across a pool of workers, selecting a worker per pip, dispatching
//! steps, and enforcing the retry-on-exit-code policy.

pub mod artifacts;
pub mod retry;
pub mod scheduler;
pub mod worker_pool;

pub use retry::should_retry;
pub use scheduler::Scheduler;
pub use worker_pool::{WorkerHandle, WorkerPool};
