//! Content-Location Database and its write-back overlay cache (§4.1, §4.2).

pub mod checkpoint_io;
pub mod cldb;
pub mod flushable_cache;
pub mod gc;
pub mod roster;

pub use cldb::{Cldb, GcSummary, WriteReason, NUM_SHARDS};
pub use flushable_cache::{FlushPolicy, FlushableCache};
pub use gc::{EntryOperation, GcReason, GcTraceEvent, GcTraceQueue, GcTraceSink, LoggingTraceSink};
pub use roster::{AllActiveRoster, MachineRoster, SetRoster};
