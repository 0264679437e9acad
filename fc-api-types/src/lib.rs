//! Shared data model for the forgecache scheduler and content cache.
//!
//! Kept dependency-light and free of I/O so every other crate in the
//! workspace can depend on it without pulling in filesystem, network, or
//! async runtime concerns.

pub mod checkpoint;
pub mod content_hash;
pub mod error;
pub mod location;
pub mod machine;
pub mod pip;
pub mod worker;

pub use checkpoint::{CheckpointState, EventSequencePoint, INCREMENTAL_SUFFIX};
pub use content_hash::{ContentHash, ShortHash};
pub use error::{CldbError, CopyErrorKind, ReservationError, Reputation};
pub use location::ContentLocationEntry;
pub use machine::{MachineId, MachineIdSet};
pub use pip::{
    ArtifactId, Fingerprinter, Pip, PipExecutionResult, PipExecutionStep, PipId, PipKind,
    ProcessPip, RunnablePip, SemiStableHash,
};
pub use worker::{WorkerId, WorkerNodeStatus};
