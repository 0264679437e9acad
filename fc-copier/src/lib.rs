//! Distributed Content Copier: retry/walk algorithm, reputation tracking,
//! and proactive push/request (§4.5).

pub mod copier;
pub mod reputation;
pub mod rpc;

pub use copier::{Copier, CopierConfig, CopyWalkOutcome, VerifyReport};
pub use reputation::ReputationTracker;
pub use rpc::{
    buffer_size_for, ContentFetcher, FetchOutcome, PlacementCallback, PlacementResult,
    LARGE_BUFFER_SIZE, SMALL_BUFFER_SIZE, SMALL_FILE_BOUNDARY,
};
