//! Message contract for talking to a replica, modeled as Rust traits
//! rather than a wire encoding -- §1/§6: "only its message contract is
//! specified, not its wire encoding". A real deployment implements these
//! against whatever RPC transport it uses; no protobuf/grpc dependency is
//! introduced here.

use std::path::Path;

use async_trait::async_trait;

use fc_api_types::{CopyErrorKind, MachineId, ShortHash};

/// Outcome of fetching content from one replica into a local path.
pub struct FetchOutcome {
    pub bytes_written: i64,
    /// Populated when the copy went through a hashing stream (§4.5
    /// "Trusted vs. untrusted copy").
    pub computed_hash: Option<ShortHash>,
    /// Populated for small files within the blob-inline boundary, so the
    /// placement step doesn't need to re-read from disk.
    pub inline_bytes: Option<Vec<u8>>,
}

#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Fetches `hash` from `replica` into `dest`, reporting progress via
    /// `worker` and enforcing trusted-hash verification when `size` is
    /// within the trusted-hash boundary.
    async fn fetch(
        &self,
        replica: MachineId,
        hash: ShortHash,
        expected_size: Option<i64>,
        dest: &Path,
    ) -> Result<FetchOutcome, CopyErrorKind>;

    /// Confirms `hash` exists on `replica` without transferring it (§4.5
    /// "Verification").
    async fn exists(&self, replica: MachineId, hash: ShortHash) -> Result<bool, CopyErrorKind>;

    /// Proactively pushes local content at `source` to `replica`.
    async fn push(&self, replica: MachineId, hash: ShortHash, source: &Path) -> Result<(), CopyErrorKind>;

    /// Proactively asks `replica` to pull `hash` from this node.
    async fn request_copy(&self, replica: MachineId, hash: ShortHash) -> Result<(), CopyErrorKind>;
}

/// Result of handing freshly-copied content to the caller-provided
/// placement step.
pub struct PlacementResult {
    pub accepted_hash: ShortHash,
    /// True if the placement step moved the temp file out from under the
    /// copier, so the copier must not delete it afterward.
    pub content_moved: bool,
}

#[async_trait]
pub trait PlacementCallback: Send + Sync {
    async fn place(&self, temp_path: &Path, inline_bytes: Option<&[u8]>) -> anyhow::Result<PlacementResult>;
}

/// Buffer sizing thresholds (§4.5 "Buffer sizing").
pub const SMALL_FILE_BOUNDARY: i64 = 64 * 1024;
pub const SMALL_BUFFER_SIZE: usize = 16 * 1024;
pub const LARGE_BUFFER_SIZE: usize = 4 * 1024 * 1024;

pub fn buffer_size_for(size: i64) -> usize {
    if size <= SMALL_FILE_BOUNDARY {
        SMALL_BUFFER_SIZE
    } else if size >= LARGE_BUFFER_SIZE as i64 {
        LARGE_BUFFER_SIZE
    } else {
        size as usize
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn buffer_size_picks_small_for_tiny_files() {
        assert_eq!(buffer_size_for(100), SMALL_BUFFER_SIZE);
    }

    #[test]
    fn buffer_size_picks_large_for_huge_files() {
        assert_eq!(buffer_size_for(100 * 1024 * 1024), LARGE_BUFFER_SIZE);
    }

    #[test]
    fn buffer_size_matches_file_size_in_between() {
        assert_eq!(buffer_size_for(500_000), 500_000);
    }
}
