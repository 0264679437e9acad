//! LRU content listing and local eviction, grounded on
//! `ChunkStore::get_chunk_iterator`/`sweep_unused_chunks`'s atime-ordered
//! sweep idiom (§4.4 "Purge loop").

use async_trait::async_trait;

use fc_api_types::ShortHash;

#[derive(Clone, Copy, Debug)]
pub struct EvictionCandidate {
    pub hash: ShortHash,
    pub size: i64,
    pub last_access_utc: i64,
}

/// Supplies the purge loop with content ordered least-recently-used first.
#[async_trait]
pub trait ContentLister: Send + Sync {
    async fn list_lru(&self) -> Vec<EvictionCandidate>;

    /// Evicts `candidate` from local storage, returning the bytes freed.
    /// `Ok(0)` (not an error) means the candidate was already gone.
    async fn evict_locally(&self, candidate: &EvictionCandidate) -> anyhow::Result<i64>;
}

/// Confirms a replica still exists elsewhere before the purge loop treats a
/// local copy as safe to evict when distributed eviction is enabled. This
/// mirrors the Distributed Content Copier's existence check (§4.5
/// `verify`); `fc-quota` only depends on the narrow trait, not on
/// `fc-copier` itself, to avoid a cyclic crate dependency.
#[async_trait]
pub trait ReplicaExistenceChecker: Send + Sync {
    async fn exists_elsewhere(&self, hash: ShortHash) -> bool;
}
