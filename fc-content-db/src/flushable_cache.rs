//! Write-back overlay cache in front of a `Cldb` (§4.2). Grounded on the
//! teacher's `proxmox-rrd::cache` journal/generation-swap design: writes go
//! into an in-memory generation, and flushing swaps that generation out
//! for a fresh, empty one so writers never block behind an in-progress
//! flush.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Error;

use fc_api_types::{ContentLocationEntry, ShortHash};
use fc_tools::{ParallelHandler, WorkerTaskContext};

use crate::cldb::{Cldb, WriteReason};

/// A pending write: `None` means "delete this key on flush".
#[derive(Clone)]
enum PendingWrite {
    Upsert(ContentLocationEntry),
    Delete,
}

struct Generation {
    writes: BTreeMap<ShortHash, PendingWrite>,
}

impl Generation {
    fn new() -> Self {
        Self { writes: BTreeMap::new() }
    }
}

/// Tunables controlling how a flush is driven. Grounded on the teacher's
/// `proxmox-rrd` cache-flush job parameters.
#[derive(Clone, Copy, Debug)]
pub struct FlushPolicy {
    /// Maximum writes flushed in a single transaction against the backing
    /// `Cldb`.
    pub flush_transaction_size: usize,
    /// Number of transactions run concurrently during a flush.
    pub flush_degree_of_parallelism: usize,
    /// Fraction (0.0-1.0) of the flushing generation kept resident in the
    /// in-memory overlay after a flush completes, so a key that was just
    /// flushed and is immediately re-read doesn't have to fall through to
    /// the backing store.
    pub flush_preserve_percent_in_memory: f64,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            flush_transaction_size: 512,
            flush_degree_of_parallelism: 4,
            flush_preserve_percent_in_memory: 0.1,
        }
    }
}

/// Write-back cache overlaying a `Cldb`. Reads are served from the active
/// generation first, then the generation currently being flushed, then the
/// backing database -- in that order, so a reader never observes a write
/// "going backwards" mid-flush (§4.2 ordering contract).
pub struct FlushableCache {
    backing: Arc<Cldb>,
    active: Mutex<Generation>,
    flushing: Mutex<Option<Generation>>,
    policy: FlushPolicy,
}

impl FlushableCache {
    pub fn new(backing: Arc<Cldb>, policy: FlushPolicy) -> Self {
        Self {
            backing,
            active: Mutex::new(Generation::new()),
            flushing: Mutex::new(None),
            policy,
        }
    }

    /// The `Cldb` this cache writes back into. Callers that need to act on
    /// the database directly once it's known to be fully flushed (e.g. the
    /// checkpoint manager) go through this rather than holding their own
    /// reference to the same `Cldb`.
    pub fn backing(&self) -> &Cldb {
        &self.backing
    }

    /// Queues an upsert. Visible to subsequent `try_get_entry` calls
    /// immediately; not visible to the backing `Cldb` until a flush runs.
    pub fn put(&self, hash: ShortHash, entry: ContentLocationEntry) {
        self.active.lock().unwrap().writes.insert(hash, PendingWrite::Upsert(entry));
    }

    pub fn delete(&self, hash: ShortHash) {
        self.active.lock().unwrap().writes.insert(hash, PendingWrite::Delete);
    }

    /// Reads through active generation, then the flushing generation (if a
    /// flush is in progress), then the backing store.
    pub fn try_get_entry(&self, hash: &ShortHash) -> Option<ContentLocationEntry> {
        if let Some(write) = self.active.lock().unwrap().writes.get(hash) {
            return Self::resolve(write);
        }
        if let Some(flushing) = self.flushing.lock().unwrap().as_ref() {
            if let Some(write) = flushing.writes.get(hash) {
                return Self::resolve(write);
            }
        }
        self.backing.try_get_entry(hash)
    }

    fn resolve(write: &PendingWrite) -> Option<ContentLocationEntry> {
        match write {
            PendingWrite::Upsert(entry) => Some(entry.clone()),
            PendingWrite::Delete => None,
        }
    }

    /// Number of writes queued in the active generation, not yet flushed.
    pub fn pending_len(&self) -> usize {
        self.active.lock().unwrap().writes.len()
    }

    /// Swaps the active generation out and drains it into the backing
    /// `Cldb` in parallel transactions of `flush_transaction_size`,
    /// preserving the configured tail fraction in memory afterward.
    pub fn flush(&self, worker: &dyn WorkerTaskContext) -> Result<usize, Error> {
        let outgoing = {
            let mut active = self.active.lock().unwrap();
            if active.writes.is_empty() {
                return Ok(0);
            }
            std::mem::replace(&mut *active, Generation::new())
        };

        let entries: Vec<(ShortHash, PendingWrite)> = outgoing.writes.iter().map(|(k, v)| (*k, v.clone())).collect();
        *self.flushing.lock().unwrap() = Some(outgoing);

        let flushed_count = entries.len();
        let chunks: Vec<Vec<(ShortHash, PendingWrite)>> = entries
            .chunks(self.policy.flush_transaction_size.max(1))
            .map(|c| c.to_vec())
            .collect();

        let backing = Arc::clone(&self.backing);
        let handler: ParallelHandler<Vec<(ShortHash, PendingWrite)>> = ParallelHandler::new(
            "cldb-flush",
            self.policy.flush_degree_of_parallelism.max(1),
            move |chunk: Vec<(ShortHash, PendingWrite)>| {
                for (hash, write) in chunk {
                    let entry = match write {
                        PendingWrite::Upsert(entry) => Some(entry),
                        PendingWrite::Delete => None,
                    };
                    backing.store(hash, entry, WriteReason::LocationAdded);
                }
                Ok(())
            },
        );

        for chunk in chunks {
            worker.check_abort()?;
            handler.send(chunk)?;
        }
        handler.complete()?;

        let tail_len = ((flushed_count as f64) * self.policy.flush_preserve_percent_in_memory) as usize;
        let mut flushing = self.flushing.lock().unwrap();
        if let Some(generation) = flushing.take() {
            if tail_len > 0 {
                let mut active = self.active.lock().unwrap();
                for (hash, write) in generation.writes.into_iter().rev().take(tail_len) {
                    active.writes.entry(hash).or_insert(write);
                }
            }
        }

        Ok(flushed_count)
    }

    /// Runs `flush` repeatedly until the active generation is empty,
    /// waiting `retry_delay` between rounds if a concurrent writer keeps
    /// feeding it faster than it drains.
    pub fn flush_until_empty(
        &self,
        worker: &dyn WorkerTaskContext,
        retry_delay: Duration,
    ) -> Result<usize, Error> {
        let mut total = 0;
        loop {
            worker.check_abort()?;
            let flushed = self.flush(worker)?;
            total += flushed;
            if self.pending_len() == 0 {
                return Ok(total);
            }
            std::thread::sleep(retry_delay);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::roster::AllActiveRoster;
    use fc_api_types::{MachineId, MachineIdSet};
    use fc_tools::{StandaloneTaskContext, TestClock};

    fn entry(machine: u32) -> ContentLocationEntry {
        ContentLocationEntry {
            locations: MachineIdSet::from_ids([MachineId(machine)]),
            content_size: 10,
            last_access_utc: 1_000,
            creation_utc: 1_000,
        }
    }

    #[test]
    fn reads_see_unflushed_writes_immediately() {
        let db = Arc::new(Cldb::new(Arc::new(AllActiveRoster), Arc::new(TestClock::new(1_000)), None));
        let cache = FlushableCache::new(db, FlushPolicy::default());
        let hash = ShortHash([1u8; 12]);
        cache.put(hash, entry(1));
        assert!(cache.try_get_entry(&hash).is_some());
    }

    #[test]
    fn flush_drains_into_backing_store() {
        let db = Arc::new(Cldb::new(Arc::new(AllActiveRoster), Arc::new(TestClock::new(1_000)), None));
        let cache = FlushableCache::new(Arc::clone(&db), FlushPolicy {
            flush_transaction_size: 2,
            flush_degree_of_parallelism: 2,
            flush_preserve_percent_in_memory: 0.0,
        });
        for i in 0..10u8 {
            cache.put(ShortHash([i; 12]), entry(i as u32));
        }
        let flushed = cache.flush(&StandaloneTaskContext).unwrap();
        assert_eq!(flushed, 10);
        assert_eq!(cache.pending_len(), 0);
        assert!(db.try_get_entry(&ShortHash([3u8; 12])).is_some());
    }

    #[test]
    fn delete_overrides_backing_entry() {
        let db = Arc::new(Cldb::new(Arc::new(AllActiveRoster), Arc::new(TestClock::new(1_000)), None));
        let hash = ShortHash([9u8; 12]);
        db.location_added(hash, MachineId(1), 5, false);

        let cache = FlushableCache::new(db, FlushPolicy::default());
        cache.delete(hash);
        assert!(cache.try_get_entry(&hash).is_none());
    }
}
