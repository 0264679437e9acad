use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, format_err, Error};

use fc_api_types::{ContentLocationEntry, MachineId, MachineIdSet, ShortHash};
use fc_tools::{Clock, WorkerTaskContext};

use crate::gc::{EntryOperation, GcReason, GcTraceEvent, GcTraceQueue};
use crate::roster::MachineRoster;

/// Number of independent shards the key space is striped across. Each
/// shard owns its own lock and its own slice of the sorted map, so writes
/// to different shards never contend and a full sorted scan touches shards
/// in an order uncorrelated with insertion order (§4.1 Invariant b).
pub const NUM_SHARDS: usize = 256;

struct Shard {
    map: Mutex<BTreeMap<ShortHash, ContentLocationEntry>>,
}

/// The Content-Location Database: maps a short content hash to the set of
/// machines holding that content (§4.1).
pub struct Cldb {
    shards: Vec<Shard>,
    metadata: RwLock<BTreeMap<String, String>>,
    writable: AtomicBool,
    roster: Arc<dyn MachineRoster>,
    clock: Arc<dyn Clock>,
    gc_trace: Option<Arc<GcTraceQueue>>,
    touch_interval_secs: i64,
}

/// Reason a `store` happened, forwarded to the GC trace queue.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WriteReason {
    LocationAdded,
    LocationRemoved,
    GarbageCollect,
}

impl Cldb {
    pub fn new(
        roster: Arc<dyn MachineRoster>,
        clock: Arc<dyn Clock>,
        gc_trace: Option<Arc<GcTraceQueue>>,
    ) -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| Shard { map: Mutex::new(BTreeMap::new()) }).collect(),
            metadata: RwLock::new(BTreeMap::new()),
            writable: AtomicBool::new(true),
            roster,
            clock,
            gc_trace,
            touch_interval_secs: 60,
        }
    }

    fn shard_for(&self, hash: &ShortHash) -> &Shard {
        &self.shards[hash.stripe_index(self.shards.len())]
    }

    /// Returns the entry for `hash`, with inactive machines filtered out
    /// (Invariant a). Returns `None` for a miss, distinct from an entry
    /// that exists but whose locations are now all inactive (that case
    /// still returns `Some` with a filtered, possibly-empty location set --
    /// callers that need "absent" semantics should check `is_absent()`).
    pub fn try_get_entry(&self, hash: &ShortHash) -> Option<ContentLocationEntry> {
        let shard = self.shard_for(hash);
        let map = shard.map.lock().unwrap();
        map.get(hash).map(|entry| self.filter_inactive(entry))
    }

    fn filter_inactive(&self, entry: &ContentLocationEntry) -> ContentLocationEntry {
        let (locations, _changed) = entry.locations.retain_active(|id| self.roster.is_active(id));
        ContentLocationEntry { locations, ..entry.clone() }
    }

    /// Stores `entry`, or deletes the key if `entry` is `None` or absent
    /// (empty locations), atomically with respect to concurrent
    /// `try_get_entry` (Invariant c).
    pub fn store(&self, hash: ShortHash, entry: Option<ContentLocationEntry>, reason: WriteReason) {
        let shard = self.shard_for(&hash);
        let mut map = shard.map.lock().unwrap();
        match entry {
            Some(entry) if !entry.is_absent() => {
                map.insert(hash, entry);
                self.trace(hash, EntryOperation::Updated, reason);
            }
            _ => {
                if map.remove(&hash).is_some() {
                    self.trace(hash, EntryOperation::Deleted, reason);
                }
            }
        }
    }

    fn trace(&self, hash: ShortHash, op: EntryOperation, reason: WriteReason) {
        if let Some(queue) = &self.gc_trace {
            let reason = match reason {
                WriteReason::GarbageCollect => GcReason::GarbageCollect,
                _ => GcReason::Explicit,
            };
            queue.record(GcTraceEvent { hash, op, reason });
        }
    }

    /// Records that `machine` now holds `hash`. Creates the entry on first
    /// call for a given hash.
    pub fn location_added(
        &self,
        hash: ShortHash,
        machine: MachineId,
        size: i64,
        reconciling: bool,
    ) {
        let now = self.clock.now_unix();
        let shard = self.shard_for(&hash);
        let mut map = shard.map.lock().unwrap();
        let updated = match map.get(&hash) {
            Some(existing) => {
                let locations = existing.locations.set_existence(machine, true);
                ContentLocationEntry {
                    locations,
                    content_size: existing.content_size,
                    creation_utc: existing.creation_utc,
                    last_access_utc: if reconciling { existing.last_access_utc } else { now },
                }
            }
            None => ContentLocationEntry {
                locations: MachineIdSet::from_ids([machine]),
                content_size: size,
                creation_utc: now,
                last_access_utc: now,
            },
        };
        map.insert(hash, updated);
        self.trace(hash, EntryOperation::Updated, WriteReason::LocationAdded);
    }

    /// Removes `machine` from `hash`'s location set, deleting the entry if
    /// it becomes empty.
    pub fn location_removed(&self, hash: ShortHash, machine: MachineId, _reconciling: bool) {
        let shard = self.shard_for(&hash);
        let mut map = shard.map.lock().unwrap();
        let Some(existing) = map.get(&hash) else { return };
        let locations = existing.locations.set_existence(machine, false);
        if locations.is_empty() {
            map.remove(&hash);
            self.trace(hash, EntryOperation::Deleted, WriteReason::LocationRemoved);
        } else {
            let updated = ContentLocationEntry { locations, ..existing.clone() };
            map.insert(hash, updated);
            self.trace(hash, EntryOperation::Updated, WriteReason::LocationRemoved);
        }
    }

    /// Updates `lastAccessUtc`. Per the resolved Open Question, this is a
    /// no-op when the touch-frequency interval has not elapsed -- a policy
    /// choice preserved from the source, not an oversight.
    pub fn content_touched(&self, hash: ShortHash, access_time: i64) {
        let shard = self.shard_for(&hash);
        let mut map = shard.map.lock().unwrap();
        if let Some(existing) = map.get(&hash) {
            if access_time - existing.last_access_utc < self.touch_interval_secs {
                return;
            }
            let mut updated = existing.clone();
            updated.last_access_utc = access_time;
            map.insert(hash, updated);
        }
    }

    /// All keys across all shards, in sorted order.
    pub fn enumerate_sorted_keys(&self) -> Vec<ShortHash> {
        let mut keys = Vec::new();
        for shard in &self.shards {
            keys.extend(shard.map.lock().unwrap().keys().copied());
        }
        keys.sort();
        keys
    }

    /// All entries across all shards, sorted by key, optionally filtered.
    pub fn enumerate_entries_with_sorted_keys(
        &self,
        filter: Option<&dyn Fn(&ShortHash, &ContentLocationEntry) -> bool>,
    ) -> Vec<(ShortHash, ContentLocationEntry)> {
        let mut entries = Vec::new();
        for shard in &self.shards {
            let map = shard.map.lock().unwrap();
            for (k, v) in map.iter() {
                if filter.map(|f| f(k, v)).unwrap_or(true) {
                    entries.push((*k, v.clone()));
                }
            }
        }
        entries.sort_by_key(|(k, _)| *k);
        entries
    }

    pub fn compare_exchange_metadata(
        &self,
        key: &str,
        expected: Option<&str>,
        new: String,
    ) -> bool {
        let mut metadata = self.metadata.write().unwrap();
        let current = metadata.get(key).map(|s| s.as_str());
        if current != expected {
            return false;
        }
        metadata.insert(key.to_string(), new);
        true
    }

    pub fn get_metadata(&self, key: &str) -> Option<String> {
        self.metadata.read().unwrap().get(key).cloned()
    }

    pub fn get_selectors(&self, prefix: &str) -> Vec<String> {
        self.metadata
            .read()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn set_database_mode(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    /// Content-addressed checkpoint files are immutable by construction
    /// (see `checkpoint_io`): their name embeds a checksum of their
    /// contents, so two snapshots that produce byte-identical shard data
    /// produce byte-identical, reusable filenames.
    pub fn is_immutable(file: &Path) -> bool {
        crate::checkpoint_io::is_content_addressed_name(file)
    }

    /// Persists a consistent snapshot of every entry into `dir` (Invariant
    /// d). See `checkpoint_io` for the on-disk layout.
    pub fn save_checkpoint(&self, dir: &Path) -> Result<Vec<PathBuf>, Error> {
        crate::checkpoint_io::save(self, dir)
    }

    /// Restores the CLDB from a directory previously produced by
    /// `save_checkpoint`, replacing all current entries.
    pub fn restore_checkpoint(&self, dir: &Path) -> Result<(), Error> {
        crate::checkpoint_io::restore(self, dir)
    }

    fn replace_all(&self, entries: Vec<(ShortHash, ContentLocationEntry)>) {
        let mut per_shard: Vec<BTreeMap<ShortHash, ContentLocationEntry>> =
            (0..self.shards.len()).map(|_| BTreeMap::new()).collect();
        for (hash, entry) in entries {
            let idx = hash.stripe_index(self.shards.len());
            per_shard[idx].insert(hash, entry);
        }
        for (shard, new_map) in self.shards.iter().zip(per_shard.into_iter()) {
            *shard.map.lock().unwrap() = new_map;
        }
    }

    pub(crate) fn snapshot_for_shard(&self, idx: usize) -> BTreeMap<ShortHash, ContentLocationEntry> {
        self.shards[idx].map.lock().unwrap().clone()
    }

    /// Runs one garbage-collection pass: filters inactive machines from
    /// every entry, deleting entries that become empty (§4.1 "Garbage
    /// collection"). Only runs while writable.
    pub fn garbage_collect(&self, worker: &dyn WorkerTaskContext) -> Result<GcSummary, Error> {
        if !self.is_writable() {
            bail!("cannot run garbage collection on a read-only database");
        }

        let mut summary = GcSummary::default();
        for hash in self.enumerate_sorted_keys() {
            worker.check_abort()?;
            let shard = self.shard_for(&hash);
            let mut map = shard.map.lock().unwrap();
            // Re-read under the lock: the sorted key snapshot above may be
            // stale, so re-check before mutating to avoid a lost update
            // against a concurrent `location_added`/`location_removed`.
            let Some(existing) = map.get(&hash).cloned() else { continue };
            let (filtered, changed) = existing.locations.retain_active(|id| self.roster.is_active(id));
            if !changed {
                continue;
            }
            if filtered.is_empty() {
                map.remove(&hash);
                drop(map);
                self.trace(hash, EntryOperation::Deleted, WriteReason::GarbageCollect);
                summary.deleted += 1;
            } else {
                let updated = ContentLocationEntry { locations: filtered, ..existing };
                map.insert(hash, updated);
                drop(map);
                self.trace(hash, EntryOperation::Updated, WriteReason::GarbageCollect);
                summary.pruned += 1;
            }
        }
        Ok(summary)
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcSummary {
    pub deleted: u64,
    pub pruned: u64,
}

pub(crate) fn load_error(context: &str, err: impl std::fmt::Display) -> Error {
    format_err!("{context}: {err}")
}

impl Cldb {
    pub(crate) fn take_snapshot(&self) -> Vec<BTreeMap<ShortHash, ContentLocationEntry>> {
        (0..self.shards.len()).map(|i| self.snapshot_for_shard(i)).collect()
    }

    pub(crate) fn replace_all_pub(&self, entries: Vec<(ShortHash, ContentLocationEntry)>) {
        self.replace_all(entries)
    }

    pub(crate) fn metadata_snapshot(&self) -> BTreeMap<String, String> {
        self.metadata.read().unwrap().clone()
    }

    pub(crate) fn replace_metadata(&self, metadata: BTreeMap<String, String>) {
        *self.metadata.write().unwrap() = metadata;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::roster::{AllActiveRoster, SetRoster};
    use fc_tools::TestClock;

    fn db_with_roster(roster: Arc<dyn MachineRoster>) -> Cldb {
        Cldb::new(roster, Arc::new(TestClock::new(1_000)), None)
    }

    #[test]
    fn location_add_then_remove_deletes_entry() {
        let db = db_with_roster(Arc::new(AllActiveRoster));
        let hash = ShortHash([1u8; 12]);
        db.location_added(hash, MachineId(1), 100, false);
        assert!(db.try_get_entry(&hash).is_some());
        db.location_removed(hash, MachineId(1), false);
        assert!(db.try_get_entry(&hash).unwrap().is_absent() || db.try_get_entry(&hash).is_none());
        // the entry is fully gone, not merely empty
        assert!(db.try_get_entry(&hash).is_none());
    }

    #[test]
    fn try_get_entry_filters_inactive_machines() {
        let roster = Arc::new(SetRoster::new([MachineId(1)]));
        let db = db_with_roster(roster.clone());
        let hash = ShortHash([2u8; 12]);
        db.location_added(hash, MachineId(1), 10, false);
        db.location_added(hash, MachineId(2), 10, false);

        let entry = db.try_get_entry(&hash).unwrap();
        assert!(entry.locations.contains(MachineId(1)));
        assert!(!entry.locations.contains(MachineId(2)));
    }

    #[test]
    fn invariant_never_returns_empty_non_absent_entry() {
        // After any sequence of location_added/location_removed,
        // try_get_entry returns either None or a non-empty entry.
        let db = db_with_roster(Arc::new(AllActiveRoster));
        let hash = ShortHash([3u8; 12]);
        db.location_added(hash, MachineId(1), 5, false);
        db.location_added(hash, MachineId(2), 5, false);
        db.location_removed(hash, MachineId(1), false);
        db.location_removed(hash, MachineId(2), false);
        assert!(db.try_get_entry(&hash).is_none());
    }

    #[test]
    fn content_touched_is_noop_within_interval() {
        let clock = Arc::new(TestClock::new(1_000));
        let db = Cldb::new(Arc::new(AllActiveRoster), clock, None);
        let hash = ShortHash([4u8; 12]);
        db.location_added(hash, MachineId(1), 5, false);
        let before = db.try_get_entry(&hash).unwrap().last_access_utc;
        db.content_touched(hash, before + 1); // well within the 60s interval
        let after = db.try_get_entry(&hash).unwrap().last_access_utc;
        assert_eq!(before, after);

        db.content_touched(hash, before + 120);
        let after = db.try_get_entry(&hash).unwrap().last_access_utc;
        assert_eq!(after, before + 120);
    }

    #[test]
    fn garbage_collect_removes_entries_with_no_active_locations() {
        let roster = Arc::new(SetRoster::default());
        let db = db_with_roster(roster.clone());
        let hash = ShortHash([5u8; 12]);
        db.location_added(hash, MachineId(9), 5, false);
        assert!(db.try_get_entry(&hash).unwrap().locations.is_empty());

        let summary = db.garbage_collect(&fc_tools::StandaloneTaskContext).unwrap();
        assert_eq!(summary.deleted, 1);
        assert!(db.try_get_entry(&hash).is_none());
    }

    #[test]
    fn compare_exchange_metadata_only_succeeds_on_match() {
        let db = db_with_roster(Arc::new(AllActiveRoster));
        assert!(db.compare_exchange_metadata("k", None, "v1".into()));
        assert!(!db.compare_exchange_metadata("k", None, "v2".into()));
        assert!(db.compare_exchange_metadata("k", Some("v1"), "v2".into()));
        assert_eq!(db.get_metadata("k").unwrap(), "v2");
    }
}
