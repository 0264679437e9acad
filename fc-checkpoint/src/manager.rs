//! Checkpoint creation and restore against a `CentralStorage` +
//! `CheckpointRegistry` pair (§4.3).
//!
//! A full checkpoint and an incremental checkpoint both come down to the
//! same shape underneath: a manifest of `relativePath -> storageId` plus
//! the blobs it names. A full checkpoint additionally zips the staging
//! directory as a human-downloadable export (exactly how the teacher uses
//! `zip_directory` for its restore-daemon file browser) but `restore`
//! itself only ever reads the manifest form, so the two paths share code.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Error};
use proxmox_uuid::Uuid;

use fc_api_types::EventSequencePoint;
use fc_content_db::{Cldb, FlushableCache};
use fc_tools::{task_warn, Clock, WorkerTaskContext};

use crate::central_storage::CentralStorage;
use crate::manifest::Manifest;
use crate::registry::{CheckpointRegistry, RegisteredCheckpoint};

const MANIFEST_FILE: &str = "checkpointInfo.txt";

pub struct CheckpointManager {
    storage: Arc<dyn CentralStorage>,
    registry: Arc<dyn CheckpointRegistry>,
    incremental_dir: PathBuf,
    clock: Arc<dyn Clock>,
}

/// Commits the new manifest to disk only if dropped after `commit()`;
/// otherwise the write is left undone, so a half-finished checkpoint never
/// makes the local manifest visible (§4.3 "Failure semantics").
struct IncrementalStateGuard<'a> {
    manifest_path: &'a Path,
    tmp_path: PathBuf,
    committed: bool,
}

impl<'a> IncrementalStateGuard<'a> {
    fn new(manifest_path: &'a Path) -> Self {
        let tmp_path = manifest_path.with_extension("tmp");
        Self { manifest_path, tmp_path, committed: false }
    }

    fn stage(&self, manifest: &Manifest) -> Result<(), Error> {
        manifest.save(&self.tmp_path)
    }

    fn commit(mut self) -> Result<(), Error> {
        fs::rename(&self.tmp_path, self.manifest_path)
            .with_context(|| format!("committing manifest {:?}", self.manifest_path))?;
        self.committed = true;
        Ok(())
    }
}

impl<'a> Drop for IncrementalStateGuard<'a> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

impl CheckpointManager {
    pub fn new(
        storage: Arc<dyn CentralStorage>,
        registry: Arc<dyn CheckpointRegistry>,
        incremental_dir: PathBuf,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, registry, incremental_dir, clock }
    }

    fn manifest_path(&self) -> PathBuf {
        self.incremental_dir.join(MANIFEST_FILE)
    }

    fn previous_manifest(&self) -> Manifest {
        Manifest::load(&self.manifest_path()).unwrap_or_default()
    }

    /// Full checkpoint: flush the write-back cache, snapshot, zip for
    /// export, upload every blob individually, and register under
    /// `checkpoints/{sequence}.{uuid}`.
    pub async fn save_full_checkpoint(
        &self,
        cache: &FlushableCache,
        sequence_point: EventSequencePoint,
        worker: &dyn WorkerTaskContext,
    ) -> Result<String, Error> {
        cache.flush(worker)?;

        let staging = tempfile::tempdir().context("creating checkpoint staging dir")?;
        cache.backing().save_checkpoint(staging.path())?;
        worker.check_abort()?;

        let checkpoint_id = format!("{}.{}", sequence_point.0, Uuid::generate());

        let zip_path = staging.path().join("export.zip.tmp");
        if let Err(err) = self.zip_export(staging.path(), &zip_path).await {
            task_warn!(worker, "checkpoint export zip failed (non-fatal): {err:#}");
        } else {
            let zip_key = format!("checkpoints/{checkpoint_id}.zip");
            if let Err(err) = self.storage.put(&zip_key, &zip_path).await {
                task_warn!(worker, "uploading checkpoint export zip failed (non-fatal): {err:#}");
            }
        }

        let manifest = self.upload_blobs(staging.path(), "checkpoints/blobs", worker).await?;

        let manifest_key = format!("checkpoints/{checkpoint_id}.txt");
        let manifest_local = staging.path().join(MANIFEST_FILE);
        manifest.save(&manifest_local)?;
        self.storage.put(&manifest_key, &manifest_local).await?;

        self.registry
            .register(RegisteredCheckpoint {
                checkpoint_id: checkpoint_id.clone(),
                sequence_point,
                storage_key: manifest_key,
            })
            .await?;

        Ok(checkpoint_id)
    }

    async fn zip_export(&self, staging: &Path, dest: &Path) -> Result<(), Error> {
        let file = tokio::fs::File::create(dest).await.context("creating export zip")?;
        proxmox_compression::zip::zip_directory(file, staging)
            .await
            .context("zipping checkpoint staging dir")
    }

    /// Incremental checkpoint: flush the write-back cache, reuse storage ids
    /// for unchanged immutable files, upload the rest, finalize by pruning
    /// local files the new manifest no longer references (§4.3). Blobs and
    /// the manifest live under `incrementalCheckpoints/{sequence}.{uuid}.*`
    /// so two incremental saves sharing a sequence point never collide on
    /// the same storage keys (§6 "Checkpoint storage layout").
    pub async fn save_incremental_checkpoint(
        &self,
        cache: &FlushableCache,
        sequence_point: EventSequencePoint,
        worker: &dyn WorkerTaskContext,
    ) -> Result<String, Error> {
        cache.flush(worker)?;

        fs::create_dir_all(&self.incremental_dir)
            .with_context(|| format!("creating incremental dir {:?}", self.incremental_dir))?;

        let previous = self.previous_manifest();
        let staging = tempfile::tempdir().context("creating checkpoint staging dir")?;
        cache.backing().save_checkpoint(staging.path())?;
        worker.check_abort()?;

        let uuid = Uuid::generate();
        let prefix = format!("incrementalCheckpoints/{}.{}", sequence_point.0, uuid);

        let mut new_manifest = Manifest::default();
        for entry in fs::read_dir(staging.path())? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "manifest.json" {
                continue;
            }

            let local_copy = self.incremental_dir.join(&name);
            let reusable = Cldb::is_immutable(&path) && local_copy.exists() && previous.contains(&name);

            let storage_id = if reusable {
                let storage_id = previous.get(&name).expect("checked by `reusable` above").clone();
                if let Err(err) = self.storage.exists(&storage_id).await {
                    task_warn!(worker, "touch check for {storage_id} failed: {err:#}");
                }
                storage_id
            } else {
                hardlink_or_copy(&path, &local_copy)?;
                let storage_id = format!("{prefix}.{name}");
                self.storage.put(&storage_id, &local_copy).await?;
                storage_id
            };

            new_manifest.insert(name, storage_id);
        }

        let checkpoint_id = format!("{}.{}.{}", sequence_point.0, uuid, fc_api_types::INCREMENTAL_SUFFIX);

        let guard = IncrementalStateGuard::new(&self.manifest_path());
        guard.stage(&new_manifest)?;

        let manifest_key = format!("{prefix}.txt");
        self.storage.put(&manifest_key, &guard.tmp_path).await?;

        self.registry
            .register(RegisteredCheckpoint {
                checkpoint_id: checkpoint_id.clone(),
                sequence_point,
                storage_key: manifest_key,
            })
            .await?;

        guard.commit()?;
        self.finalize(&new_manifest)?;

        Ok(checkpoint_id)
    }

    /// Removes locally-cached files the new manifest no longer references.
    fn finalize(&self, manifest: &Manifest) -> Result<(), Error> {
        if !self.incremental_dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.incremental_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == MANIFEST_FILE || name.ends_with(".tmp") {
                continue;
            }
            if !manifest.contains(&name) {
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    async fn upload_blobs(
        &self,
        staging: &Path,
        prefix: &str,
        worker: &dyn WorkerTaskContext,
    ) -> Result<Manifest, Error> {
        let mut manifest = Manifest::default();
        for entry in fs::read_dir(staging)? {
            worker.check_abort()?;
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let storage_id = format!("{prefix}/{name}");
            self.storage.put(&storage_id, &path).await?;
            manifest.insert(name, storage_id);
        }
        Ok(manifest)
    }

    /// Restores the database identified by `checkpoint.storage_key`. On any
    /// failure the local incremental manifest is deleted so the next save
    /// starts from a clean slate rather than a partially-applied one.
    pub async fn restore(
        &self,
        checkpoint: &RegisteredCheckpoint,
        cldb: &Cldb,
        worker: &dyn WorkerTaskContext,
    ) -> Result<(), Error> {
        match self.restore_inner(checkpoint, cldb, worker).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(self.manifest_path());
                Err(err)
            }
        }
    }

    async fn restore_inner(
        &self,
        checkpoint: &RegisteredCheckpoint,
        cldb: &Cldb,
        worker: &dyn WorkerTaskContext,
    ) -> Result<(), Error> {
        fs::create_dir_all(&self.incremental_dir)?;
        let manifest_local = self.incremental_dir.join("downloaded.txt.tmp");
        self.storage.get(&checkpoint.storage_key, &manifest_local).await?;
        let manifest = Manifest::load(&manifest_local)?;
        let _ = fs::remove_file(&manifest_local);

        let previous = self.previous_manifest();
        let extraction = tempfile::tempdir().context("creating extraction dir")?;

        for (name, storage_id) in &manifest.entries {
            worker.check_abort()?;
            let local_copy = self.incremental_dir.join(name);
            let matches_previous = previous.get(name) == Some(storage_id) && local_copy.exists();

            if !matches_previous {
                if let Err(err) = fs::remove_file(&local_copy) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        bail!("removing stale local copy of {name}: {err}");
                    }
                }
                self.storage.get(storage_id, &local_copy).await?;
            }

            hardlink_or_copy(&local_copy, &extraction.path().join(name))?;
        }

        cldb.restore_checkpoint(extraction.path())?;
        Ok(())
    }

    pub fn now(&self) -> i64 {
        self.clock.now_unix()
    }
}

fn hardlink_or_copy(src: &Path, dest: &Path) -> Result<(), Error> {
    if dest.exists() {
        return Ok(());
    }
    match fs::hard_link(src, dest) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dest).with_context(|| format!("copying {src:?} to {dest:?}"))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::central_storage::InMemoryStorage;
    use crate::registry::InMemoryRegistry;
    use fc_content_db::{AllActiveRoster, FlushPolicy};
    use fc_api_types::{MachineId, ShortHash};
    use fc_tools::{StandaloneTaskContext, SystemClock};

    fn new_manager(dir: &Path) -> (CheckpointManager, Arc<InMemoryRegistry>) {
        let storage = Arc::new(InMemoryStorage::default());
        let registry = Arc::new(InMemoryRegistry::default());
        let manager = CheckpointManager::new(
            storage,
            registry.clone(),
            dir.to_path_buf(),
            Arc::new(SystemClock),
        );
        (manager, registry)
    }

    #[tokio::test]
    async fn full_checkpoint_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, registry) = new_manager(dir.path());

        let db = Arc::new(Cldb::new(Arc::new(AllActiveRoster), Arc::new(SystemClock), None));
        let cache = FlushableCache::new(Arc::clone(&db), FlushPolicy::default());
        db.location_added(ShortHash([1u8; 12]), MachineId(1), 99, false);

        let id = manager
            .save_full_checkpoint(&cache, EventSequencePoint(1), &StandaloneTaskContext)
            .await
            .unwrap();
        assert!(!id.is_empty());

        let registered = registry.latest().await.unwrap().unwrap();
        let restored_db = Cldb::new(Arc::new(AllActiveRoster), Arc::new(SystemClock), None);
        manager
            .restore(&registered, &restored_db, &StandaloneTaskContext)
            .await
            .unwrap();

        assert_eq!(restored_db.try_get_entry(&ShortHash([1u8; 12])).unwrap().content_size, 99);
    }

    #[tokio::test]
    async fn incremental_checkpoint_reuses_unchanged_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _registry) = new_manager(dir.path());

        let db = Arc::new(Cldb::new(Arc::new(AllActiveRoster), Arc::new(SystemClock), None));
        let cache = FlushableCache::new(Arc::clone(&db), FlushPolicy::default());
        db.location_added(ShortHash([2u8; 12]), MachineId(1), 1, false);

        let first_id = manager
            .save_incremental_checkpoint(&cache, EventSequencePoint(1), &StandaloneTaskContext)
            .await
            .unwrap();
        let first_manifest = manager.previous_manifest();

        let second_id = manager
            .save_incremental_checkpoint(&cache, EventSequencePoint(2), &StandaloneTaskContext)
            .await
            .unwrap();
        let second_manifest = manager.previous_manifest();

        assert_ne!(first_id, second_id);
        assert!(!second_manifest.entries.is_empty());
        // unchanged content means the manifest for round two should name the
        // exact same storage ids as round one, not merely a non-empty one.
        assert_eq!(first_manifest.entries, second_manifest.entries);
    }
}
