//! Retry/walk copy algorithm, proactive push/request, and replica
//! verification (§4.5). The retry handling is grounded on
//! `src/server/pull.rs`'s remote-sync retry loop; the I/O gates are
//! `tokio::sync::Semaphore`, grounded on the restore daemon's
//! `static DOWNLOAD_SEM: Semaphore = Semaphore::const_new(8)`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Error};
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use fc_api_types::{CopyErrorKind, MachineId, Reputation, ShortHash};
use fc_tools::{task_debug, task_warn, Clock, WorkerTaskContext};

use crate::reputation::ReputationTracker;
use crate::rpc::{ContentFetcher, PlacementCallback};

#[derive(Clone, Debug)]
pub struct CopierConfig {
    pub retry_intervals: Vec<Duration>,
    pub max_retry_count: u32,
    pub max_concurrent_copy_operations: usize,
    pub max_concurrent_proactive_copy_operations: usize,
    pub trusted_hash_size_boundary: i64,
    pub proactive_timeout: Duration,
}

impl Default for CopierConfig {
    fn default() -> Self {
        Self {
            retry_intervals: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(30),
            ],
            max_retry_count: 10,
            max_concurrent_copy_operations: 8,
            max_concurrent_proactive_copy_operations: 4,
            trusted_hash_size_boundary: 256 * 1024 * 1024,
            proactive_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum CopyWalkOutcome {
    Success,
    MaxRetry,
    AllMissing,
    NonRetryable(CopyErrorKind),
}

pub struct Copier {
    config: CopierConfig,
    fetcher: Arc<dyn ContentFetcher>,
    reputation: ReputationTracker,
    copy_gate: Semaphore,
    proactive_gate: Semaphore,
    clock: Arc<dyn Clock>,
    work_dir: PathBuf,
}

impl Copier {
    pub fn new(config: CopierConfig, fetcher: Arc<dyn ContentFetcher>, clock: Arc<dyn Clock>, work_dir: PathBuf) -> Self {
        let copy_gate = Semaphore::new(config.max_concurrent_copy_operations.max(1));
        let proactive_gate = Semaphore::new(config.max_concurrent_proactive_copy_operations.max(1));
        Self { config, fetcher, reputation: ReputationTracker::default(), copy_gate, proactive_gate, clock, work_dir }
    }

    fn jitter(&self, base: Duration) -> Duration {
        let mut rng = rand::thread_rng();
        let factor: f64 = rng.gen_range(0.5..1.5);
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }

    pub async fn copy_content(
        &self,
        hash: ShortHash,
        size: Option<i64>,
        replicas: &[MachineId],
        placement: &dyn PlacementCallback,
        worker: &dyn WorkerTaskContext,
    ) -> Result<CopyWalkOutcome, Error> {
        let mut total_attempts = 0u32;

        for (attempt, &interval) in self.config.retry_intervals.clone().iter().enumerate() {
            self.reputation.start_new_cycle();
            let jittered_delay = self.jitter(interval);

            for &replica in replicas {
                if total_attempts >= self.config.max_retry_count {
                    return Ok(CopyWalkOutcome::MaxRetry);
                }
                if self.reputation.is_missing(replica) {
                    continue;
                }

                let now_ms = self.clock.now_unix() * 1000;
                if let Some(remaining) = self.reputation.wait_remaining(replica, now_ms, jittered_delay) {
                    tokio::time::sleep(remaining).await;
                }

                total_attempts += 1;
                worker.check_abort()?;

                let temp_path = self.work_dir.join(format!("{hash}.{replica}.tmp"));
                let outcome = {
                    let _permit = self.copy_gate.acquire().await.context("acquiring copy gate")?;
                    task_debug!(worker, "copying {hash} from replica {replica}");
                    self.fetcher.fetch(replica, hash, size, &temp_path).await
                };

                let fetched = match outcome {
                    Ok(outcome) => outcome,
                    Err(kind) => {
                        self.reputation.record(replica, Reputation::from(kind), now_ms);
                        if !kind.is_retryable() {
                            return Ok(CopyWalkOutcome::NonRetryable(kind));
                        }
                        continue;
                    }
                };

                if let Some(expected) = size {
                    if fetched.bytes_written != expected {
                        // Skip without blaming the replica: this mirrors a
                        // concurrent truncation/resize upstream, not a bad
                        // replica.
                        let _ = tokio::fs::remove_file(&temp_path).await;
                        continue;
                    }
                }

                let trusted = size.map(|s| s <= self.config.trusted_hash_size_boundary).unwrap_or(false);
                if trusted {
                    if let Some(computed) = fetched.computed_hash {
                        if computed != hash {
                            self.reputation.record(replica, Reputation::Bad, now_ms);
                            let _ = tokio::fs::remove_file(&temp_path).await;
                            continue;
                        }
                    }
                }

                let placed = placement.place(&temp_path, fetched.inline_bytes.as_deref()).await;
                match placed {
                    Ok(result) if result.accepted_hash == hash => {
                        self.reputation.record(replica, Reputation::Good, now_ms);
                        if !result.content_moved {
                            let _ = tokio::fs::remove_file(&temp_path).await;
                        }
                        return Ok(CopyWalkOutcome::Success);
                    }
                    Ok(_) => {
                        self.reputation.record(replica, Reputation::Bad, now_ms);
                        let _ = tokio::fs::remove_file(&temp_path).await;
                        continue;
                    }
                    Err(err) => {
                        task_warn!(worker, "placement of {hash} from {replica} failed: {err:#}");
                        let _ = tokio::fs::remove_file(&temp_path).await;
                        continue;
                    }
                }
            }

            if self.reputation.all_missing(replicas) {
                return Ok(CopyWalkOutcome::AllMissing);
            }
            let _ = attempt;
        }

        Ok(CopyWalkOutcome::MaxRetry)
    }

    /// Proactively pushes `source` to `replica` under the separate
    /// proactive gate, bounded by `proactive_timeout`.
    pub async fn push_file(&self, replica: MachineId, hash: ShortHash, source: &Path) -> Result<(), Error> {
        let _permit = self.proactive_gate.acquire().await.context("acquiring proactive gate")?;
        timeout(self.config.proactive_timeout, self.fetcher.push(replica, hash, source))
            .await
            .context("push timed out")?
            .map_err(|kind| anyhow::anyhow!("push failed: {kind:?}"))
    }

    pub async fn request_copy_file(&self, replica: MachineId, hash: ShortHash) -> Result<(), Error> {
        let _permit = self.proactive_gate.acquire().await.context("acquiring proactive gate")?;
        timeout(self.config.proactive_timeout, self.fetcher.request_copy(replica, hash))
            .await
            .context("request_copy timed out")?
            .map_err(|kind| anyhow::anyhow!("request_copy failed: {kind:?}"))
    }

    /// Queries every replica's existence in parallel under the copy gate,
    /// never failing the whole call on a per-replica error (§4.5
    /// "Verification").
    pub async fn verify(&self, hash: ShortHash, replicas: &[MachineId]) -> VerifyReport {
        let mut present = Vec::new();
        let mut absent = Vec::new();
        let mut unknown = Vec::new();

        let mut futures = Vec::new();
        for &replica in replicas {
            futures.push(async move {
                let _permit = self.copy_gate.acquire().await;
                let result = timeout(self.config.proactive_timeout, self.fetcher.exists(replica, hash)).await;
                (replica, result)
            });
        }

        for (replica, result) in futures::future::join_all(futures).await {
            match result {
                Ok(Ok(true)) => present.push(replica),
                Ok(Ok(false)) => absent.push(replica),
                _ => unknown.push(replica),
            }
        }

        VerifyReport { present, absent, unknown }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub present: Vec<MachineId>,
    pub absent: Vec<MachineId>,
    pub unknown: Vec<MachineId>,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rpc::{FetchOutcome, PlacementResult};
    use async_trait::async_trait;
    use fc_tools::{StandaloneTaskContext, SystemClock};
    use std::sync::Mutex;

    struct FakeFetcher {
        fail_first_n: Mutex<u32>,
        content: Vec<u8>,
    }

    #[async_trait]
    impl ContentFetcher for FakeFetcher {
        async fn fetch(
            &self,
            _replica: MachineId,
            _hash: ShortHash,
            _expected_size: Option<i64>,
            dest: &Path,
        ) -> Result<FetchOutcome, CopyErrorKind> {
            let mut remaining = self.fail_first_n.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CopyErrorKind::CopyTimeout);
            }
            tokio::fs::write(dest, &self.content).await.map_err(|_| CopyErrorKind::DestinationPathError)?;
            Ok(FetchOutcome {
                bytes_written: self.content.len() as i64,
                computed_hash: None,
                inline_bytes: None,
            })
        }

        async fn exists(&self, _replica: MachineId, _hash: ShortHash) -> Result<bool, CopyErrorKind> {
            Ok(true)
        }

        async fn push(&self, _replica: MachineId, _hash: ShortHash, _source: &Path) -> Result<(), CopyErrorKind> {
            Ok(())
        }

        async fn request_copy(&self, _replica: MachineId, _hash: ShortHash) -> Result<(), CopyErrorKind> {
            Ok(())
        }
    }

    struct AcceptingPlacement(ShortHash);

    #[async_trait]
    impl PlacementCallback for AcceptingPlacement {
        async fn place(&self, _temp_path: &Path, _inline: Option<&[u8]>) -> anyhow::Result<PlacementResult> {
            Ok(PlacementResult { accepted_hash: self.0, content_moved: false })
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let dir = tempfile::tempdir().unwrap();
        let hash = ShortHash([1u8; 12]);
        let fetcher = Arc::new(FakeFetcher { fail_first_n: Mutex::new(1), content: vec![1, 2, 3] });
        let copier = Copier::new(
            CopierConfig { retry_intervals: vec![Duration::from_millis(1), Duration::from_millis(1)], ..Default::default() },
            fetcher,
            Arc::new(SystemClock),
            dir.path().to_path_buf(),
        );

        let placement = AcceptingPlacement(hash);
        let outcome = copier
            .copy_content(hash, Some(3), &[MachineId(1)], &placement, &StandaloneTaskContext)
            .await
            .unwrap();
        assert_eq!(outcome, CopyWalkOutcome::Success);
    }

    #[tokio::test]
    async fn all_missing_replicas_stops_without_retry() {
        struct AlwaysMissing;
        #[async_trait]
        impl ContentFetcher for AlwaysMissing {
            async fn fetch(&self, _: MachineId, _: ShortHash, _: Option<i64>, _: &Path) -> Result<FetchOutcome, CopyErrorKind> {
                Err(CopyErrorKind::FileNotFound)
            }
            async fn exists(&self, _: MachineId, _: ShortHash) -> Result<bool, CopyErrorKind> {
                Ok(false)
            }
            async fn push(&self, _: MachineId, _: ShortHash, _: &Path) -> Result<(), CopyErrorKind> {
                Ok(())
            }
            async fn request_copy(&self, _: MachineId, _: ShortHash) -> Result<(), CopyErrorKind> {
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let hash = ShortHash([2u8; 12]);
        let copier = Copier::new(
            CopierConfig { retry_intervals: vec![Duration::from_millis(1); 3], ..Default::default() },
            Arc::new(AlwaysMissing),
            Arc::new(SystemClock),
            dir.path().to_path_buf(),
        );
        let placement = AcceptingPlacement(hash);
        let outcome = copier
            .copy_content(hash, None, &[MachineId(1)], &placement, &StandaloneTaskContext)
            .await
            .unwrap();
        assert_eq!(outcome, CopyWalkOutcome::AllMissing);
    }

    #[tokio::test]
    async fn destination_path_error_short_circuits_as_non_retryable() {
        struct AlwaysBadDestination;
        #[async_trait]
        impl ContentFetcher for AlwaysBadDestination {
            async fn fetch(&self, _: MachineId, _: ShortHash, _: Option<i64>, _: &Path) -> Result<FetchOutcome, CopyErrorKind> {
                Err(CopyErrorKind::DestinationPathError)
            }
            async fn exists(&self, _: MachineId, _: ShortHash) -> Result<bool, CopyErrorKind> {
                Ok(true)
            }
            async fn push(&self, _: MachineId, _: ShortHash, _: &Path) -> Result<(), CopyErrorKind> {
                Ok(())
            }
            async fn request_copy(&self, _: MachineId, _: ShortHash) -> Result<(), CopyErrorKind> {
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let hash = ShortHash([3u8; 12]);
        let copier = Copier::new(CopierConfig::default(), Arc::new(AlwaysBadDestination), Arc::new(SystemClock), dir.path().to_path_buf());
        let placement = AcceptingPlacement(hash);
        let outcome = copier
            .copy_content(hash, None, &[MachineId(1)], &placement, &StandaloneTaskContext)
            .await
            .unwrap();
        assert_eq!(outcome, CopyWalkOutcome::NonRetryable(CopyErrorKind::DestinationPathError));
    }
}
