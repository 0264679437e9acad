//! Pip Runner: drives a single [`RunnablePip`] through its execution steps
//! across a [`WorkerPool`], enforcing retries and publishing content
//! availability (§4.7).

use std::time::Duration;

use anyhow::Error;
use fc_api_types::{PipExecutionResult, PipExecutionStep, PipKind, RunnablePip};
use fc_worker::{default_commit_per_proc_mb, default_memory_per_proc_mb, AcquireOutcome, WorkerStepOps};
use log::warn;
use tokio_util::sync::CancellationToken;

use crate::artifacts::declared_outputs;
use crate::retry::should_retry;
use crate::worker_pool::WorkerPool;

/// Backoff between selection attempts when no worker currently has spare
/// capacity for a pip (distinct from the Copier's retry/walk backoff).
const NO_CAPACITY_BACKOFF: Duration = Duration::from_millis(50);

/// Next step after `current` succeeds, generalized from
/// `PipExecutionStep::next_for_process` to cover every pip kind: non-process,
/// non-IPC pips skip straight from `MaterializeInputs` to `PostProcess`.
fn next_step(current: PipExecutionStep, kind: &PipKind) -> Option<PipExecutionStep> {
    use PipExecutionStep::*;
    match current {
        CacheLookup => Some(if matches!(kind, PipKind::Ipc { .. }) { ExecuteIpc } else { MaterializeInputs }),
        MaterializeInputs => Some(if matches!(kind, PipKind::Process(_)) { ExecuteProcess } else { PostProcess }),
        ExecuteProcess => Some(PostProcess),
        ExecuteIpc => Some(Done),
        PostProcess => Some(MaterializeOutputs),
        MaterializeOutputs => Some(Done),
        Done => None,
    }
}

async fn invoke_step(ops: &dyn WorkerStepOps, step: PipExecutionStep, pip: &RunnablePip) -> Result<fc_worker::StepOutcome, Error> {
    use PipExecutionStep::*;
    match step {
        CacheLookup => ops.cache_lookup(pip).await,
        MaterializeInputs => ops.materialize_inputs(pip).await,
        ExecuteProcess => ops.execute_process(pip).await,
        ExecuteIpc => ops.execute_ipc(pip).await,
        PostProcess => ops.post_process(pip).await,
        MaterializeOutputs => ops.materialize_outputs(pip).await,
        Done => unreachable!("Done has no associated step operation"),
    }
}

pub struct Scheduler {
    pool: WorkerPool,
}

impl Scheduler {
    pub fn new(pool: WorkerPool) -> Self {
        Self { pool }
    }

    /// Runs one pip to completion (§4.7). Returns the terminal
    /// [`PipExecutionResult`]; on cancellation, returns `Canceled` rather
    /// than an error result (§5 "Cancellation").
    pub async fn run_pip(&self, mut runnable: RunnablePip, cancel: &CancellationToken) -> PipExecutionResult {
        loop {
            if cancel.is_cancelled() {
                return PipExecutionResult::Canceled;
            }
            if runnable.current_step == PipExecutionStep::Done {
                return PipExecutionResult::Success;
            }

            let candidates = self.pool.candidates_for(&runnable);
            if candidates.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(NO_CAPACITY_BACKOFF) => continue,
                    _ = cancel.cancelled() => return PipExecutionResult::Canceled,
                }
            }

            let mut rejected_all = true;
            for handle in &candidates {
                let (ram_mb, commit_mb) = default_expected_memory(handle);
                match handle.worker.try_acquire(&runnable, handle.load_factor, ram_mb, commit_mb) {
                    AcquireOutcome::Unavailable => continue,
                    AcquireOutcome::Rejected(_) => continue,
                    AcquireOutcome::Acquired(slot) => {
                        rejected_all = false;
                        let step = runnable.current_step;
                        let outcome = invoke_step(handle.ops.as_ref(), step, &runnable).await;
                        handle.worker.release_resources(slot);

                        match outcome {
                            Ok(fc_worker::StepOutcome::Success) => {
                                if matches!(step, PipExecutionStep::ExecuteProcess | PipExecutionStep::ExecuteIpc | PipExecutionStep::MaterializeOutputs) {
                                    for artifact in declared_outputs(&runnable.pip) {
                                        handle.worker.availability().mark_content_available(artifact);
                                    }
                                }
                                match next_step(step, &runnable.pip.kind) {
                                    Some(next) => runnable.current_step = next,
                                    None => return PipExecutionResult::Success,
                                }
                            }
                            Ok(fc_worker::StepOutcome::Failed { exit_code }) => {
                                if should_retry(&runnable.pip, runnable.attempt, exit_code) {
                                    warn!("pip {} failed step {:?} with exit code {:?}; retrying (attempt {})", runnable.pip.id, step, exit_code, runnable.attempt + 1);
                                    runnable.attempt += 1;
                                    runnable.current_step = PipExecutionStep::CacheLookup;
                                } else {
                                    return PipExecutionResult::Failed { exit_code };
                                }
                            }
                            Err(err) => {
                                warn!("pip {} errored at step {:?}: {:#}", runnable.pip.id, step, err);
                                if should_retry(&runnable.pip, runnable.attempt, None) {
                                    runnable.attempt += 1;
                                    runnable.current_step = PipExecutionStep::CacheLookup;
                                } else {
                                    return PipExecutionResult::Failed { exit_code: None };
                                }
                            }
                        }
                        break;
                    }
                }
            }

            if rejected_all {
                tokio::select! {
                    _ = tokio::time::sleep(NO_CAPACITY_BACKOFF) => {},
                    _ = cancel.cancelled() => return PipExecutionResult::Canceled,
                }
            }
        }
    }
}

fn default_expected_memory(handle: &crate::worker_pool::WorkerHandle) -> (i64, i64) {
    let total_ram_mb = handle.worker.resources().total_ram_mb();
    let total_process = handle.worker.process_slot_total();
    let cpu_count = handle.worker.cpu_count();
    let memory = default_memory_per_proc_mb(total_ram_mb, total_process, cpu_count);
    let commit = default_commit_per_proc_mb(memory);
    (memory, commit)
}
