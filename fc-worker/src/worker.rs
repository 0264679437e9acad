//! The `Worker` type: state machine, slot acquisition, and the per-step
//! operation surface concrete local/remote workers override (§4.6).

use std::sync::{Arc, RwLock};

use anyhow::{bail, Error};
use async_trait::async_trait;

use fc_api_types::{PipExecutionStep, RunnablePip, WorkerId, WorkerNodeStatus};
use fc_tools::Clock;

use crate::availability::AvailabilityTracker;
use crate::resources::{LimitingResource, ResourceReservation, ResourceSemaphores};
use crate::slots::SlotCounter;

pub struct SlotLimits {
    pub total_cache_lookup: u32,
    pub total_process: u32,
    pub total_ipc: u32,
    pub cpu_count: u32,
}

pub enum AcquireOutcome {
    Unavailable,
    Rejected(LimitingResource),
    Acquired(AcquiredSlot),
}

pub enum AcquiredSlotKind {
    Ipc,
    Process { weight: u32 },
}

pub struct AcquiredSlot {
    pub kind: AcquiredSlotKind,
    reservation: Option<ResourceReservation>,
}

pub struct Worker {
    pub id: WorkerId,
    status: RwLock<WorkerNodeStatus>,
    cache_lookup_slots: SlotCounter,
    process_slots: SlotCounter,
    ipc_slots: SlotCounter,
    /// Configured `totalProcessSlots`, independent of whatever
    /// `process_slots`'s effective total is currently throttled to -- kept
    /// so a resources-available transition back to `true` can restore the
    /// real total rather than whatever `1` it was clamped to (§3
    /// `EffectiveTotalProcessSlots`).
    total_process_slots: u32,
    resources: ResourceSemaphores,
    cpu_count: u32,
    /// Write side is held by `early_release`; acquisitions hold the read
    /// side, so an in-flight early release can't race a fresh acquisition
    /// past it (§4.6 "Early release").
    early_release_at: RwLock<Option<i64>>,
    availability: AvailabilityTracker,
    clock: Arc<dyn Clock>,
}

impl Worker {
    pub fn new(id: WorkerId, limits: SlotLimits, total_ram_mb: i64, total_commit_mb: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            id,
            status: RwLock::new(WorkerNodeStatus::NotStarted),
            cache_lookup_slots: SlotCounter::new(limits.total_cache_lookup),
            process_slots: SlotCounter::new(limits.total_process),
            ipc_slots: SlotCounter::new(limits.total_ipc),
            total_process_slots: limits.total_process,
            resources: ResourceSemaphores::new(total_ram_mb, total_commit_mb),
            cpu_count: limits.cpu_count,
            early_release_at: RwLock::new(None),
            availability: AvailabilityTracker::default(),
            clock,
        }
    }

    pub fn status(&self) -> WorkerNodeStatus {
        *self.status.read().unwrap()
    }

    pub fn availability(&self) -> &AvailabilityTracker {
        &self.availability
    }

    pub fn resources(&self) -> &ResourceSemaphores {
        &self.resources
    }

    fn transition(&self, next: WorkerNodeStatus) -> Result<(), Error> {
        let mut status = self.status.write().unwrap();
        if !status.can_transition_to(next) {
            bail!("worker {} cannot transition {:?} -> {:?}", self.id, *status, next);
        }
        *status = next;
        Ok(())
    }

    pub fn start(&self) -> Result<(), Error> {
        self.transition(WorkerNodeStatus::Starting)?;
        self.transition(WorkerNodeStatus::Running)
    }

    pub fn finish(&self) -> Result<(), Error> {
        self.transition(WorkerNodeStatus::Stopping)?;
        Ok(())
    }

    fn total_acquired_slots(&self) -> u32 {
        self.cache_lookup_slots.acquired() + self.process_slots.acquired() + self.ipc_slots.acquired()
    }

    /// Sum of acquired slots across all three counters, used by the
    /// scheduler's least-loaded worker selection.
    pub fn acquired_load(&self) -> u32 {
        self.total_acquired_slots()
    }

    pub fn process_slot_total(&self) -> u32 {
        self.process_slots.total()
    }

    /// `resourcesAvailable` transition (§3 `EffectiveTotalProcessSlots`):
    /// when the host reports it's out of resources, clamp process slots
    /// down to 1 so at most a single pip keeps running; when resources
    /// come back, restore the configured total.
    pub fn set_resources_available(&self, available: bool) {
        self.process_slots.set_total(if available { self.total_process_slots } else { 1 });
    }

    /// `tryAcquireCacheLookup(pip, force)`.
    pub fn try_acquire_cache_lookup(&self, force: bool) -> bool {
        if !self.status().can_accept_work() {
            return false;
        }
        let guard = self.early_release_at.read().unwrap();
        if guard.is_some() {
            return false;
        }
        if force {
            self.cache_lookup_slots.force_acquire();
            true
        } else {
            self.cache_lookup_slots.try_acquire()
        }
    }

    pub fn release_cache_lookup(&self) {
        self.cache_lookup_slots.release();
    }

    /// `tryAcquire(pip, loadFactor)`.
    pub fn try_acquire(&self, pip: &RunnablePip, load_factor: f64, default_ram_mb: i64, default_commit_mb: i64) -> AcquireOutcome {
        if !self.status().can_accept_work() {
            return AcquireOutcome::Unavailable;
        }
        let guard = self.early_release_at.read().unwrap();
        if guard.is_some() {
            return AcquireOutcome::Unavailable;
        }

        if pip.pip.is_ipc() {
            self.ipc_slots.force_acquire();
            return AcquireOutcome::Acquired(AcquiredSlot { kind: AcquiredSlotKind::Ipc, reservation: None });
        }

        let weight = pip.weight();
        let acquired_process = self.process_slots.acquired();
        let effective_total = (self.process_slots.total() as f64) * load_factor;
        // Single-process-over-weight exception: a pip whose weight alone
        // exceeds total may still run if the worker is otherwise idle.
        if acquired_process != 0 && (acquired_process + weight) as f64 > effective_total {
            return AcquireOutcome::Rejected(LimitingResource::ProcessSlot);
        }
        if !self.process_slots.try_acquire_weighted(weight) {
            return AcquireOutcome::Rejected(LimitingResource::ProcessSlot);
        }

        let (ram_mb, commit_mb) = pip
            .pip
            .as_process()
            .map(|p| {
                let ram = p.expected_memory_mb.map(|mb| crate::resources::scale_historical_mb(mb as i64)).unwrap_or(default_ram_mb);
                let commit = p.expected_commit_mb.map(|mb| crate::resources::scale_historical_mb(mb as i64)).unwrap_or(default_commit_mb);
                (ram, commit)
            })
            .unwrap_or((default_ram_mb, default_commit_mb));

        match self.resources.try_reserve(ram_mb, commit_mb, load_factor) {
            Ok(reservation) => {
                AcquireOutcome::Acquired(AcquiredSlot { kind: AcquiredSlotKind::Process { weight }, reservation: Some(reservation) })
            }
            Err(limiting) => {
                self.process_slots.release_weighted(weight);
                AcquireOutcome::Rejected(limiting)
            }
        }
    }

    /// `releaseResources(pip)`: returns semaphore resources and, if the
    /// worker has drained to zero acquired slots while `Stopping`, reports
    /// that drain has completed.
    pub fn release_resources(&self, slot: AcquiredSlot) -> bool {
        match slot.kind {
            AcquiredSlotKind::Ipc => self.ipc_slots.release(),
            AcquiredSlotKind::Process { weight } => self.process_slots.release_weighted(weight),
        }
        drop(slot.reservation);
        self.total_acquired_slots() == 0 && self.status() == WorkerNodeStatus::Stopping
    }

    /// Records a timestamp and prevents new acquisitions.
    pub fn early_release(&self) -> i64 {
        let mut guard = self.early_release_at.write().unwrap();
        let now = self.clock.now_unix();
        *guard = Some(now);
        now
    }

    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }
}

fn assert_step(pip: &RunnablePip, expected: PipExecutionStep) -> Result<(), Error> {
    if pip.current_step != expected {
        bail!("pip {} is at step {:?}, expected {:?}", pip.pip.id, pip.current_step, expected);
    }
    Ok(())
}

/// Outcome reported by a single step invocation.
pub enum StepOutcome {
    Success,
    Failed { exit_code: Option<i32> },
}

/// Per-step operations a concrete local/remote worker overrides. The
/// default implementations only assert the pip is at the right step --
/// exactly the "base type asserts the step matches" behavior from §4.6 --
/// and are expected to be replaced, not extended, by a real worker.
#[async_trait]
pub trait WorkerStepOps: Send + Sync {
    async fn cache_lookup(&self, pip: &RunnablePip) -> Result<StepOutcome, Error> {
        assert_step(pip, PipExecutionStep::CacheLookup)?;
        bail!("cache_lookup not implemented for this worker")
    }

    async fn materialize_inputs(&self, pip: &RunnablePip) -> Result<StepOutcome, Error> {
        assert_step(pip, PipExecutionStep::MaterializeInputs)?;
        bail!("materialize_inputs not implemented for this worker")
    }

    async fn execute_process(&self, pip: &RunnablePip) -> Result<StepOutcome, Error> {
        assert_step(pip, PipExecutionStep::ExecuteProcess)?;
        bail!("execute_process not implemented for this worker")
    }

    async fn execute_ipc(&self, pip: &RunnablePip) -> Result<StepOutcome, Error> {
        assert_step(pip, PipExecutionStep::ExecuteIpc)?;
        bail!("execute_ipc not implemented for this worker")
    }

    async fn post_process(&self, pip: &RunnablePip) -> Result<StepOutcome, Error> {
        assert_step(pip, PipExecutionStep::PostProcess)?;
        bail!("post_process not implemented for this worker")
    }

    async fn materialize_outputs(&self, pip: &RunnablePip) -> Result<StepOutcome, Error> {
        assert_step(pip, PipExecutionStep::MaterializeOutputs)?;
        bail!("materialize_outputs not implemented for this worker")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use fc_api_types::{Pip, PipId, PipKind, ProcessPip, SemiStableHash};
    use fc_tools::SystemClock;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn limits() -> SlotLimits {
        SlotLimits { total_cache_lookup: 4, total_process: 4, total_ipc: 4, cpu_count: 4 }
    }

    fn process_runnable(weight: u32) -> RunnablePip {
        RunnablePip::new(Pip {
            id: PipId(1),
            semi_stable_hash: SemiStableHash(1),
            kind: PipKind::Process(ProcessPip {
                weight,
                expected_memory_mb: None,
                expected_commit_mb: None,
                retry_exit_codes: vec![],
                process_retries: 0,
                timeout_secs: None,
                working_directory: PathBuf::from("/tmp"),
                environment: BTreeMap::new(),
                inputs: vec![],
                outputs: vec![],
            }),
        })
    }

    #[test]
    fn try_acquire_fails_until_started() {
        let worker = Worker::new(WorkerId(1), limits(), 1_000, 2_000, Arc::new(SystemClock));
        let pip = process_runnable(1);
        assert!(matches!(worker.try_acquire(&pip, 1.0, 100, 150), AcquireOutcome::Unavailable));
        worker.start().unwrap();
        assert!(matches!(worker.try_acquire(&pip, 1.0, 100, 150), AcquireOutcome::Acquired(_)));
    }

    #[test]
    fn oversized_pip_runs_alone_but_not_alongside_others() {
        let worker = Worker::new(WorkerId(2), SlotLimits { total_cache_lookup: 1, total_process: 2, total_ipc: 1, cpu_count: 2 }, 10_000, 20_000, Arc::new(SystemClock));
        worker.start().unwrap();

        let huge = process_runnable(10);
        let slot = match worker.try_acquire(&huge, 1.0, 100, 150) {
            AcquireOutcome::Acquired(slot) => slot,
            _ => panic!("expected the sole oversized pip to be accepted"),
        };

        let other = process_runnable(1);
        assert!(matches!(worker.try_acquire(&other, 1.0, 100, 150), AcquireOutcome::Rejected(_)));

        worker.release_resources(slot);
    }

    #[test]
    fn early_release_blocks_new_acquisitions() {
        let worker = Worker::new(WorkerId(3), limits(), 1_000, 2_000, Arc::new(SystemClock));
        worker.start().unwrap();
        worker.early_release();
        let pip = process_runnable(1);
        assert!(matches!(worker.try_acquire(&pip, 1.0, 100, 150), AcquireOutcome::Unavailable));
    }

    #[test]
    fn release_resources_reports_drain_completion_when_stopping() {
        let worker = Worker::new(WorkerId(4), limits(), 1_000, 2_000, Arc::new(SystemClock));
        worker.start().unwrap();
        let pip = process_runnable(1);
        let slot = match worker.try_acquire(&pip, 1.0, 100, 150) {
            AcquireOutcome::Acquired(slot) => slot,
            _ => panic!("expected acquisition to succeed"),
        };
        worker.finish().unwrap();
        assert!(worker.release_resources(slot));
    }

    #[test]
    fn resources_unavailable_throttles_process_slots_to_one() {
        let worker = Worker::new(WorkerId(5), limits(), 1_000, 2_000, Arc::new(SystemClock));
        worker.start().unwrap();
        assert_eq!(worker.process_slot_total(), 4);

        worker.set_resources_available(false);
        assert_eq!(worker.process_slot_total(), 1);

        worker.set_resources_available(true);
        assert_eq!(worker.process_slot_total(), 4);
    }
}
