//! Worker selection (§4.7 step 1): prefer a worker already holding the
//! pip's declared inputs; otherwise the least-loaded worker that still has
//! capacity.

use std::sync::Arc;

use fc_api_types::RunnablePip;
use fc_worker::{Worker, WorkerStepOps};

use crate::artifacts::declared_inputs;

/// A worker paired with the step-execution backend that actually runs its
/// pips (a local in-process implementation, or an RPC stub to a remote
/// node).
pub struct WorkerHandle {
    pub worker: Arc<Worker>,
    pub ops: Arc<dyn WorkerStepOps>,
    /// Passed to `Worker::try_acquire`; local workers use 1.0, remote
    /// workers may be throttled below that (§4.7 "Load factor").
    pub load_factor: f64,
}

pub struct WorkerPool {
    handles: Vec<WorkerHandle>,
}

impl WorkerPool {
    pub fn new(handles: Vec<WorkerHandle>) -> Self {
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Candidate ordering for a pip: a worker holding every declared input
    /// first, then the remaining workers from least to most loaded.
    pub fn candidates_for(&self, pip: &RunnablePip) -> Vec<&WorkerHandle> {
        let inputs = declared_inputs(&pip.pip);
        let mut available: Vec<&WorkerHandle> = self.handles.iter().filter(|h| h.worker.status().can_accept_work()).collect();

        available.sort_by_key(|h| h.worker.acquired_load());

        let mut holding: Vec<&WorkerHandle> = available
            .iter()
            .copied()
            .filter(|h| !inputs.is_empty() && inputs.iter().all(|a| h.worker.availability().has_content(a)))
            .collect();
        holding.sort_by_key(|h| h.worker.acquired_load());

        let mut ordered = holding;
        for handle in available {
            if !ordered.iter().any(|h| std::ptr::eq(h.worker.as_ref(), handle.worker.as_ref())) {
                ordered.push(handle);
            }
        }
        ordered
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use fc_api_types::{ArtifactId, Pip, PipId, PipKind, ProcessPip, SemiStableHash};
    use fc_tools::SystemClock;
    use fc_worker::{SlotLimits, WorkerStepOps};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    struct NoopOps;
    #[async_trait::async_trait]
    impl WorkerStepOps for NoopOps {}

    fn worker(id: u32) -> Arc<Worker> {
        Arc::new(Worker::new(
            fc_api_types::WorkerId(id),
            SlotLimits { total_cache_lookup: 2, total_process: 2, total_ipc: 2, cpu_count: 2 },
            1_000,
            2_000,
            Arc::new(SystemClock),
        ))
    }

    fn copy_pip(input: &str) -> RunnablePip {
        RunnablePip::new(Pip {
            id: PipId(1),
            semi_stable_hash: SemiStableHash(1),
            kind: PipKind::CopyFile {
                source: ArtifactId::File(PathBuf::from(input)),
                destination: ArtifactId::File(PathBuf::from("/out")),
            },
        })
    }

    #[test]
    fn prefers_worker_already_holding_the_input() {
        let holder = worker(1);
        holder.start().unwrap();
        holder.availability().mark_content_available(ArtifactId::File(PathBuf::from("/in")));
        let other = worker(2);
        other.start().unwrap();

        let pool = WorkerPool::new(vec![
            WorkerHandle { worker: other, ops: Arc::new(NoopOps), load_factor: 1.0 },
            WorkerHandle { worker: holder.clone(), ops: Arc::new(NoopOps), load_factor: 1.0 },
        ]);

        let pip = copy_pip("/in");
        let candidates = pool.candidates_for(&pip);
        assert!(Arc::ptr_eq(&candidates[0].worker, &holder));
    }

    #[test]
    fn excludes_workers_that_cannot_accept_work() {
        let not_started = worker(3);
        let pool = WorkerPool::new(vec![WorkerHandle { worker: not_started, ops: Arc::new(NoopOps), load_factor: 1.0 }]);
        assert!(pool.candidates_for(&copy_pip("/in")).is_empty());
    }
}
