//! Thin CLI entry point: reads a pip plan as JSON and runs it to completion
//! against a single local worker. Pip-graph construction, sandboxing, and
//! configuration loading are out of scope (§1) -- this binary only wires
//! the library crates together, the way `proxmox-backup-client` wires
//! `pbs-client`/`pbs-datastore` behind a CLI.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Error};
use async_trait::async_trait;
use fc_api_types::{ArtifactId, PipExecutionResult, PipKind, RunnablePip, WorkerId};
use fc_scheduler::{Scheduler, WorkerHandle, WorkerPool};
use fc_tools::SystemClock;
use fc_worker::{SlotLimits, StepOutcome, Worker, WorkerStepOps};
use tokio_util::sync::CancellationToken;

/// Executes the artifact-producing pip kinds directly; `Process` and `Ipc`
/// pips are out of scope for sandboxed execution (§1 Non-goals) and always
/// report success so the surrounding step machinery can be exercised.
struct LocalWorkerOps;

#[async_trait]
impl WorkerStepOps for LocalWorkerOps {
    async fn cache_lookup(&self, _pip: &RunnablePip) -> Result<StepOutcome, Error> {
        Ok(StepOutcome::Success)
    }

    async fn materialize_inputs(&self, _pip: &RunnablePip) -> Result<StepOutcome, Error> {
        Ok(StepOutcome::Success)
    }

    async fn execute_process(&self, _pip: &RunnablePip) -> Result<StepOutcome, Error> {
        Ok(StepOutcome::Success)
    }

    async fn execute_ipc(&self, _pip: &RunnablePip) -> Result<StepOutcome, Error> {
        Ok(StepOutcome::Success)
    }

    async fn post_process(&self, pip: &RunnablePip) -> Result<StepOutcome, Error> {
        match &pip.pip.kind {
            PipKind::WriteFile { destination: ArtifactId::File(path), contents } => {
                tokio::fs::write(path, contents).await.with_context(|| format!("writing {}", path.display()))?;
                Ok(StepOutcome::Success)
            }
            PipKind::CopyFile { source: ArtifactId::File(src), destination: ArtifactId::File(dst) } => {
                tokio::fs::copy(src, dst).await.with_context(|| format!("copying {} -> {}", src.display(), dst.display()))?;
                Ok(StepOutcome::Success)
            }
            _ => Ok(StepOutcome::Success),
        }
    }

    async fn materialize_outputs(&self, _pip: &RunnablePip) -> Result<StepOutcome, Error> {
        Ok(StepOutcome::Success)
    }
}

fn usage() -> ! {
    eprintln!("usage: fc-engine <plan.json>");
    eprintln!("  plan.json: a single serialized fc_api_types::Pip");
    std::process::exit(1);
}

async fn run(plan_path: PathBuf) -> Result<PipExecutionResult, Error> {
    let plan_text = tokio::fs::read_to_string(&plan_path).await.with_context(|| format!("reading {}", plan_path.display()))?;
    let pip: fc_api_types::Pip = serde_json::from_str(&plan_text).with_context(|| format!("parsing {}", plan_path.display()))?;

    let worker = Arc::new(Worker::new(
        WorkerId(0),
        SlotLimits { total_cache_lookup: 4, total_process: 4, total_ipc: 4, cpu_count: num_cpus_fallback() },
        4_096,
        8_192,
        Arc::new(SystemClock),
    ));
    worker.start()?;

    let pool = WorkerPool::new(vec![WorkerHandle { worker, ops: Arc::new(LocalWorkerOps), load_factor: 1.0 }]);
    let scheduler = Scheduler::new(pool);
    let cancel = CancellationToken::new();

    Ok(scheduler.run_pip(RunnablePip::new(pip), &cancel).await)
}

/// `std::thread::available_parallelism` with a conservative fallback;
/// avoids pulling in a dedicated CPU-count crate for one call site.
fn num_cpus_fallback() -> u32 {
    std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let Some(plan_arg) = args.next() else { usage() };
    if plan_arg == "-h" || plan_arg == "--help" {
        usage();
    }

    let result = run(PathBuf::from(plan_arg)).await?;
    println!("{:?}", result);

    match result {
        PipExecutionResult::Success => Ok(()),
        PipExecutionResult::Canceled => std::process::exit(130),
        PipExecutionResult::Failed { .. } => std::process::exit(1),
    }
}
