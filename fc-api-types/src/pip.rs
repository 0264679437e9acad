use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Identifies a [`Pip`] within a single scheduling session.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, serde::Serialize, serde::Deserialize)]
pub struct PipId(pub u64);

/// Stable hash of a pip's identity, used to deduplicate the same pip when
/// it appears in more than one graph fragment. The hash algorithm behind it
/// is out of scope for this crate -- see [`Fingerprinter`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, serde::Serialize, serde::Deserialize)]
pub struct SemiStableHash(pub u64);

/// A file, sealed directory, or IPC service pip referenced as a pip's input
/// or output, and the unit that Worker content-availability tracking is
/// keyed on.
#[derive(Clone, PartialEq, Eq, Hash, Debug, serde::Serialize, serde::Deserialize)]
pub enum ArtifactId {
    File(PathBuf),
    Directory(PathBuf),
    Service(PipId),
}

/// Process-pip specific fields from §3.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ProcessPip {
    /// Number of process slots this pip consumes while executing.
    pub weight: u32,
    pub expected_memory_mb: Option<u64>,
    pub expected_commit_mb: Option<u64>,
    pub retry_exit_codes: Vec<i32>,
    pub process_retries: u32,
    pub timeout_secs: Option<u64>,
    pub working_directory: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub inputs: Vec<ArtifactId>,
    pub outputs: Vec<ArtifactId>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum PipKind {
    Process(ProcessPip),
    CopyFile { source: ArtifactId, destination: ArtifactId },
    WriteFile { destination: ArtifactId, contents: Vec<u8> },
    SealDirectory { directory: ArtifactId, members: Vec<ArtifactId> },
    Ipc { service: PipId, moniker: String },
    Module { members: Vec<PipId> },
    SpecFile { path: PathBuf },
    Value { name: String },
    HashSourceFile { path: PathBuf },
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Pip {
    pub id: PipId,
    pub semi_stable_hash: SemiStableHash,
    pub kind: PipKind,
}

impl Pip {
    pub fn as_process(&self) -> Option<&ProcessPip> {
        match &self.kind {
            PipKind::Process(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_ipc(&self) -> bool {
        matches!(self.kind, PipKind::Ipc { .. })
    }
}

/// Computes a [`SemiStableHash`] for a pip. The concrete algorithm is an
/// external collaborator, per the top-level Non-goals; this crate only
/// needs the trait seam.
pub trait Fingerprinter {
    fn semi_stable_hash(&self, pip: &Pip) -> SemiStableHash;
}

/// Execution steps a [`RunnablePip`] moves through, strictly in order on a
/// single worker (§5 "Ordering guarantees").
#[derive(Clone, Copy, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub enum PipExecutionStep {
    CacheLookup,
    MaterializeInputs,
    ExecuteProcess,
    ExecuteIpc,
    PostProcess,
    MaterializeOutputs,
    Done,
}

impl PipExecutionStep {
    /// Next step for a successfully completed process pip.
    pub fn next_for_process(self) -> Option<Self> {
        use PipExecutionStep::*;
        match self {
            CacheLookup => Some(MaterializeInputs),
            MaterializeInputs => Some(ExecuteProcess),
            ExecuteProcess => Some(PostProcess),
            PostProcess => Some(MaterializeOutputs),
            MaterializeOutputs => Some(Done),
            ExecuteIpc => Some(Done),
            Done => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub enum PipExecutionResult {
    Success,
    Failed { exit_code: Option<i32> },
    Canceled,
}

/// Mutable per-execution envelope around a [`Pip`].
#[derive(Clone, Debug)]
pub struct RunnablePip {
    pub pip: Pip,
    pub current_step: PipExecutionStep,
    pub assigned_worker: Option<crate::worker::WorkerId>,
    pub result: Option<PipExecutionResult>,
    pub attempt: u32,
}

impl RunnablePip {
    pub fn new(pip: Pip) -> Self {
        Self {
            pip,
            current_step: PipExecutionStep::CacheLookup,
            assigned_worker: None,
            result: None,
            attempt: 0,
        }
    }

    pub fn weight(&self) -> u32 {
        self.pip.as_process().map(|p| p.weight).unwrap_or(1)
    }
}

impl fmt::Display for PipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pip#{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn process_pip(weight: u32) -> Pip {
        Pip {
            id: PipId(1),
            semi_stable_hash: SemiStableHash(0xdead_beef),
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
        }
    }

    #[test]
    fn steps_advance_monotonically_through_process_lifecycle() {
        use PipExecutionStep::*;
        let mut step = CacheLookup;
        let mut seen = vec![step];
        while let Some(next) = step.next_for_process() {
            step = next;
            seen.push(step);
        }
        assert_eq!(
            seen,
            vec![CacheLookup, MaterializeInputs, ExecuteProcess, PostProcess, MaterializeOutputs, Done]
        );
    }

    #[test]
    fn runnable_pip_weight_defaults_to_one_for_non_process() {
        let pip = Pip { id: PipId(2), semi_stable_hash: SemiStableHash(1), kind: PipKind::Value { name: "x".into() } };
        let runnable = RunnablePip::new(pip);
        assert_eq!(runnable.weight(), 1);
    }

    #[test]
    fn runnable_pip_weight_matches_process_pip() {
        let runnable = RunnablePip::new(process_pip(3));
        assert_eq!(runnable.weight(), 3);
    }
}
