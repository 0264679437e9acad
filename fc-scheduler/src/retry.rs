//! Retry-on-exit-code bookkeeping (§4.7, §7 `MaxRetry`).

use fc_api_types::Pip;

/// Whether a failed pip should be re-queued, per its declared
/// `retryExitCodes` and `processRetries` budget. Only process pips retry on
/// exit code; every other kind fails terminally on its first error.
pub fn should_retry(pip: &Pip, attempt: u32, exit_code: Option<i32>) -> bool {
    let Some(process) = pip.as_process() else {
        return false;
    };
    match exit_code {
        Some(code) if process.retry_exit_codes.contains(&code) => attempt < process.process_retries,
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use fc_api_types::{PipId, PipKind, ProcessPip, SemiStableHash};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn process_pip(retry_exit_codes: Vec<i32>, process_retries: u32) -> Pip {
        Pip {
            id: PipId(1),
            semi_stable_hash: SemiStableHash(1),
            kind: PipKind::Process(ProcessPip {
                weight: 1,
                expected_memory_mb: None,
                expected_commit_mb: None,
                retry_exit_codes,
                process_retries,
                timeout_secs: None,
                working_directory: PathBuf::from("/tmp"),
                environment: BTreeMap::new(),
                inputs: vec![],
                outputs: vec![],
            }),
        }
    }

    #[test]
    fn retries_declared_exit_code_within_budget() {
        let pip = process_pip(vec![42], 1);
        assert!(should_retry(&pip, 0, Some(42)));
        assert!(!should_retry(&pip, 1, Some(42)));
    }

    #[test]
    fn does_not_retry_undeclared_exit_code() {
        let pip = process_pip(vec![42], 3);
        assert!(!should_retry(&pip, 0, Some(1)));
    }

    #[test]
    fn non_process_pips_never_retry() {
        let pip = Pip { id: PipId(2), semi_stable_hash: SemiStableHash(2), kind: PipKind::Value { name: "x".into() } };
        assert!(!should_retry(&pip, 0, Some(42)));
    }
}
