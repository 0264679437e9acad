//! Per-replica reputation tracking (§4.5). Persists across retry cycles so
//! a replica marked `Missing` stays skipped for the remainder of a call,
//! while the per-cycle "tried this cycle" bookkeeping resets every attempt.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use fc_api_types::{MachineId, Reputation};

struct ReplicaState {
    reputation: Reputation,
    last_failure_unix_ms: i64,
    tried_this_cycle: bool,
}

#[derive(Default)]
pub struct ReputationTracker {
    state: Mutex<HashMap<MachineId, ReplicaState>>,
}

impl ReputationTracker {
    pub fn record(&self, replica: MachineId, reputation: Reputation, now_unix_ms: i64) {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(replica).or_insert(ReplicaState {
            reputation: Reputation::Good,
            last_failure_unix_ms: 0,
            tried_this_cycle: true,
        });
        entry.reputation = reputation;
        entry.tried_this_cycle = true;
        if !matches!(reputation, Reputation::Good) {
            entry.last_failure_unix_ms = now_unix_ms;
        }
    }

    pub fn is_missing(&self, replica: MachineId) -> bool {
        self.state
            .lock()
            .unwrap()
            .get(&replica)
            .map(|s| matches!(s.reputation, Reputation::Missing))
            .unwrap_or(false)
    }

    /// Returns `Some(remaining)` if `replica` was already tried this cycle
    /// and its last failure is still within `jittered_delay`.
    pub fn wait_remaining(&self, replica: MachineId, now_unix_ms: i64, jittered_delay: Duration) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        let entry = state.get(&replica)?;
        if !entry.tried_this_cycle {
            return None;
        }
        let elapsed_ms = now_unix_ms.saturating_sub(entry.last_failure_unix_ms);
        let delay_ms = jittered_delay.as_millis() as i64;
        if elapsed_ms >= delay_ms {
            None
        } else {
            Some(Duration::from_millis((delay_ms - elapsed_ms) as u64))
        }
    }

    /// §4.5 step 1: "clear prior bad-location set (per-cycle)" -- resets
    /// the per-cycle tried flags without touching the persisted reputation.
    pub fn start_new_cycle(&self) {
        for state in self.state.lock().unwrap().values_mut() {
            state.tried_this_cycle = false;
        }
    }

    pub fn all_missing(&self, replicas: &[MachineId]) -> bool {
        !replicas.is_empty() && replicas.iter().all(|r| self.is_missing(*r))
    }
}
