use std::collections::HashSet;
use std::sync::RwLock;

use fc_api_types::MachineId;

/// Tells the CLDB which machines are currently considered part of the
/// cluster. Entries returned to callers have inactive machines filtered
/// out (Invariant a, §4.1) -- this keeps that policy decision outside the
/// CLDB itself, per Design Note "No ambient global state".
pub trait MachineRoster: Send + Sync {
    fn is_active(&self, id: MachineId) -> bool;
}

/// Roster that considers every machine active; useful for tests and for
/// deployments that never retire machine ids.
pub struct AllActiveRoster;

impl MachineRoster for AllActiveRoster {
    fn is_active(&self, _id: MachineId) -> bool {
        true
    }
}

/// Roster backed by an explicit active set, mutable at runtime.
#[derive(Default)]
pub struct SetRoster {
    active: RwLock<HashSet<MachineId>>,
}

impl SetRoster {
    pub fn new(active: impl IntoIterator<Item = MachineId>) -> Self {
        Self { active: RwLock::new(active.into_iter().collect()) }
    }

    pub fn mark_active(&self, id: MachineId) {
        self.active.write().unwrap().insert(id);
    }

    pub fn mark_inactive(&self, id: MachineId) {
        self.active.write().unwrap().remove(&id);
    }
}

impl MachineRoster for SetRoster {
    fn is_active(&self, id: MachineId) -> bool {
        self.active.read().unwrap().contains(&id)
    }
}
