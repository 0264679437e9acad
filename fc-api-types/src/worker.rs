use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Worker#{}", self.0)
    }
}

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerId({})", self.0)
    }
}

/// Worker lifecycle states. `Stopped` is terminal.
#[derive(Clone, Copy, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub enum WorkerNodeStatus {
    NotStarted,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl WorkerNodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerNodeStatus::Stopped)
    }

    pub fn can_accept_work(self) -> bool {
        matches!(self, WorkerNodeStatus::Running)
    }

    /// Valid `self -> next` transitions, per §3's
    /// `Start -> Running -> (Stopping -> Stopped)`.
    pub fn can_transition_to(self, next: WorkerNodeStatus) -> bool {
        use WorkerNodeStatus::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (Starting, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopping)
                | (Paused, Stopping)
                | (Stopping, Stopped)
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stopped_is_terminal() {
        assert!(WorkerNodeStatus::Stopped.is_terminal());
        assert!(!WorkerNodeStatus::Running.is_terminal());
    }

    #[test]
    fn cannot_skip_stopping() {
        assert!(!WorkerNodeStatus::Running.can_transition_to(WorkerNodeStatus::Stopped));
        assert!(WorkerNodeStatus::Running.can_transition_to(WorkerNodeStatus::Stopping));
        assert!(WorkerNodeStatus::Stopping.can_transition_to(WorkerNodeStatus::Stopped));
    }
}
