use std::fmt;

/// Monotone cursor into the event stream consumed by the CLDB. Every
/// checkpoint carries one, so a restored database knows which events it has
/// already applied.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, serde::Serialize, serde::Deserialize)]
pub struct EventSequencePoint(pub u64);

/// Suffix appended to an incremental checkpoint's id to distinguish it from
/// a full checkpoint sharing the same sequence number.
pub const INCREMENTAL_SUFFIX: &str = "incr";

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CheckpointState {
    pub checkpoint_id: String,
    pub checkpoint_time: i64,
    pub sequence_point: EventSequencePoint,
}

impl CheckpointState {
    pub fn is_incremental(&self) -> bool {
        self.checkpoint_id.ends_with(INCREMENTAL_SUFFIX)
    }

    /// Serializes to the global KV format `"{checkpointId},{checkpointTime}"`
    /// used for `CheckpointManager.CheckpointState` entries (see §6).
    pub fn to_kv_value(&self) -> String {
        format!("{},{}", self.checkpoint_id, self.checkpoint_time)
    }

    pub fn from_kv_value(value: &str, sequence_point: EventSequencePoint) -> Option<Self> {
        let (id, time) = value.split_once(',')?;
        Some(Self {
            checkpoint_id: id.to_string(),
            checkpoint_time: time.parse().ok()?,
            sequence_point,
        })
    }
}

impl fmt::Display for CheckpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:?}", self.checkpoint_id, self.sequence_point)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kv_round_trip() {
        let state = CheckpointState {
            checkpoint_id: "7.1234".to_string(),
            checkpoint_time: 1_700_000_000,
            sequence_point: EventSequencePoint(42),
        };
        let kv = state.to_kv_value();
        let restored = CheckpointState::from_kv_value(&kv, EventSequencePoint(42)).unwrap();
        assert_eq!(state, restored);
    }
}
