//! Checkpoint id / sequence-point registration, kept behind a trait for the
//! same "no ambient global state" reason as `CentralStorage`.

use std::sync::Mutex;

use anyhow::Error;
use async_trait::async_trait;

use fc_api_types::EventSequencePoint;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredCheckpoint {
    pub checkpoint_id: String,
    pub sequence_point: EventSequencePoint,
    pub storage_key: String,
}

#[async_trait]
pub trait CheckpointRegistry: Send + Sync {
    async fn register(&self, entry: RegisteredCheckpoint) -> Result<(), Error>;
    async fn latest(&self) -> Result<Option<RegisteredCheckpoint>, Error>;
}

#[derive(Default)]
pub struct InMemoryRegistry {
    entries: Mutex<Vec<RegisteredCheckpoint>>,
}

#[async_trait]
impl CheckpointRegistry for InMemoryRegistry {
    async fn register(&self, entry: RegisteredCheckpoint) -> Result<(), Error> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }

    async fn latest(&self) -> Result<Option<RegisteredCheckpoint>, Error> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .max_by_key(|e| e.sequence_point.0)
            .cloned())
    }
}
