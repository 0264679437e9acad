//! Narrow object-store abstraction the Checkpoint Manager uploads/downloads
//! through, per Design Note "No ambient global state" -- the manager never
//! talks to a concrete backend directly.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{format_err, Error};
use async_trait::async_trait;

#[async_trait]
pub trait CentralStorage: Send + Sync {
    async fn put(&self, key: &str, local_path: &Path) -> Result<(), Error>;
    async fn get(&self, key: &str, dest_path: &Path) -> Result<(), Error>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, Error>;
    async fn exists(&self, key: &str) -> Result<bool, Error>;
}

/// In-memory fake used by tests: "uploads" copy bytes into a map keyed by
/// storage key; "downloads" write them back out.
#[derive(Default)]
pub struct InMemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl CentralStorage for InMemoryStorage {
    async fn put(&self, key: &str, local_path: &Path) -> Result<(), Error> {
        let bytes = std::fs::read(local_path)?;
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str, dest_path: &Path) -> Result<(), Error> {
        let objects = self.objects.lock().unwrap();
        let bytes = objects
            .get(key)
            .ok_or_else(|| format_err!("no such object: {key}"))?;
        std::fs::write(dest_path, bytes)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool, Error> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }
}
