//! Content availability tracking (§4.6): `availableHashes` records that the
//! worker has been told an artifact's hash; `availableContent` records that
//! it holds the bytes. Both are keyed by `ArtifactId` (file, directory, or
//! IPC service pip).

use std::collections::HashSet;
use std::sync::RwLock;

use fc_api_types::ArtifactId;

#[derive(Default)]
pub struct AvailabilityTracker {
    available_hashes: RwLock<HashSet<ArtifactId>>,
    available_content: RwLock<HashSet<ArtifactId>>,
}

impl AvailabilityTracker {
    pub fn mark_hash_available(&self, artifact: ArtifactId) {
        self.available_hashes.write().unwrap().insert(artifact);
    }

    pub fn mark_content_available(&self, artifact: ArtifactId) {
        // Holding the bytes implies the hash is known too.
        self.available_content.write().unwrap().insert(artifact.clone());
        self.available_hashes.write().unwrap().insert(artifact);
    }

    pub fn has_hash(&self, artifact: &ArtifactId) -> bool {
        self.available_hashes.read().unwrap().contains(artifact)
    }

    pub fn has_content(&self, artifact: &ArtifactId) -> bool {
        self.available_content.read().unwrap().contains(artifact)
    }

    pub fn forget(&self, artifact: &ArtifactId) {
        self.available_hashes.write().unwrap().remove(artifact);
        self.available_content.write().unwrap().remove(artifact);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn marking_content_available_implies_hash_available() {
        let tracker = AvailabilityTracker::default();
        let artifact = ArtifactId::File(PathBuf::from("/tmp/a"));
        tracker.mark_content_available(artifact.clone());
        assert!(tracker.has_hash(&artifact));
        assert!(tracker.has_content(&artifact));
    }

    #[test]
    fn hash_only_does_not_imply_content() {
        let tracker = AvailabilityTracker::default();
        let artifact = ArtifactId::Directory(PathBuf::from("/tmp/dir"));
        tracker.mark_hash_available(artifact.clone());
        assert!(tracker.has_hash(&artifact));
        assert!(!tracker.has_content(&artifact));
    }
}
