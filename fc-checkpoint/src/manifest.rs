//! `checkpointInfo.txt`-style incremental manifest: one `relativePath=storageId`
//! pair per line. Grounded on the teacher's line-oriented persisted formats
//! (`proxmox-rrd::cache`'s journal entry lines, and PBS's own local
//! manifest files).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{format_err, Context, Error};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    /// Lowercased relativePath -> storageId, sorted for stable diffing. Keys
    /// are normalized to lowercase on insert so lookups are
    /// case-insensitive, matching filesystems that are themselves
    /// case-insensitive about the paths these keys name.
    pub entries: BTreeMap<String, String>,
}

impl Manifest {
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut entries = BTreeMap::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let (path, storage_id) = line
                .split_once('=')
                .ok_or_else(|| format_err!("malformed manifest line {}: {line:?}", lineno + 1))?;
            entries.insert(path.to_lowercase(), storage_id.to_string());
        }
        Ok(Self { entries })
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (path, storage_id) in &self.entries {
            out.push_str(path);
            out.push('=');
            out.push_str(storage_id);
            out.push('\n');
        }
        out
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path).with_context(|| format!("reading manifest {path:?}"))?;
        Self::parse(&text)
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        fs::write(path, self.to_text()).with_context(|| format!("writing manifest {path:?}"))
    }

    /// Inserts under the lowercased path, so a later lookup with a
    /// differently-cased path still finds it.
    pub fn insert(&mut self, path: impl Into<String>, storage_id: impl Into<String>) {
        self.entries.insert(path.into().to_lowercase(), storage_id.into());
    }

    pub fn get(&self, path: &str) -> Option<&String> {
        self.entries.get(&path.to_lowercase())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(&path.to_lowercase())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_through_text() {
        let mut manifest = Manifest::default();
        manifest.entries.insert("shard-000-deadbeef.json".into(), "obj-1".into());
        manifest.entries.insert("metadata.json".into(), "obj-2".into());

        let text = manifest.to_text();
        let parsed = Manifest::parse(&text).unwrap();
        assert_eq!(manifest, parsed);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(Manifest::parse("not-a-valid-line").is_err());
    }

    #[test]
    fn lookups_are_case_insensitive() {
        let mut manifest = Manifest::default();
        manifest.insert("Shard-000-DeadBeef.json", "obj-1");

        assert_eq!(manifest.get("shard-000-deadbeef.json"), Some(&"obj-1".to_string()));
        assert!(manifest.contains("SHARD-000-DEADBEEF.JSON"));
    }
}
