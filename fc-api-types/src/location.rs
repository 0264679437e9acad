use anyhow::{bail, Error};

use crate::machine::MachineIdSet;

/// Record of where a piece of content lives and when it was last useful.
///
/// An entry with empty `locations` is semantically *absent* -- the CLDB
/// deletes such entries on write rather than storing them (see
/// `ContentLocationEntry::is_absent`).
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ContentLocationEntry {
    pub locations: MachineIdSet,
    pub content_size: i64,
    pub last_access_utc: i64,
    pub creation_utc: i64,
}

impl ContentLocationEntry {
    pub fn new(
        locations: MachineIdSet,
        content_size: i64,
        last_access_utc: i64,
        creation_utc: i64,
    ) -> Result<Self, Error> {
        if content_size < 0 {
            bail!("content_size must be >= 0, got {content_size}");
        }
        if last_access_utc < creation_utc {
            bail!(
                "last_access_utc ({last_access_utc}) must be >= creation_utc ({creation_utc})"
            );
        }
        Ok(Self { locations, content_size, last_access_utc, creation_utc })
    }

    pub fn is_absent(&self) -> bool {
        self.locations.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::machine::MachineId;

    #[test]
    fn rejects_negative_size() {
        let locations = MachineIdSet::from_ids([MachineId(0)]);
        assert!(ContentLocationEntry::new(locations, -1, 10, 5).is_err());
    }

    #[test]
    fn rejects_access_before_creation() {
        let locations = MachineIdSet::from_ids([MachineId(0)]);
        assert!(ContentLocationEntry::new(locations, 10, 1, 5).is_err());
    }

    #[test]
    fn empty_locations_is_absent() {
        let entry = ContentLocationEntry::new(MachineIdSet::empty(), 0, 5, 5).unwrap();
        assert!(entry.is_absent());
    }
}
