//! On-disk layout for `Cldb::save_checkpoint`/`restore_checkpoint`.
//!
//! Each shard is serialized independently and named
//! `shard-{index:03}-{crc32:08x}.json`, where the checksum is computed over
//! the serialized bytes. Two snapshots that serialize to the same bytes
//! therefore produce the same filename -- an incremental checkpoint that
//! reuses an unchanged shard writes nothing new, and `is_immutable` can
//! answer purely from the filename without touching the file (§4.1
//! "Checkpointing", §8 round-trip law #2).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{format_err, Context, Error};

use fc_api_types::{ContentLocationEntry, ShortHash};

use crate::cldb::Cldb;

const SHARD_PREFIX: &str = "shard-";
const METADATA_FILE: &str = "metadata.json";

pub fn is_content_addressed_name(file: &Path) -> bool {
    file.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(SHARD_PREFIX) && n.ends_with(".json"))
        .unwrap_or(false)
}

fn shard_file_name(index: usize, bytes: &[u8]) -> String {
    let checksum = crc32fast::hash(bytes);
    format!("{SHARD_PREFIX}{index:03}-{checksum:08x}.json")
}

pub fn save(db: &Cldb, dir: &Path) -> Result<Vec<PathBuf>, Error> {
    fs::create_dir_all(dir).with_context(|| format!("creating checkpoint dir {dir:?}"))?;

    let mut written = Vec::new();
    for (index, shard) in db.take_snapshot().into_iter().enumerate() {
        let bytes = serde_json::to_vec(&shard)
            .with_context(|| format!("serializing shard {index}"))?;
        let name = shard_file_name(index, &bytes);
        let path = dir.join(&name);
        if !path.exists() {
            // Write-then-rename keeps a concurrent reader from ever
            // observing a partial file under the final, content-addressed
            // name.
            let tmp = dir.join(format!("{name}.tmp"));
            fs::write(&tmp, &bytes).with_context(|| format!("writing {tmp:?}"))?;
            fs::rename(&tmp, &path).with_context(|| format!("renaming into {path:?}"))?;
        }
        written.push(path);
    }

    let metadata_bytes = serde_json::to_vec(&db.metadata_snapshot())
        .context("serializing metadata store")?;
    let metadata_path = dir.join(METADATA_FILE);
    fs::write(&metadata_path, &metadata_bytes)
        .with_context(|| format!("writing {metadata_path:?}"))?;
    written.push(metadata_path);

    let manifest: Vec<String> = written
        .iter()
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
        .collect();
    let manifest_path = dir.join("manifest.json");
    fs::write(&manifest_path, serde_json::to_vec(&manifest)?)
        .with_context(|| format!("writing {manifest_path:?}"))?;

    Ok(written)
}

pub fn restore(db: &Cldb, dir: &Path) -> Result<(), Error> {
    let manifest_path = dir.join("manifest.json");
    let manifest: Vec<String> = serde_json::from_slice(
        &fs::read(&manifest_path).with_context(|| format!("reading {manifest_path:?}"))?,
    )
    .with_context(|| format!("parsing {manifest_path:?}"))?;

    let mut entries: Vec<(ShortHash, ContentLocationEntry)> = Vec::new();
    let mut metadata: Option<BTreeMap<String, String>> = None;

    for name in &manifest {
        let path = dir.join(name);
        if name == METADATA_FILE {
            let bytes = fs::read(&path).with_context(|| format!("reading {path:?}"))?;
            metadata = Some(
                serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing {path:?}"))?,
            );
            continue;
        }
        if !is_content_addressed_name(&path) {
            continue;
        }
        let bytes = fs::read(&path).with_context(|| format!("reading {path:?}"))?;
        let shard: BTreeMap<ShortHash, ContentLocationEntry> = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {path:?}"))?;
        entries.extend(shard);
    }

    let metadata = metadata.ok_or_else(|| format_err!("checkpoint {dir:?} has no metadata file"))?;
    db.replace_all_pub(entries);
    db.replace_metadata(metadata);
    Ok(())
}
