//! Export manifest
//!
//! `export` writes two files into the target directory:
//!
//! - `export_manifest.json`: properties, iterator pipelines, split points,
//!   timestamp policy and logical time of the table
//! - `files.txt`: one data file id per line, for the caller's bulk copy
//!
//! Both are written to a temp file, synced and renamed into place, so a
//! reader never sees a half-written manifest.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::clock::TimestampPolicy;
use crate::error::{AdminError, Result};
use crate::iterators::{self, IteratorScope, IteratorSetting};
use crate::properties::PropertyMap;

pub const MANIFEST_FILE: &str = "export_manifest.json";
pub const FILE_LIST: &str = "files.txt";
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedFile {
    pub id: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportManifest {
    pub format_version: u32,
    /// Name of the table at export time (informational).
    pub table_name: String,
    pub timestamp_policy: TimestampPolicy,
    pub logical_time: u64,
    pub exported_at_ms: u64,
    pub properties: PropertyMap,
    /// Pipelines decoded from `properties`, kept for readers of the manifest.
    pub iterators: BTreeMap<IteratorScope, Vec<IteratorSetting>>,
    pub splits: BTreeSet<String>,
    pub files: Vec<ExportedFile>,
}

impl ExportManifest {
    /// Write the manifest and file list into `dir`, creating it if needed.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;

        let manifest_path = dir.join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(&manifest_path, &json)?;

        let mut listing = String::new();
        for file in &self.files {
            listing.push_str(&file.id);
            listing.push('\n');
        }
        write_atomic(&dir.join(FILE_LIST), listing.as_bytes())?;

        Ok(manifest_path)
    }

    /// Read and check a manifest written by `write_to`.
    pub fn read_from(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        if !path.is_file() {
            return Err(AdminError::invalid(format!(
                "No export manifest at {}",
                path.display()
            )));
        }
        let bytes = fs::read(&path)?;
        let manifest: ExportManifest = serde_json::from_slice(&bytes).map_err(|e| {
            AdminError::invalid(format!("Malformed manifest {}: {}", path.display(), e))
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        if self.format_version != MANIFEST_FORMAT_VERSION {
            return Err(AdminError::invalid(format!(
                "Unsupported manifest format version {} (expected {})",
                self.format_version, MANIFEST_FORMAT_VERSION
            )));
        }
        if self.timestamp_policy == TimestampPolicy::Logical && self.logical_time == u64::MAX {
            return Err(AdminError::invalid(
                "Manifest logicalTime leaves no logical timestamps for new writes",
            ));
        }
        if iterators::list_all(&self.properties) != self.iterators {
            return Err(AdminError::invalid(
                "Manifest iterator section disagrees with its properties",
            ));
        }
        Ok(())
    }
}

fn write_atomic(final_path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = final_path.with_extension("tmp");
    let result = (|| -> std::io::Result<()> {
        let file = fs::File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp_path, final_path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    Ok(result?)
}
