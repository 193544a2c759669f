//! Crypto-volume table (`cryptotab`).
//!
//! Fields: `mapping-name backing-file mountpoint type [mount-options [crypt-options]]`.
//! The backing file may be a block device or a regular file holding the
//! encrypted container; file paths are relative to the installed system's
//! root, not the host's.

use super::{decode_field, split_options, MountTableEntry, NOAUTO};
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptEntry {
    pub name: String,
    pub backing: String,
    pub mountpoint: String,
    pub fstype: String,
    pub mount_options: Vec<String>,
    pub crypt_options: Vec<String>,
}

impl CryptEntry {
    pub fn is_noauto(&self) -> bool {
        self.mount_options.iter().chain(&self.crypt_options).any(|o| o == NOAUTO)
    }

    pub fn mapped_device(&self) -> String {
        format!("/dev/mapper/{}", self.name)
    }

    /// Mount-table row for the unlocked mapping.
    pub fn to_mount_entry(&self) -> MountTableEntry {
        MountTableEntry {
            spec: self.mapped_device(),
            mountpoint: self.mountpoint.clone(),
            fstype: self.fstype.clone(),
            options: self
                .mount_options
                .iter()
                .filter(|o| o.as_str() != NOAUTO)
                .cloned()
                .collect(),
            dump: Some(0),
            pass: Some(0),
        }
    }
}

/// Read the table if it exists; a missing table means no crypto volumes.
pub fn read_crypttab(path: &Path) -> Result<Vec<CryptEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading crypto table '{}'", path.display()))?;
    parse_crypttab(&raw).with_context(|| format!("parsing crypto table '{}'", path.display()))
}

pub fn parse_crypttab(raw: &str) -> Result<Vec<CryptEntry>> {
    let mut entries = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            bail!(
                "line {}: expected at least 4 fields, found {}: '{}'",
                idx + 1,
                fields.len(),
                line
            );
        }
        entries.push(CryptEntry {
            name: fields[0].to_string(),
            backing: decode_field(fields[1]),
            mountpoint: decode_field(fields[2]),
            fstype: fields[3].to_string(),
            mount_options: fields.get(4).map(|o| split_options(o)).unwrap_or_default(),
            crypt_options: fields.get(5).map(|o| split_options(o)).unwrap_or_default(),
        });
    }
    Ok(entries)
}
