//! Storage topology: what block devices exist right now and how to name them.
//!
//! Kernel names (`/dev/sda3`) are not stable across boots, so everything the
//! engine keeps hold of is a [`DeviceId`] resolved against the live probe,
//! never a raw specifier string taken from an old mount table.

pub mod kernel_name;
pub mod lsblk;

pub use kernel_name::KernelName;
pub use lsblk::LsblkTopology;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Handle of a block device present in the current probe.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(PathBuf);

impl DeviceId {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Kernel name without `/dev/`, e.g. `sda3`.
    pub fn name(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// A whole disk, identified by its kernel name (`sda`, `nvme0n1`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DiskId(pub String);

impl fmt::Display for DiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One formatted, block-backed filesystem found by a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemCandidate {
    pub device: DeviceId,
    pub fstype: String,
    pub label: Option<String>,
    pub uuid: Option<String>,
    /// Filled in by the probe from the configured root-capable types.
    pub root_capable: Option<bool>,
}

/// Storage topology provider.
pub trait StorageTopology {
    /// Every formatted block-backed filesystem, swap included.
    fn probed_filesystems(&self) -> Result<Vec<FilesystemCandidate>>;

    fn disk_of(&self, device: &DeviceId) -> Option<DiskId>;

    /// Real disks currently attached (no loop, rom or ram devices).
    fn disks(&self) -> Vec<DiskId>;

    /// Resolve any specifier form (`LABEL=`, `UUID=`, `/dev/disk/by-*`,
    /// kernel path) to a device from the current probe.
    fn find_by_any_name(&self, name: &str) -> Option<DeviceId>;

    fn size_bytes(&self, device: &DeviceId) -> Option<u64>;

    /// Record where a device is mounted in the upgrade target.
    fn set_mountpoint(&mut self, device: &DeviceId, path: &Path);
}

/// Whether a mount-table specifier names a block device at all.
///
/// Pseudo filesystems (`proc`, `tmpfs`), network shares and bind sources
/// are not devices and are never translated.
pub fn is_device_specifier(spec: &str) -> bool {
    spec.starts_with("/dev/")
        || ["LABEL=", "UUID=", "PARTUUID=", "PARTLABEL="]
            .iter()
            .any(|prefix| spec.starts_with(prefix))
}

/// Specifier forms that survive a reboot unchanged.
pub fn is_stable_specifier(spec: &str) -> bool {
    is_device_specifier(spec) && KernelName::parse(spec).is_none()
}
