//! Checks on the target's mount table and layout.

use crate::config::UpgradeConfig;
use crate::error::TableProblem;
use crate::fstab::{root_entries, MountTableEntry};
use crate::process::ProcessRunner;
use crate::storage::{DeviceId, KernelName, StorageTopology};
use crate::translate::BackwardMap;
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

const PAM_MOUNT_CONF: &str = "etc/security/pam_mount.conf.xml";
const PAM_COMMON_AUTH: &str = "etc/pam.d/common-auth";

/// Fatal table problems, checked before anything besides the root is
/// mounted.
pub(super) fn check_table(
    entries: &[MountTableEntry],
    path: &Path,
    config: &UpgradeConfig,
) -> Result<(), TableProblem> {
    if entries.is_empty() {
        return Err(TableProblem::Empty(path.to_path_buf()));
    }
    let roots = root_entries(entries).len();
    if roots != 1 {
        return Err(TableProblem::RootEntryCount(roots));
    }
    let legacy: Vec<(String, String)> = entries
        .iter()
        .filter(|e| config.is_legacy(&e.fstype))
        .map(|e| (e.mountpoint.clone(), e.fstype.clone()))
        .collect();
    if !legacy.is_empty() {
        return Err(TableProblem::LegacyFilesystems(legacy));
    }
    Ok(())
}

/// Specifiers that name a disk partition by its kernel name.
pub(super) fn unstable_device_names(entries: &[MountTableEntry]) -> Vec<String> {
    entries
        .iter()
        .filter(|e| KernelName::parse(&e.spec).is_some_and(|k| k.partition.is_some()))
        .map(|e| e.spec.clone())
        .collect()
}

/// PAM-based encrypted home directory setup, if any.
pub(super) fn encrypted_home_config(root: &Path) -> Option<PathBuf> {
    let conf = root.join(PAM_MOUNT_CONF);
    if conf.is_file() {
        return Some(conf);
    }
    let auth = root.join(PAM_COMMON_AUTH);
    let raw = fs::read_to_string(&auth).ok()?;
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .any(|l| l.contains("pam_mount.so") || l.contains("pam_ecryptfs.so"))
        .then_some(auth)
}

/// Size of the device behind `spec`.
///
/// Tries the current name, then the name the table originally used, then
/// asks the kernel directly.
pub(super) fn device_size(
    runner: &dyn ProcessRunner,
    topology: &dyn StorageTopology,
    backward: &BackwardMap,
    spec: &str,
) -> Option<u64> {
    let known = [spec, backward.original(spec)]
        .into_iter()
        .filter_map(|name| topology.find_by_any_name(name))
        .find_map(|dev| topology.size_bytes(&dev));
    if known.is_some() {
        return known;
    }

    let device = topology
        .find_by_any_name(spec)
        .unwrap_or_else(|| DeviceId::new(spec));
    let args = vec!["--getsize64".to_string(), device.to_string()];
    let out = runner.run("blockdev", &args).ok()?;
    if !out.success() {
        debug!("blockdev {device}: {}", out.diagnostics());
        return None;
    }
    out.stdout.trim().parse().ok()
}
