//! Classify one probed filesystem as an upgrade target.
//!
//! The candidate is mounted read-only at the staging root, inspected, and
//! unmounted again whatever the result. Problems never become errors; they
//! are collected as [`Rejection`]s on the verdict.

use crate::config::UpgradeConfig;
use crate::decision::DecisionPort;
use crate::elf::{arch_compatible, host_arch, read_elf_arch};
use crate::fsck::FsckGate;
use crate::fstab::{read_fstab, root_entries};
use crate::hooks::SupportPolicy;
use crate::process::ProcessRunner;
use crate::storage::{DeviceId, FilesystemCandidate, KernelName, StorageTopology};
use log::{debug, info, warn};
use std::fmt;
use std::fs;
use std::path::Path;

pub const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    NotRootCapable,
    ConsistencyCheckDeclined,
    MountFailed(String),
    NoMountTable,
    RootEntryMismatch(String),
    ArchitectureMismatch { installed: String, running: String },
    UnsupportedProduct(String),
    IncompleteInstallation,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NotRootCapable => f.write_str("file system type cannot hold a root file system"),
            Rejection::ConsistencyCheckDeclined => {
                f.write_str("consistency check failed and mounting was declined")
            }
            Rejection::MountFailed(detail) => write!(f, "mount failed: {detail}"),
            Rejection::NoMountTable => f.write_str("no mount table found"),
            Rejection::RootEntryMismatch(detail) => write!(f, "root entry mismatch: {detail}"),
            Rejection::ArchitectureMismatch { installed, running } => {
                write!(f, "installed for {installed}, running on {running}")
            }
            Rejection::UnsupportedProduct(product) => {
                write!(f, "{product} is not supported for upgrade")
            }
            Rejection::IncompleteInstallation => f.write_str("installation was never completed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateVerdict {
    pub device: DeviceId,
    /// Exactly "no rejections".
    pub valid: bool,
    pub arch_valid: bool,
    pub product: String,
    pub arch: String,
    pub label: String,
    pub fs_type: String,
    pub rejections: Vec<Rejection>,
}

impl CandidateVerdict {
    fn new(candidate: &FilesystemCandidate) -> Self {
        Self {
            device: candidate.device.clone(),
            valid: false,
            arch_valid: false,
            product: UNKNOWN.to_string(),
            arch: UNKNOWN.to_string(),
            label: candidate.label.clone().unwrap_or_default(),
            fs_type: fs_type_name(&candidate.fstype),
            rejections: Vec::new(),
        }
    }

    fn reject(&mut self, rejection: Rejection) {
        debug!("{}: {rejection}", self.device);
        self.rejections.push(rejection);
        self.valid = false;
    }

    fn finish(mut self) -> Self {
        self.valid = self.rejections.is_empty() && self.arch_valid;
        self
    }

    /// All rejection reasons, for display.
    pub fn reason(&self) -> String {
        self.rejections
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Display name of a file system type.
pub fn fs_type_name(fstype: &str) -> String {
    match fstype {
        "ext2" => "Ext2".into(),
        "ext3" => "Ext3".into(),
        "ext4" => "Ext4".into(),
        "btrfs" => "BtrFS".into(),
        "xfs" => "XFS".into(),
        "reiserfs" => "ReiserFS".into(),
        "jfs" => "JFS".into(),
        "vfat" => "FAT".into(),
        "" => UNKNOWN.into(),
        other => other.to_uppercase(),
    }
}

pub struct CandidateValidator<'a> {
    runner: &'a dyn ProcessRunner,
    topology: &'a dyn StorageTopology,
    policy: &'a dyn SupportPolicy,
    config: &'a UpgradeConfig,
    host_arch: String,
}

impl<'a> CandidateValidator<'a> {
    pub fn new(
        runner: &'a dyn ProcessRunner,
        topology: &'a dyn StorageTopology,
        policy: &'a dyn SupportPolicy,
        config: &'a UpgradeConfig,
    ) -> Self {
        Self {
            runner,
            topology,
            policy,
            config,
            host_arch: host_arch(),
        }
    }

    pub fn with_host_arch(mut self, arch: impl Into<String>) -> Self {
        self.host_arch = arch.into();
        self
    }

    pub fn validate(
        &self,
        candidate: &FilesystemCandidate,
        gate: &mut FsckGate,
        decisions: &mut dyn DecisionPort,
    ) -> CandidateVerdict {
        let mut verdict = CandidateVerdict::new(candidate);

        let root_capable = candidate
            .root_capable
            .unwrap_or_else(|| self.config.is_root_capable(&candidate.fstype));
        if !root_capable {
            verdict.reject(Rejection::NotRootCapable);
            return verdict.finish();
        }

        let check = gate.check(
            self.runner,
            self.config,
            decisions,
            &candidate.device,
            &candidate.fstype,
        );
        if !check.may_mount() {
            verdict.reject(Rejection::ConsistencyCheckDeclined);
            return verdict.finish();
        }

        let staging = &self.config.staging_root;
        if let Err(detail) = self.mount_read_only(candidate, staging) {
            verdict.reject(Rejection::MountFailed(detail));
            return verdict.finish();
        }

        self.inspect(candidate, staging, &mut verdict);

        let args = vec![staging.to_string_lossy().into_owned()];
        match self.runner.run("umount", &args) {
            Ok(out) if out.success() => {}
            Ok(out) => warn!("could not unmount {}: {}", staging.display(), out.diagnostics()),
            Err(err) => warn!("could not unmount {}: {err:#}", staging.display()),
        }

        let verdict = verdict.finish();
        info!(
            "{}: {} ({}, {}){}",
            verdict.device,
            if verdict.valid { "valid" } else { "rejected" },
            verdict.product,
            verdict.arch,
            if verdict.valid {
                String::new()
            } else {
                format!(": {}", verdict.reason())
            }
        );
        verdict
    }

    fn mount_read_only(&self, candidate: &FilesystemCandidate, staging: &Path) -> Result<(), String> {
        fs::create_dir_all(staging)
            .map_err(|err| format!("creating '{}': {err}", staging.display()))?;
        let args = vec![
            "-o".to_string(),
            "ro".to_string(),
            "-t".to_string(),
            candidate.fstype.clone(),
            candidate.device.to_string(),
            staging.to_string_lossy().into_owned(),
        ];
        match self.runner.run("mount", &args) {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(out.diagnostics()),
            Err(err) => Err(format!("{err:#}")),
        }
    }

    /// Steps that need the mounted file system.
    fn inspect(&self, candidate: &FilesystemCandidate, staging: &Path, verdict: &mut CandidateVerdict) {
        let fstab = staging.join(&self.config.fstab_path);
        if !fstab.is_file() {
            verdict.reject(Rejection::NoMountTable);
            return;
        }
        let entries = match read_fstab(&fstab) {
            Ok(entries) => entries,
            Err(err) => {
                debug!("{}: {err:#}", candidate.device);
                verdict.reject(Rejection::NoMountTable);
                return;
            }
        };
        let roots = root_entries(&entries);
        let [root] = roots.as_slice() else {
            verdict.reject(Rejection::RootEntryMismatch(format!(
                "{} entries for '/'",
                roots.len()
            )));
            return;
        };
        if !self.root_matches(&root.spec, &candidate.device) {
            verdict.reject(Rejection::RootEntryMismatch(format!(
                "'{}' is not {}",
                root.spec, candidate.device
            )));
            return;
        }

        verdict.product = read_product(staging);
        if let Some(arch) = self.installed_arch(staging) {
            verdict.arch = arch;
        }
        verdict.arch_valid = arch_compatible(&verdict.arch, &self.host_arch);
        if !verdict.arch_valid {
            verdict.reject(Rejection::ArchitectureMismatch {
                installed: verdict.arch.clone(),
                running: self.host_arch.clone(),
            });
        }

        if !self.policy.is_supported_for_upgrade(&verdict.product) {
            verdict.reject(Rejection::UnsupportedProduct(verdict.product.clone()));
        }

        if staging.join(&self.config.incomplete_marker).exists() {
            verdict.reject(Rejection::IncompleteInstallation);
        }
    }

    /// Does the declared root specifier name `device`?
    ///
    /// A kernel name that is absent from the current probe is a previous
    /// boot's name; it matches when the partition number agrees.
    fn root_matches(&self, spec: &str, device: &DeviceId) -> bool {
        if let Some(found) = self.topology.find_by_any_name(spec) {
            return &found == device;
        }
        match (KernelName::parse(spec), KernelName::parse(&device.to_string())) {
            (Some(old), Some(new)) => {
                debug!("{spec} is not present, comparing by partition number with {device}");
                old.partition.is_some() && old.partition == new.partition
            }
            _ => false,
        }
    }

    fn installed_arch(&self, staging: &Path) -> Option<String> {
        let probe = self
            .config
            .arch_probe_paths
            .iter()
            .map(|rel| staging.join(rel))
            .find(|path| path.is_file())?;
        match read_elf_arch(&probe) {
            Ok(arch) => arch,
            Err(err) => {
                warn!("{err:#}");
                None
            }
        }
    }
}

/// `NAME VERSION_ID` from os-release, else the first line of a legacy
/// release file, else [`UNKNOWN`].
pub fn read_product(root: &Path) -> String {
    if let Ok(raw) = fs::read_to_string(root.join("etc/os-release")) {
        let field = |key: &str| {
            raw.lines()
                .filter_map(|line| line.split_once('='))
                .find(|(k, _)| k.trim() == key)
                .map(|(_, v)| v.trim().trim_matches('"').trim_matches('\'').to_string())
                .filter(|v| !v.is_empty())
        };
        if let Some(name) = field("NAME") {
            return match field("VERSION_ID") {
                Some(version) => format!("{name} {version}"),
                None => name,
            };
        }
    }
    for legacy in ["etc/SuSE-release", "etc/system-release"] {
        if let Ok(raw) = fs::read_to_string(root.join(legacy)) {
            if let Some(first) = raw.lines().map(str::trim).find(|l| !l.is_empty()) {
                return first.to_string();
            }
        }
    }
    UNKNOWN.to_string()
}
