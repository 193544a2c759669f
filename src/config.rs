//! Engine configuration.
//!
//! Every knob has a built-in default, so `UpgradeConfig::default()` is a
//! complete configuration. A TOML file only needs the keys it overrides:
//!
//! ```toml
//! staging_root = "/mnt"
//! min_boot_size_mib = 200
//! supported_products = ["openSUSE Leap 15", "SUSE Linux Enterprise Server 15"]
//! legacy_filesystems = ["reiserfs"]
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeConfig {
    /// Where candidates and the selected target are mounted.
    pub staging_root: PathBuf,
    /// Mount table, relative to the target root.
    pub fstab_path: PathBuf,
    /// Crypto-volume table, relative to the target root.
    pub crypttab_path: PathBuf,
    /// Presence of this file (relative to the target root) marks an
    /// installation that never finished.
    pub incomplete_marker: PathBuf,
    /// Executables whose ELF header declares the target architecture.
    /// The first one that exists wins.
    pub arch_probe_paths: Vec<PathBuf>,
    pub root_filesystems: Vec<String>,
    pub mountable_filesystems: Vec<String>,
    /// Types the upgraded system can no longer mount at all.
    pub legacy_filesystems: Vec<String>,
    /// Types that get a read-only consistency check before mounting.
    pub fsck_filesystems: Vec<String>,
    pub min_boot_size_bytes: u64,
    /// Product-name prefixes allowed as upgrade sources. Empty allows all.
    pub supported_products: Vec<String>,
    /// Program plus leading arguments; the snapshot label is appended.
    pub snapshot_command: Option<Vec<String>>,
    /// Persisted activation ledger, for unwinding from a later process.
    pub state_file: PathBuf,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            staging_root: PathBuf::from("/mnt"),
            fstab_path: PathBuf::from("etc/fstab"),
            crypttab_path: PathBuf::from("etc/cryptotab"),
            incomplete_marker: PathBuf::from(".installation-incomplete"),
            arch_probe_paths: ["bin/bash", "usr/bin/bash", "bin/sh"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            root_filesystems: strings(&["ext2", "ext3", "ext4", "btrfs", "xfs", "reiserfs", "jfs"]),
            mountable_filesystems: strings(&[
                "ext2", "ext3", "ext4", "btrfs", "xfs", "reiserfs", "jfs", "vfat", "exfat", "ntfs",
                "ntfs-3g", "hfs", "hfsplus", "udf", "iso9660",
            ]),
            legacy_filesystems: strings(&["reiserfs"]),
            fsck_filesystems: strings(&["ext3"]),
            min_boot_size_bytes: 100 * MIB,
            supported_products: Vec::new(),
            snapshot_command: None,
            state_file: PathBuf::from("/run/upgrade-root/ledger.json"),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpgradeConfigToml {
    staging_root: Option<PathBuf>,
    fstab_path: Option<PathBuf>,
    crypttab_path: Option<PathBuf>,
    incomplete_marker: Option<PathBuf>,
    arch_probe_paths: Option<Vec<PathBuf>>,
    root_filesystems: Option<Vec<String>>,
    mountable_filesystems: Option<Vec<String>>,
    legacy_filesystems: Option<Vec<String>>,
    fsck_filesystems: Option<Vec<String>>,
    min_boot_size_mib: Option<u64>,
    supported_products: Option<Vec<String>>,
    snapshot_command: Option<Vec<String>>,
    state_file: Option<PathBuf>,
}

impl UpgradeConfig {
    /// Load a TOML config file on top of the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading upgrade config '{}'", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("parsing upgrade config '{}'", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let parsed: UpgradeConfigToml = toml::from_str(raw)?;
        let mut config = Self::default();

        if let Some(root) = parsed.staging_root {
            if !root.is_absolute() {
                bail!("staging_root must be absolute, got '{}'", root.display());
            }
            config.staging_root = root;
        }
        for (field, value, slot) in [
            ("fstab_path", parsed.fstab_path, &mut config.fstab_path),
            ("crypttab_path", parsed.crypttab_path, &mut config.crypttab_path),
            (
                "incomplete_marker",
                parsed.incomplete_marker,
                &mut config.incomplete_marker,
            ),
        ] {
            if let Some(value) = value {
                *slot = relative_to_root(field, value)?;
            }
        }
        if let Some(paths) = parsed.arch_probe_paths {
            if paths.is_empty() {
                bail!("arch_probe_paths must name at least one executable");
            }
            config.arch_probe_paths = paths
                .into_iter()
                .map(|p| relative_to_root("arch_probe_paths", p))
                .collect::<Result<_>>()?;
        }
        if let Some(types) = parsed.root_filesystems {
            config.root_filesystems = normalize_types(types);
        }
        if let Some(types) = parsed.mountable_filesystems {
            config.mountable_filesystems = normalize_types(types);
        }
        if let Some(types) = parsed.legacy_filesystems {
            config.legacy_filesystems = normalize_types(types);
        }
        if let Some(types) = parsed.fsck_filesystems {
            config.fsck_filesystems = normalize_types(types);
        }
        if let Some(mib) = parsed.min_boot_size_mib {
            config.min_boot_size_bytes = match mib.checked_mul(MIB) {
                Some(bytes) => bytes,
                None => bail!("min_boot_size_mib {mib} is too large"),
            };
        }
        if let Some(products) = parsed.supported_products {
            config.supported_products = products;
        }
        if let Some(command) = parsed.snapshot_command {
            if command.is_empty() {
                bail!("snapshot_command must not be empty; omit it to disable snapshots");
            }
            config.snapshot_command = Some(command);
        }
        if let Some(state_file) = parsed.state_file {
            config.state_file = state_file;
        }

        Ok(config)
    }

    pub fn is_root_capable(&self, fstype: &str) -> bool {
        contains_type(&self.root_filesystems, fstype)
    }

    pub fn is_mountable(&self, fstype: &str) -> bool {
        contains_type(&self.mountable_filesystems, fstype)
    }

    pub fn is_legacy(&self, fstype: &str) -> bool {
        contains_type(&self.legacy_filesystems, fstype)
    }

    pub fn needs_fsck(&self, fstype: &str) -> bool {
        contains_type(&self.fsck_filesystems, fstype)
    }

    /// Path of a target-relative file inside the staging root.
    pub fn staged(&self, relative: &Path) -> PathBuf {
        self.staging_root.join(relative)
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn normalize_types(types: Vec<String>) -> Vec<String> {
    let mut types: Vec<String> = types
        .into_iter()
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    types.sort();
    types.dedup();
    types
}

fn contains_type(list: &[String], fstype: &str) -> bool {
    list.iter().any(|t| t.eq_ignore_ascii_case(fstype))
}

fn relative_to_root(field: &str, path: PathBuf) -> Result<PathBuf> {
    // Entries are joined onto the staging root, so a leading '/' is dropped.
    let relative = path.strip_prefix("/").map(Path::to_path_buf).unwrap_or(path);
    if relative.as_os_str().is_empty() {
        bail!("{field} must name a file below the target root");
    }
    if relative
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        bail!("{field} must not contain '..', got '{}'", relative.display());
    }
    Ok(relative)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(UpgradeConfig::from_toml_str("").unwrap(), UpgradeConfig::default());
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = UpgradeConfig::from_toml_str(
            r#"
staging_root = "/run/target"
fstab_path = "/etc/fstab.old"
min_boot_size_mib = 200
legacy_filesystems = ["ReiserFS", "jfs", "jfs"]
supported_products = ["openSUSE Leap 15"]
snapshot_command = ["snapper", "create", "--description"]
"#,
        )
        .unwrap();

        assert_eq!(config.staging_root, PathBuf::from("/run/target"));
        assert_eq!(config.fstab_path, PathBuf::from("etc/fstab.old"));
        assert_eq!(config.min_boot_size_bytes, 200 * MIB);
        assert_eq!(config.legacy_filesystems, vec!["jfs", "reiserfs"]);
        assert!(config.is_legacy("REISERFS"));
        assert_eq!(config.supported_products, vec!["openSUSE Leap 15"]);
        assert_eq!(
            config.staged(&config.fstab_path),
            PathBuf::from("/run/target/etc/fstab.old")
        );
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = UpgradeConfig::from_toml_str("mystery = 1").unwrap_err();
        assert!(format!("{err:#}").contains("mystery"));
    }

    #[test]
    fn test_relative_staging_root_rejected() {
        let err = UpgradeConfig::from_toml_str("staging_root = \"mnt\"").unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn test_oversized_boot_minimum_rejected() {
        // 2^44 MiB is 2^64 bytes.
        let err = UpgradeConfig::from_toml_str("min_boot_size_mib = 17592186044416").unwrap_err();
        assert!(err.to_string().contains("too large"));

        let config = UpgradeConfig::from_toml_str("min_boot_size_mib = 17592186044415").unwrap();
        assert_eq!(config.min_boot_size_bytes, 17592186044415 * MIB);
    }

    #[test]
    fn test_parent_dir_rejected() {
        let err = UpgradeConfig::from_toml_str("fstab_path = \"../etc/fstab\"").unwrap_err();
        assert!(err.to_string().contains(".."));
    }

    #[test]
    fn test_load_reads_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("upgrade.toml");
        fs::write(&path, "fsck_filesystems = [\"ext2\", \"ext3\"]\n").unwrap();

        let config = UpgradeConfig::load(&path).unwrap();
        assert!(config.needs_fsck("ext2"));
        assert!(!config.needs_fsck("xfs"));

        let missing = UpgradeConfig::load(&temp.path().join("nope.toml")).unwrap_err();
        assert!(missing.to_string().contains("nope.toml"));
    }
}
