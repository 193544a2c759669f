//! Storage topology backed by a single `lsblk --json` probe.

use super::{DeviceId, DiskId, FilesystemCandidate, KernelName, StorageTopology};
use crate::process::ProcessRunner;
use anyhow::{bail, Context, Result};
use log::debug;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const LSBLK_COLUMNS: &str = "NAME,PATH,TYPE,FSTYPE,LABEL,UUID,PARTUUID,PARTLABEL,PKNAME,SIZE,MOUNTPOINT";

/// Device types that count as real disks for layout heuristics.
const DISK_TYPES: &[&str] = &["disk"];

#[derive(Debug, Deserialize)]
struct LsblkResponse {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    path: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    fstype: Option<String>,
    label: Option<String>,
    uuid: Option<String>,
    partuuid: Option<String>,
    partlabel: Option<String>,
    pkname: Option<String>,
    size: Option<LsblkSize>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

/// Newer lsblk prints `--bytes` sizes as numbers, older ones as strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LsblkSize {
    Number(u64),
    Text(String),
}

impl LsblkSize {
    fn bytes(&self) -> Option<u64> {
        match self {
            LsblkSize::Number(n) => Some(*n),
            LsblkSize::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// One flattened node of the block device tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub device: DeviceId,
    pub kind: String,
    pub fstype: Option<String>,
    pub label: Option<String>,
    pub uuid: Option<String>,
    pub partuuid: Option<String>,
    pub partlabel: Option<String>,
    /// Nearest ancestor of type `disk`.
    pub disk: Option<DiskId>,
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct LsblkTopology {
    devices: Vec<BlockDevice>,
    mountpoints: BTreeMap<DeviceId, PathBuf>,
}

impl LsblkTopology {
    /// Run lsblk once and build the topology from its output.
    pub fn probe(runner: &dyn ProcessRunner) -> Result<Self> {
        let args: Vec<String> = ["--json", "--bytes", "--output", LSBLK_COLUMNS]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = runner.run("lsblk", &args).context("running lsblk")?;
        if !output.success() {
            bail!("lsblk discovery failed: {}", output.diagnostics());
        }
        Self::from_json(&output.stdout)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let decoded: LsblkResponse =
            serde_json::from_str(raw).context("parsing lsblk JSON output")?;
        let mut devices = Vec::new();
        for device in decoded.blockdevices {
            flatten(device, None, &mut devices);
        }
        debug!("lsblk: {} block devices", devices.len());
        Ok(Self {
            devices,
            mountpoints: BTreeMap::new(),
        })
    }

    pub fn devices(&self) -> &[BlockDevice] {
        &self.devices
    }

    /// Mount point recorded via [`StorageTopology::set_mountpoint`].
    pub fn mountpoint_of(&self, device: &DeviceId) -> Option<&Path> {
        self.mountpoints.get(device).map(PathBuf::as_path)
    }

    fn get(&self, device: &DeviceId) -> Option<&BlockDevice> {
        self.devices.iter().find(|d| &d.device == device)
    }

    fn find_by(&self, pick: impl Fn(&BlockDevice) -> Option<&String>, value: &str) -> Option<DeviceId> {
        self.devices
            .iter()
            .find(|d| pick(d).is_some_and(|v| v == value))
            .map(|d| d.device.clone())
    }
}

fn flatten(node: LsblkDevice, disk: Option<&DiskId>, out: &mut Vec<BlockDevice>) {
    let path = node
        .path
        .clone()
        .unwrap_or_else(|| format!("/dev/{}", node.name));
    let own_disk = if DISK_TYPES.contains(&node.kind.as_str()) {
        Some(DiskId(node.name.clone()))
    } else {
        disk.cloned()
            .or_else(|| node.pkname.clone().map(DiskId))
    };

    out.push(BlockDevice {
        device: DeviceId::new(path),
        kind: node.kind.clone(),
        fstype: node.fstype.clone().filter(|s| !s.is_empty()),
        label: node.label.clone().filter(|s| !s.is_empty()),
        uuid: node.uuid.clone().filter(|s| !s.is_empty()),
        partuuid: node.partuuid.clone().filter(|s| !s.is_empty()),
        partlabel: node.partlabel.clone().filter(|s| !s.is_empty()),
        disk: own_disk.clone(),
        size_bytes: node.size.as_ref().and_then(LsblkSize::bytes),
    });

    for child in node.children {
        flatten(child, own_disk.as_ref(), out);
    }
}

impl StorageTopology for LsblkTopology {
    fn probed_filesystems(&self) -> Result<Vec<FilesystemCandidate>> {
        Ok(self
            .devices
            .iter()
            .filter_map(|d| {
                let fstype = d.fstype.clone()?;
                Some(FilesystemCandidate {
                    device: d.device.clone(),
                    fstype,
                    label: d.label.clone(),
                    uuid: d.uuid.clone(),
                    root_capable: None,
                })
            })
            .collect())
    }

    fn disk_of(&self, device: &DeviceId) -> Option<DiskId> {
        self.get(device)
            .and_then(|d| d.disk.clone())
            .or_else(|| {
                KernelName::parse(&device.to_string()).map(|k| k.disk_id())
            })
    }

    fn disks(&self) -> Vec<DiskId> {
        let mut disks: Vec<DiskId> = self
            .devices
            .iter()
            .filter(|d| DISK_TYPES.contains(&d.kind.as_str()))
            .map(|d| DiskId(d.device.name()))
            .collect();
        disks.sort();
        disks.dedup();
        disks
    }

    fn find_by_any_name(&self, name: &str) -> Option<DeviceId> {
        let name = name.trim();
        if let Some(v) = name.strip_prefix("UUID=") {
            return self.find_by(|d| d.uuid.as_ref(), unquote(v));
        }
        if let Some(v) = name.strip_prefix("LABEL=") {
            return self.find_by(|d| d.label.as_ref(), unquote(v));
        }
        if let Some(v) = name.strip_prefix("PARTUUID=") {
            return self.find_by(|d| d.partuuid.as_ref(), unquote(v));
        }
        if let Some(v) = name.strip_prefix("PARTLABEL=") {
            return self.find_by(|d| d.partlabel.as_ref(), unquote(v));
        }
        for (dir, prefix) in [
            ("/dev/disk/by-uuid/", "UUID="),
            ("/dev/disk/by-label/", "LABEL="),
            ("/dev/disk/by-partuuid/", "PARTUUID="),
            ("/dev/disk/by-partlabel/", "PARTLABEL="),
        ] {
            if let Some(v) = name.strip_prefix(dir) {
                return self.find_by_any_name(&format!("{prefix}{v}"));
            }
        }

        let path = if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/dev/{name}")
        };
        let wanted = DeviceId::new(&path);
        if self.get(&wanted).is_some() {
            return Some(wanted);
        }
        // Other udev symlinks (by-id, by-path, LVM names) resolve on the live
        // system only.
        let resolved = fs::canonicalize(&path).ok()?;
        let resolved = DeviceId::new(resolved);
        self.get(&resolved).map(|d| d.device.clone())
    }

    fn size_bytes(&self, device: &DeviceId) -> Option<u64> {
        self.get(device).and_then(|d| d.size_bytes)
    }

    fn set_mountpoint(&mut self, device: &DeviceId, path: &Path) {
        self.mountpoints.insert(device.clone(), path.to_path_buf());
    }
}

fn unquote(value: &str) -> &str {
    value.trim_matches('"')
}
