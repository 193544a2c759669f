//! Kernel-assigned block device names and their disk/partition arithmetic.

use super::DiskId;
use std::fmt;

/// A `/dev/<disk>[<partition>]` name in one of the kernel's naming schemes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelName {
    pub disk: String,
    pub partition: Option<u32>,
}

impl KernelName {
    /// Parse `/dev/sda3`, `/dev/hdb`, `/dev/vda2`, `/dev/xvda1`,
    /// `/dev/nvme0n1p3` or `/dev/mmcblk0p1`. Anything else is `None`.
    pub fn parse(spec: &str) -> Option<Self> {
        let name = spec.strip_prefix("/dev/")?;
        if name.contains('/') {
            return None;
        }
        parse_lettered(name).or_else(|| parse_numbered(name))
    }

    pub fn disk_id(&self) -> DiskId {
        DiskId(self.disk.clone())
    }

    /// Same partition number on another disk.
    pub fn on_disk(&self, disk: &str) -> Self {
        Self {
            disk: disk.to_string(),
            partition: self.partition,
        }
    }

    pub fn to_path(&self) -> String {
        format!("/dev/{self}")
    }
}

impl fmt::Display for KernelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.partition {
            None => f.write_str(&self.disk),
            // nvme0n1 + 3 -> nvme0n1p3, sda + 3 -> sda3
            Some(n) if self.disk.ends_with(|c: char| c.is_ascii_digit()) => {
                write!(f, "{}p{}", self.disk, n)
            }
            Some(n) => write!(f, "{}{}", self.disk, n),
        }
    }
}

/// sd/hd/vd/xvd: letters for the disk, digits for the partition.
fn parse_lettered(name: &str) -> Option<KernelName> {
    let prefix = ["xvd", "sd", "hd", "vd"]
        .into_iter()
        .find(|p| name.starts_with(p))?;
    let rest = &name[prefix.len()..];
    let letters = rest.chars().take_while(|c| c.is_ascii_lowercase()).count();
    if letters == 0 {
        return None;
    }
    let digits = &rest[letters..];
    let partition = parse_partition(digits)?;
    Some(KernelName {
        disk: name[..prefix.len() + letters].to_string(),
        partition,
    })
}

/// nvme/mmcblk: the disk name ends in a digit, partitions use a `p` infix.
fn parse_numbered(name: &str) -> Option<KernelName> {
    let disk_len = if let Some(rest) = name.strip_prefix("nvme") {
        let ctrl = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        let after = rest[ctrl..].strip_prefix('n')?;
        let ns = after.chars().take_while(|c| c.is_ascii_digit()).count();
        if ctrl == 0 || ns == 0 {
            return None;
        }
        "nvme".len() + ctrl + 1 + ns
    } else if let Some(rest) = name.strip_prefix("mmcblk") {
        let n = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if n == 0 {
            return None;
        }
        "mmcblk".len() + n
    } else {
        return None;
    };

    let disk = &name[..disk_len];
    let tail = &name[disk_len..];
    let partition = if tail.is_empty() {
        None
    } else {
        let digits = tail.strip_prefix('p')?;
        Some(parse_partition(digits)??)
    };
    Some(KernelName {
        disk: disk.to_string(),
        partition,
    })
}

/// `""` is a whole disk, digits are a partition, anything else is invalid.
fn parse_partition(digits: &str) -> Option<Option<u32>> {
    if digits.is_empty() {
        return Some(None);
    }
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(Some)
}
