//! Rewrite a mount table written under a previous boot's device names.
//!
//! Kernel names shift when controllers are probed in a different order or a
//! driver changes naming scheme (`hda` becoming `sda`). Entries that use
//! stable forms (`UUID=`, `LABEL=`, `/dev/disk/by-*`) are kept; kernel names
//! are moved by position, using the declared and the actually mounted root
//! device as the anchor.

use crate::fstab::MountTableEntry;
use crate::storage::{is_device_specifier, is_stable_specifier, DeviceId, KernelName, StorageTopology};
use log::{debug, info};
use std::collections::BTreeMap;

/// Historical option that modern mount tooling no longer honors.
const LEGACY_HOTPLUG_OPTION: &str = "hotplug";
const NOFAIL_OPTION: &str = "nofail";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNameTranslation {
    pub old: String,
    pub new: String,
}

/// `new -> old` specifiers, for code that must still reason in the
/// original table's terms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackwardMap(BTreeMap<String, String>);

impl BackwardMap {
    pub fn insert(&mut self, translation: &DeviceNameTranslation) {
        self.0
            .insert(translation.new.clone(), translation.old.clone());
    }

    pub fn get(&self, new: &str) -> Option<&str> {
        self.0.get(new).map(String::as_str)
    }

    /// The original name of `spec`, or `spec` itself if it was not renamed.
    pub fn original<'a>(&'a self, spec: &'a str) -> &'a str {
        self.get(spec).unwrap_or(spec)
    }

    pub fn extend(&mut self, other: BackwardMap) {
        self.0.extend(other.0);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Ways to find where a kernel-named partition went, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionalStrategy {
    /// Partition on the root's old disk: same number on the root's new disk.
    SameDisk,
    /// Partition on the other disk of a two-disk machine: same number on
    /// whichever disk does not hold the new root.
    OtherOfTwoDisks,
}

pub const POSITIONAL_CHAIN: [PositionalStrategy; 2] =
    [PositionalStrategy::SameDisk, PositionalStrategy::OtherOfTwoDisks];

/// Outcome of running the positional chain on one specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PositionalMatch {
    Resolved {
        strategy: PositionalStrategy,
        name: KernelName,
    },
    /// Not on the root's disk and the machine has this many real disks.
    AmbiguousDisks(usize),
    NoMatch,
}

pub struct MountTableTranslator<'a> {
    topology: &'a dyn StorageTopology,
}

impl<'a> MountTableTranslator<'a> {
    pub fn new(topology: &'a dyn StorageTopology) -> Self {
        Self { topology }
    }

    /// Translate every entry; returns the rewritten table and the
    /// `new -> old` map of renamed specifiers.
    ///
    /// `old_root` is the root specifier as declared by the table,
    /// `new_root` the device actually mounted as root.
    pub fn translate(
        &self,
        entries: &[MountTableEntry],
        old_root: &str,
        new_root: &DeviceId,
    ) -> (Vec<MountTableEntry>, BackwardMap) {
        let anchor = Anchor::new(old_root, new_root);
        let mut backward = BackwardMap::default();
        let mut translated = Vec::with_capacity(entries.len());

        for entry in entries {
            let mut entry = entry.clone();
            if entry.replace_option(LEGACY_HOTPLUG_OPTION, NOFAIL_OPTION) {
                debug!("{}: '{LEGACY_HOTPLUG_OPTION}' -> '{NOFAIL_OPTION}'", entry.mountpoint);
            }

            if let Some(new_spec) = self.translate_spec(&entry.spec, anchor.as_ref()) {
                let translation = DeviceNameTranslation {
                    old: entry.spec.clone(),
                    new: new_spec,
                };
                info!(
                    "{}: {} -> {}",
                    entry.mountpoint, translation.old, translation.new
                );
                backward.insert(&translation);
                entry.spec = translation.new;
            }
            translated.push(entry);
        }

        (translated, backward)
    }

    /// Translate a lone specifier the way [`translate`](Self::translate)
    /// would inside a table. Returns `spec` unchanged when it stays.
    pub fn translate_device(&self, spec: &str, old_root: &str, new_root: &DeviceId) -> String {
        let anchor = Anchor::new(old_root, new_root);
        self.translate_spec(spec, anchor.as_ref())
            .unwrap_or_else(|| spec.to_string())
    }

    /// New specifier for `spec`, or `None` to keep it.
    fn translate_spec(&self, spec: &str, anchor: Option<&Anchor>) -> Option<String> {
        if !is_device_specifier(spec) || is_stable_specifier(spec) {
            return None;
        }
        let anchor = anchor?;
        // Root kept its name: the old layout is still the current one.
        if anchor.old.disk == anchor.new.disk {
            return None;
        }
        let name = KernelName::parse(spec)?;
        match self.resolve_positional(&name, &anchor.old, &anchor.new) {
            PositionalMatch::Resolved { name: new, .. } => {
                let path = new.to_path();
                (path != spec).then_some(path)
            }
            other => {
                debug!("{spec}: left as is ({other:?})");
                None
            }
        }
    }

    /// Run [`POSITIONAL_CHAIN`] for a kernel-named partition.
    ///
    /// A result only counts if the device exists in the current probe.
    pub fn resolve_positional(
        &self,
        name: &KernelName,
        old_root: &KernelName,
        new_root: &KernelName,
    ) -> PositionalMatch {
        let disks = self.topology.disks();
        for strategy in POSITIONAL_CHAIN {
            let candidate = match strategy {
                PositionalStrategy::SameDisk if name.disk == old_root.disk => {
                    Some(name.on_disk(&new_root.disk))
                }
                PositionalStrategy::OtherOfTwoDisks
                    if name.disk != old_root.disk && disks.len() == 2 =>
                {
                    disks
                        .iter()
                        .find(|d| d.0 != new_root.disk)
                        .map(|other| name.on_disk(&other.0))
                }
                _ => None,
            };
            let Some(candidate) = candidate else {
                continue;
            };
            if self.topology.find_by_any_name(&candidate.to_path()).is_some() {
                return PositionalMatch::Resolved {
                    strategy,
                    name: candidate,
                };
            }
            debug!("{strategy:?}: {} is not present", candidate.to_path());
        }

        if name.disk != old_root.disk && disks.len() > 2 {
            PositionalMatch::AmbiguousDisks(disks.len())
        } else {
            PositionalMatch::NoMatch
        }
    }
}

/// Old and new kernel names of the root partition.
struct Anchor {
    old: KernelName,
    new: KernelName,
}

impl Anchor {
    fn new(old_root: &str, new_root: &DeviceId) -> Option<Self> {
        Some(Self {
            old: KernelName::parse(old_root)?,
            new: KernelName::parse(&new_root.to_string())?,
        })
    }
}
