//! Enumerate filesystems that could hold an installed system.

use crate::config::UpgradeConfig;
use crate::storage::{FilesystemCandidate, StorageTopology};
use anyhow::{Context, Result};
use log::debug;

pub struct DeviceProbe<'a> {
    topology: &'a dyn StorageTopology,
    config: &'a UpgradeConfig,
}

impl<'a> DeviceProbe<'a> {
    pub fn new(topology: &'a dyn StorageTopology, config: &'a UpgradeConfig) -> Self {
        Self { topology, config }
    }

    /// Every formatted block-backed filesystem except swap, tagged with
    /// whether its type can hold a root filesystem.
    pub fn scan(&self) -> Result<Vec<FilesystemCandidate>> {
        let found = self
            .topology
            .probed_filesystems()
            .context("querying storage topology")?;
        let candidates: Vec<FilesystemCandidate> = found
            .into_iter()
            .filter(|c| c.fstype != "swap")
            .map(|mut c| {
                c.root_capable = Some(self.config.is_root_capable(&c.fstype));
                c
            })
            .collect();
        debug!("scan found {} filesystems", candidates.len());
        Ok(candidates)
    }
}
