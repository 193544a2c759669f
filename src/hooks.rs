//! Upgrade-support allow-list and pre-upgrade snapshot collaborators.

use crate::process::ProcessRunner;
use anyhow::{bail, Result};
use log::info;
use time::OffsetDateTime;

/// Is this installed product a supported upgrade source?
pub trait SupportPolicy {
    fn is_supported_for_upgrade(&self, product: &str) -> bool;
}

/// Prefix allow-list. An empty list accepts every product.
#[derive(Debug, Clone, Default)]
pub struct ProductAllowList {
    prefixes: Vec<String>,
}

impl ProductAllowList {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }
}

impl SupportPolicy for ProductAllowList {
    fn is_supported_for_upgrade(&self, product: &str) -> bool {
        self.prefixes.is_empty() || self.prefixes.iter().any(|p| product.starts_with(p.as_str()))
    }
}

/// Backup/snapshot collaborator, called once after a successful mount.
pub trait SnapshotHook {
    fn create_pre_upgrade_snapshot(&mut self, label: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NoSnapshot;

impl SnapshotHook for NoSnapshot {
    fn create_pre_upgrade_snapshot(&mut self, _label: &str) -> Result<()> {
        Ok(())
    }
}

/// Runs a configured command with the label appended.
pub struct CommandSnapshotHook<'a> {
    runner: &'a dyn ProcessRunner,
    command: Vec<String>,
}

impl<'a> CommandSnapshotHook<'a> {
    pub fn new(runner: &'a dyn ProcessRunner, command: Vec<String>) -> Self {
        Self { runner, command }
    }
}

impl SnapshotHook for CommandSnapshotHook<'_> {
    fn create_pre_upgrade_snapshot(&mut self, label: &str) -> Result<()> {
        let Some((program, leading)) = self.command.split_first() else {
            bail!("snapshot command is empty");
        };
        let mut args = leading.to_vec();
        args.push(label.to_string());
        let output = self.runner.run(program, &args)?;
        if !output.success() {
            bail!("{} failed: {}", program, output.diagnostics());
        }
        info!("pre-upgrade snapshot created: {label}");
        Ok(())
    }
}

/// `pre-upgrade 20261016T101500Z`
pub fn snapshot_label() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "pre-upgrade {:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}
