//! Locating a separate `/var` before the table is translated.
//!
//! Strategies run in order until one yields a device that mounts:
//! [`VarStrategy::Direct`] for names that are not kernel names, the
//! translator's positional strategies for kernel names, and finally
//! [`VarStrategy::AskUser`] with retry until a selection mounts or the
//! user cancels.

use crate::decision::DecisionPort;
use crate::error::MountError;
use crate::fstab::MountTableEntry;
use crate::storage::{DeviceId, KernelName, StorageTopology};
use crate::translate::{MountTableTranslator, PositionalMatch, PositionalStrategy};
use log::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarStrategy {
    Direct,
    Positional(PositionalStrategy),
    AskUser,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarResolution {
    pub spec: String,
    pub strategy: VarStrategy,
}

pub(super) struct VarResolver<'r> {
    pub topology: &'r dyn StorageTopology,
    pub mountable: &'r dyn Fn(&str) -> bool,
}

impl VarResolver<'_> {
    /// Resolve and mount `/var`. `try_mount` mounts a specifier at the
    /// staged `/var` and reports why it failed.
    pub fn resolve(
        &self,
        var: &MountTableEntry,
        old_root: &str,
        new_root: &DeviceId,
        decisions: &mut dyn DecisionPort,
        try_mount: &mut dyn FnMut(&str) -> Result<(), String>,
    ) -> Result<VarResolution, MountError> {
        if let Some(guess) = self.guess(var, old_root, new_root)? {
            match try_mount(&guess.spec) {
                Ok(()) => {
                    info!("/var: {} via {:?}", guess.spec, guess.strategy);
                    return Ok(guess);
                }
                Err(detail) => warn!("/var: mounting {} failed: {detail}", guess.spec),
            }
        }
        self.ask_user(var, decisions, try_mount)
    }

    fn guess(
        &self,
        var: &MountTableEntry,
        old_root: &str,
        new_root: &DeviceId,
    ) -> Result<Option<VarResolution>, MountError> {
        let Some(name) = KernelName::parse(&var.spec) else {
            return Ok(Some(VarResolution {
                spec: var.spec.clone(),
                strategy: VarStrategy::Direct,
            }));
        };
        let new_anchor = KernelName::parse(&new_root.to_string());
        let old_anchor = KernelName::parse(old_root).or_else(|| new_anchor.clone());
        let (Some(old_anchor), Some(new_anchor)) = (old_anchor, new_anchor) else {
            debug!("/var: root {new_root} has no kernel name to compare with");
            return Ok(None);
        };

        let translator = MountTableTranslator::new(self.topology);
        match translator.resolve_positional(&name, &old_anchor, &new_anchor) {
            PositionalMatch::Resolved { strategy, name } => Ok(Some(VarResolution {
                spec: name.to_path(),
                strategy: VarStrategy::Positional(strategy),
            })),
            PositionalMatch::AmbiguousDisks(count) => Err(MountError::GuardRejected(format!(
                "/var ({}) is on another disk than the root file system and \
                 {count} disks are present; cannot tell which one holds it",
                var.spec
            ))),
            PositionalMatch::NoMatch => Ok(None),
        }
    }

    fn ask_user(
        &self,
        var: &MountTableEntry,
        decisions: &mut dyn DecisionPort,
        try_mount: &mut dyn FnMut(&str) -> Result<(), String>,
    ) -> Result<VarResolution, MountError> {
        let choices: Vec<DeviceId> = self
            .topology
            .probed_filesystems()
            .map_err(|err| MountError::AuxiliaryMountFailed {
                device: var.spec.clone(),
                mountpoint: var.mountpoint.clone(),
                detail: format!("{err:#}"),
            })?
            .into_iter()
            .filter(|c| (self.mountable)(&c.fstype))
            .map(|c| c.device)
            .collect();
        let labels: Vec<String> = choices.iter().map(ToString::to_string).collect();
        let mut prompt = format!("The device holding /var ({}) was not found. Select it:", var.spec);

        loop {
            let picked = decisions
                .ask_choice(&prompt, &labels)
                .and_then(|idx| choices.get(idx));
            let Some(device) = picked else {
                return Err(MountError::AuxiliaryMountFailed {
                    device: var.spec.clone(),
                    mountpoint: var.mountpoint.clone(),
                    detail: "no device selected for /var".to_string(),
                });
            };
            let spec = device.to_string();
            match try_mount(&spec) {
                Ok(()) => {
                    info!("/var: {spec} selected by the user");
                    return Ok(VarResolution {
                        spec,
                        strategy: VarStrategy::AskUser,
                    });
                }
                Err(detail) => {
                    warn!("/var: mounting {spec} failed: {detail}");
                    prompt = format!("Mounting {spec} as /var failed:\n{detail}\nSelect another device:");
                }
            }
        }
    }
}
