//! Read-only consistency check gate.
//!
//! Only the configured file system types are checked, and each device at
//! most once per session. A failed check is a decision point, not an error.

use crate::config::UpgradeConfig;
use crate::decision::{DecisionPort, Question};
use crate::process::ProcessRunner;
use crate::storage::DeviceId;
use log::{info, warn};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsckOutcome {
    NotRequired,
    AlreadyChecked,
    Clean,
    /// The check failed and the user chose to go on.
    ContinueDespiteErrors,
    /// The check failed and the user chose not to mount.
    Declined,
}

impl FsckOutcome {
    pub fn may_mount(self) -> bool {
        self != FsckOutcome::Declined
    }
}

#[derive(Debug, Default, Clone)]
pub struct FsckGate {
    checked: BTreeSet<DeviceId>,
}

impl FsckGate {
    pub fn was_checked(&self, device: &DeviceId) -> bool {
        self.checked.contains(device)
    }

    pub fn check(
        &mut self,
        runner: &dyn ProcessRunner,
        config: &UpgradeConfig,
        decisions: &mut dyn DecisionPort,
        device: &DeviceId,
        fstype: &str,
    ) -> FsckOutcome {
        if !config.needs_fsck(fstype) {
            return FsckOutcome::NotRequired;
        }
        if self.was_checked(device) {
            return FsckOutcome::AlreadyChecked;
        }

        let program = format!("fsck.{fstype}");
        let args = vec!["-n".to_string(), device.to_string()];
        info!("checking {device} ({fstype}) read-only");
        let failure = match runner.run(&program, &args) {
            Ok(out) if out.success() => None,
            Ok(out) => Some(out.diagnostics()),
            Err(err) => Some(format!("{err:#}")),
        };

        let outcome = match failure {
            None => FsckOutcome::Clean,
            Some(output) => {
                warn!("consistency check of {device} failed: {output}");
                let question = Question::ContinueAfterFailedCheck {
                    device: device.clone(),
                    output,
                };
                if decisions.ask_yes_no(&question) {
                    FsckOutcome::ContinueDespiteErrors
                } else {
                    FsckOutcome::Declined
                }
            }
        };

        if outcome.may_mount() {
            self.checked.insert(device.clone());
        }
        outcome
    }
}
