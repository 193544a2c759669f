//! Process-lifetime state of root discovery and mounting.
//!
//! Holds what would otherwise be scattered "already done" flags: the scan
//! results, the selection, and the outcome of the mount attempt. The
//! idempotence checks of [`crate::discovery`] and [`crate::orchestrator`]
//! read it once on entry.

use crate::error::MountError;
use crate::fsck::FsckGate;
use crate::ledger::ActivationLedger;
use crate::storage::DeviceId;
use crate::translate::BackwardMap;
use crate::validate::CandidateVerdict;
use log::info;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountOutcome {
    Succeeded { device: DeviceId },
    Failed { device: DeviceId, error: MountError },
}

impl MountOutcome {
    pub fn device(&self) -> &DeviceId {
        match self {
            MountOutcome::Succeeded { device } | MountOutcome::Failed { device, .. } => device,
        }
    }
}

#[derive(Debug, Default)]
pub struct RootPartitionRegistry {
    verdicts: BTreeMap<DeviceId, CandidateVerdict>,
    selected: Option<DeviceId>,
    previous: Option<DeviceId>,
    scanned: bool,
    mount_attempt: Option<MountOutcome>,
    fsck: FsckGate,
    backward_names: BackwardMap,
}

impl RootPartitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_scanned(&self) -> bool {
        self.scanned
    }

    pub fn mark_scanned(&mut self) {
        self.scanned = true;
    }

    /// Forget the previous scan. The selection survives if the device is
    /// still present after the next scan.
    pub fn reset_scan(&mut self) {
        self.scanned = false;
        self.verdicts.clear();
    }

    pub fn store_verdict(&mut self, verdict: CandidateVerdict) {
        self.verdicts.insert(verdict.device.clone(), verdict);
    }

    pub fn verdict(&self, device: &DeviceId) -> Option<&CandidateVerdict> {
        self.verdicts.get(device)
    }

    pub fn verdicts(&self) -> impl Iterator<Item = &CandidateVerdict> {
        self.verdicts.values()
    }

    pub fn valid_candidates(&self) -> Vec<&CandidateVerdict> {
        self.verdicts.values().filter(|v| v.valid).collect()
    }

    pub fn candidate_count_valid(&self) -> usize {
        self.verdicts.values().filter(|v| v.valid).count()
    }

    /// Returns whether the selection changed.
    pub fn select(&mut self, device: DeviceId) -> bool {
        if self.selected.as_ref() == Some(&device) {
            return false;
        }
        info!("selected {device}");
        self.previous = self.selected.replace(device);
        true
    }

    pub fn currently_selected(&self) -> Option<&DeviceId> {
        self.selected.as_ref()
    }

    pub fn previously_selected(&self) -> Option<&DeviceId> {
        self.previous.as_ref()
    }

    pub fn mark_mount_attempted(&mut self, outcome: MountOutcome) {
        self.mount_attempt = Some(outcome);
    }

    pub fn mount_outcome(&self) -> Option<&MountOutcome> {
        self.mount_attempt.as_ref()
    }

    /// A mount is active while the ledger still holds activations.
    pub fn is_mount_active(&self, ledger: &ActivationLedger) -> bool {
        !ledger.is_empty()
    }

    /// Forget the mount attempt once its activations have been undone.
    pub fn clear_mount_attempt(&mut self) {
        self.mount_attempt = None;
    }

    pub fn fsck_gate_mut(&mut self) -> &mut FsckGate {
        &mut self.fsck
    }

    /// `new -> old` device names of every table translated this session.
    pub fn backward_names(&self) -> &BackwardMap {
        &self.backward_names
    }

    pub fn remember_translations(&mut self, map: BackwardMap) {
        self.backward_names.extend(map);
    }
}
