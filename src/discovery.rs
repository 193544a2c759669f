//! Scan, validate and select: the path from block devices to one target.

use crate::decision::DecisionPort;
use crate::probe::DeviceProbe;
use crate::registry::RootPartitionRegistry;
use crate::storage::DeviceId;
use crate::validate::CandidateValidator;
use anyhow::Result;
use log::info;

pub struct RootDiscovery<'a> {
    probe: DeviceProbe<'a>,
    validator: CandidateValidator<'a>,
}

impl<'a> RootDiscovery<'a> {
    pub fn new(probe: DeviceProbe<'a>, validator: CandidateValidator<'a>) -> Self {
        Self { probe, validator }
    }

    /// Validate every probed filesystem once per session. Returns the
    /// number of valid candidates.
    pub fn run(
        &self,
        registry: &mut RootPartitionRegistry,
        decisions: &mut dyn DecisionPort,
    ) -> Result<usize> {
        if registry.is_scanned() {
            return Ok(registry.candidate_count_valid());
        }

        for candidate in self.probe.scan()? {
            let verdict = self
                .validator
                .validate(&candidate, registry.fsck_gate_mut(), decisions);
            registry.store_verdict(verdict);
        }
        registry.mark_scanned();

        let valid = registry.candidate_count_valid();
        info!("{valid} upgrade candidate(s) found");
        Ok(valid)
    }

    pub fn rescan(
        &self,
        registry: &mut RootPartitionRegistry,
        decisions: &mut dyn DecisionPort,
    ) -> Result<usize> {
        registry.reset_scan();
        self.run(registry, decisions)
    }
}

/// Select the only valid candidate, or let the user pick among several.
pub fn auto_select(
    registry: &mut RootPartitionRegistry,
    decisions: &mut dyn DecisionPort,
) -> Option<DeviceId> {
    let valid: Vec<(DeviceId, String)> = registry
        .valid_candidates()
        .into_iter()
        .map(|v| {
            let label = if v.label.is_empty() {
                format!("{} ({}, {})", v.device, v.product, v.fs_type)
            } else {
                format!("{} ({}, {}, {})", v.device, v.product, v.fs_type, v.label)
            };
            (v.device.clone(), label)
        })
        .collect();

    let device = match valid.as_slice() {
        [] => return None,
        [(only, _)] => only.clone(),
        several => {
            let labels: Vec<String> = several.iter().map(|(_, l)| l.clone()).collect();
            let idx = decisions.ask_choice("Select the system to upgrade", &labels)?;
            several.get(idx)?.0.clone()
        }
    };
    registry.select(device.clone());
    Some(device)
}
