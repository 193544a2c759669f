//! Mount the selected installation and everything it depends on.
//!
//! # Sequence
//!
//! ```text
//! NotStarted ── root mounted rw ──▶ RootMounted
//!            ── table read, /var located, table translated ──▶ TableTranslated
//!            ── volumes unlocked, auxiliary mounts, swap ──▶ AuxiliaryMounted
//!            ── mount points published, snapshot ──▶ Recorded
//! ```
//!
//! Every activation is recorded in the [`ActivationLedger`] the moment it
//! succeeds. A fatal error at any step unwinds the ledger back to where the
//! attempt started, so the target is left either fully mounted or not at
//! all. The outcome is stored in the [`RootPartitionRegistry`]; repeating a
//! successful or terminally failed attempt performs no further work.

mod crypt;
mod guards;
mod var;

pub use var::{VarResolution, VarStrategy};

use crate::config::UpgradeConfig;
use crate::decision::{ask_mount_failure, DecisionPort, MountFailureAction, Notice, Question};
use crate::error::{MountError, TableProblem};
use crate::fstab::crypttab::{read_crypttab, CryptEntry};
use crate::fstab::{entry_for, read_fstab, root_entries, MountTableEntry};
use crate::hooks::{snapshot_label, SnapshotHook};
use crate::ledger::{Activation, ActivationLedger};
use crate::process::ProcessRunner;
use crate::registry::{MountOutcome, RootPartitionRegistry};
use crate::storage::{is_device_specifier, DeviceId, StorageTopology};
use crate::translate::MountTableTranslator;
use crypt::UnlockResult;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use var::VarResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStage {
    NotStarted,
    RootMounted,
    TableTranslated,
    AuxiliaryMounted,
    Recorded,
}

/// Collaborators and state one mount attempt works on.
pub struct MountContext<'c> {
    pub registry: &'c mut RootPartitionRegistry,
    pub ledger: &'c mut ActivationLedger,
    pub topology: &'c mut dyn StorageTopology,
    pub decisions: &'c mut dyn DecisionPort,
    pub snapshot: &'c mut dyn SnapshotHook,
}

pub struct MountOrchestrator<'a> {
    runner: &'a dyn ProcessRunner,
    config: &'a UpgradeConfig,
    stage: MountStage,
}

impl<'a> MountOrchestrator<'a> {
    pub fn new(runner: &'a dyn ProcessRunner, config: &'a UpgradeConfig) -> Self {
        Self {
            runner,
            config,
            stage: MountStage::NotStarted,
        }
    }

    pub fn stage(&self) -> MountStage {
        self.stage
    }

    fn advance(&mut self, stage: MountStage) {
        debug!("mount stage: {:?} -> {:?}", self.stage, stage);
        self.stage = stage;
    }

    pub fn mount(&mut self, device: &DeviceId, ctx: &mut MountContext<'_>) -> Result<(), MountError> {
        match ctx.registry.mount_outcome() {
            Some(MountOutcome::Succeeded { device: mounted }) if mounted == device => {
                debug!("{device} is already mounted");
                return Ok(());
            }
            Some(MountOutcome::Succeeded { device: mounted }) => {
                return Err(MountError::GuardRejected(format!(
                    "{mounted} is already mounted at {}; unmount it first",
                    self.config.staging_root.display()
                )));
            }
            Some(MountOutcome::Failed { device: failed, error })
                if failed == device && error.is_terminal() =>
            {
                debug!("{device} failed before: {error}");
                return Err(error.clone());
            }
            _ => {}
        }

        let rejection = match ctx.registry.verdict(device) {
            Some(verdict) if !verdict.valid => Some(verdict.reason()),
            Some(_) => None,
            // After a scan every mountable candidate has a verdict.
            None if ctx.registry.is_scanned() => {
                Some("not among the validated installations".to_string())
            }
            None => None,
        };
        if let Some(reason) = rejection {
            let error = MountError::ValidationRejected {
                device: device.to_string(),
                reason,
            };
            ctx.registry.mark_mount_attempted(MountOutcome::Failed {
                device: device.clone(),
                error: error.clone(),
            });
            return Err(error);
        }

        ctx.registry.select(device.clone());
        let baseline = ctx.ledger.len();
        self.stage = MountStage::NotStarted;

        match self.attempt(device, baseline, ctx) {
            Ok(()) => {
                self.advance(MountStage::Recorded);
                info!("{device} is mounted at {}", self.config.staging_root.display());
                ctx.registry.mark_mount_attempted(MountOutcome::Succeeded {
                    device: device.clone(),
                });
                Ok(())
            }
            Err(error) => {
                warn!("mounting {device} failed: {error}");
                if let Err(unwind) = ctx.ledger.unwind(self.runner, Some(baseline)) {
                    warn!("{unwind}");
                    ctx.decisions.notify(&Notice::RootInUse(unwind));
                }
                for warning in ctx.ledger.warnings() {
                    ctx.decisions.notify(&Notice::Unwind(warning.clone()));
                }
                self.advance(MountStage::NotStarted);
                ctx.registry.mark_mount_attempted(MountOutcome::Failed {
                    device: device.clone(),
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    fn attempt(
        &mut self,
        device: &DeviceId,
        baseline: usize,
        ctx: &mut MountContext<'_>,
    ) -> Result<(), MountError> {
        let staging = self.config.staging_root.clone();

        if let Some(fstype) = fstype_of(&*ctx.topology, device) {
            let check = ctx.registry.fsck_gate_mut().check(
                self.runner,
                self.config,
                &mut *ctx.decisions,
                device,
                &fstype,
            );
            if !check.may_mount() {
                return Err(MountError::ValidationRejected {
                    device: device.to_string(),
                    reason: "consistency check failed".to_string(),
                });
            }
        }

        self.mount_root(device, &staging, ctx)?;
        self.advance(MountStage::RootMounted);

        let fstab_path = self.config.staged(&self.config.fstab_path);
        let table = read_table(device, &fstab_path)?;
        guards::check_table(&table, &fstab_path, self.config).map_err(|problem| {
            MountError::TableUnusable {
                device: device.to_string(),
                problem,
            }
        })?;
        let crypttab_path = self.config.staged(&self.config.crypttab_path);
        let crypt_entries =
            read_crypttab(&crypttab_path).map_err(|err| MountError::TableUnusable {
                device: device.to_string(),
                problem: TableProblem::Unreadable {
                    path: crypttab_path.clone(),
                    detail: format!("{err:#}"),
                },
            })?;
        let old_root = root_entries(&table)
            .first()
            .map(|e| e.spec.clone())
            .unwrap_or_default();

        let var = self.premount_var(device, &table, &old_root, ctx)?;

        let translator = MountTableTranslator::new(&*ctx.topology);
        let (mut translated, backward) = translator.translate(&table, &old_root, device);
        let crypt_entries: Vec<CryptEntry> = crypt_entries
            .into_iter()
            .map(|mut entry| {
                let topology = &*ctx.topology;
                entry.backing =
                    self.crypt_backing(&translator, topology, &entry.backing, &old_root, device);
                entry
            })
            .collect();
        if let Some(var) = &var {
            if let Some(entry) = translated.iter_mut().find(|e| e.mountpoint == "/var") {
                entry.spec = var.spec.clone();
            }
            self.release_temporary(var.baseline, ctx)?;
        }
        ctx.registry.remember_translations(backward);
        self.advance(MountStage::TableTranslated);

        check_root(device, &old_root, &translated, &*ctx.topology)?;

        let unstable = guards::unstable_device_names(&table);
        if !unstable.is_empty() {
            warn!("kernel device names in the mount table: {}", unstable.join(", "));
            ctx.decisions.notify(&Notice::UnstableDeviceNames(unstable));
        }
        if let Some(path) = guards::encrypted_home_config(&staging) {
            warn!("encrypted home directories configured in {}", path.display());
            ctx.decisions.notify(&Notice::EncryptedHome(path));
        }

        let mut unlocked = Vec::new();
        for entry in crypt_entries.iter().filter(|e| !e.is_noauto()) {
            match crypt::unlock(self.runner, &mut *ctx.decisions, entry) {
                UnlockResult::Unlocked => {
                    ctx.ledger.record(Activation::DecryptedVolume {
                        mapped_name: entry.name.clone(),
                    });
                    unlocked.push(entry.to_mount_entry());
                }
                UnlockResult::Cancelled => {}
                UnlockResult::Failed(detail) => ctx.decisions.notify(&Notice::MountSkipped {
                    mountpoint: entry.mountpoint.clone(),
                    detail,
                }),
            }
        }

        for entry in self.mount_plan(&translated, unlocked) {
            self.mount_auxiliary(entry, ctx)?;
        }
        self.advance(MountStage::AuxiliaryMounted);

        for entry in translated.iter().filter(|e| e.is_swap() && !e.is_noauto()) {
            self.activate_swap(entry, ctx);
        }

        self.publish_mountpoints(baseline, ctx);
        let label = snapshot_label();
        if let Err(err) = ctx.snapshot.create_pre_upgrade_snapshot(&label) {
            warn!("pre-upgrade snapshot failed: {err:#}");
            ctx.decisions
                .notify(&Notice::SnapshotFailed(format!("{err:#}")));
        }
        Ok(())
    }

    fn mount_root(
        &self,
        device: &DeviceId,
        staging: &Path,
        ctx: &mut MountContext<'_>,
    ) -> Result<(), MountError> {
        let failed = |detail: String| MountError::RootMountFailed {
            device: device.to_string(),
            mountpoint: staging.to_path_buf(),
            detail,
        };
        fs::create_dir_all(staging)
            .map_err(|err| failed(format!("creating '{}': {err}", staging.display())))?;
        let args = vec![device.to_string(), staging.to_string_lossy().into_owned()];
        match self.runner.run("mount", &args) {
            Ok(out) if out.success() => {}
            Ok(out) => return Err(failed(out.diagnostics())),
            Err(err) => return Err(failed(format!("{err:#}"))),
        }
        ctx.ledger.record(Activation::Mount {
            device: device.to_string(),
            mountpoint: staging.to_path_buf(),
        });
        Ok(())
    }

    /// Mount the declared `/var` before translation, so a wrong guess is
    /// caught while the user can still pick the device.
    fn premount_var(
        &self,
        root: &DeviceId,
        table: &[MountTableEntry],
        old_root: &str,
        ctx: &mut MountContext<'_>,
    ) -> Result<Option<TemporaryVar>, MountError> {
        let Some(var) = entry_for(table, "/var") else {
            return Ok(None);
        };
        if var.is_noauto() || !self.config.is_mountable(&var.fstype) {
            return Ok(None);
        }

        let baseline = ctx.ledger.len();
        let target = self.target_dir(&var.mountpoint);
        let mountable = |fstype: &str| self.config.is_mountable(fstype);
        let resolver = VarResolver {
            topology: &*ctx.topology,
            mountable: &mountable,
        };
        let mut try_mount = |spec: &str| {
            let mut candidate = var.clone();
            candidate.spec = spec.to_string();
            self.mount_entry(&candidate, &target)
        };
        let resolution =
            resolver.resolve(var, old_root, root, &mut *ctx.decisions, &mut try_mount)?;

        ctx.ledger.record(Activation::Mount {
            device: resolution.spec.clone(),
            mountpoint: target,
        });
        Ok(Some(TemporaryVar {
            spec: resolution.spec,
            baseline,
        }))
    }

    /// Where the host finds a volume's backing store. Container files live
    /// inside the target; devices follow the table's translation.
    fn crypt_backing(
        &self,
        translator: &MountTableTranslator<'_>,
        topology: &dyn StorageTopology,
        backing: &str,
        old_root: &str,
        root: &DeviceId,
    ) -> String {
        if !is_device_specifier(backing) {
            return self.target_dir(backing).display().to_string();
        }
        let translated = translator.translate_device(backing, old_root, root);
        topology
            .find_by_any_name(&translated)
            .map(|device| device.to_string())
            .unwrap_or(translated)
    }

    fn release_temporary(&self, keep: usize, ctx: &mut MountContext<'_>) -> Result<(), MountError> {
        let released = ctx.ledger.unwind(self.runner, Some(keep));
        if released.is_ok() && ctx.ledger.len() == keep {
            return Ok(());
        }
        let detail = ctx
            .ledger
            .warnings()
            .iter()
            .map(|w| w.detail.clone())
            .collect::<Vec<_>>()
            .join("; ");
        Err(MountError::AuxiliaryMountFailed {
            device: "/var".to_string(),
            mountpoint: self.target_dir("/var").display().to_string(),
            detail: format!("temporary mount could not be released: {detail}"),
        })
    }

    /// Entries to mount after the root: `/var` first, then table order,
    /// then unlocked volumes.
    fn mount_plan(
        &self,
        translated: &[MountTableEntry],
        unlocked: Vec<MountTableEntry>,
    ) -> Vec<MountTableEntry> {
        let covered: Vec<&str> = unlocked.iter().map(|e| e.mountpoint.as_str()).collect();
        let (var, rest): (Vec<MountTableEntry>, Vec<MountTableEntry>) = translated
            .iter()
            .filter(|e| {
                e.mountpoint != "/"
                    && !e.is_swap()
                    && !e.is_noauto()
                    && self.config.is_mountable(&e.fstype)
                    && !covered.contains(&e.mountpoint.as_str())
            })
            .cloned()
            .partition(|e| e.mountpoint == "/var");
        var.into_iter().chain(rest).chain(unlocked).collect()
    }

    fn mount_auxiliary(
        &self,
        mut entry: MountTableEntry,
        ctx: &mut MountContext<'_>,
    ) -> Result<(), MountError> {
        loop {
            let device = ctx
                .topology
                .find_by_any_name(&entry.spec)
                .unwrap_or_else(|| DeviceId::new(&entry.spec));
            let check = ctx.registry.fsck_gate_mut().check(
                self.runner,
                self.config,
                &mut *ctx.decisions,
                &device,
                &entry.fstype,
            );
            if !check.may_mount() {
                ctx.decisions.notify(&Notice::MountSkipped {
                    mountpoint: entry.mountpoint.clone(),
                    detail: format!("consistency check of {device} failed"),
                });
                return Ok(());
            }

            let target = self.target_dir(&entry.mountpoint);
            let detail = match self.mount_entry(&entry, &target) {
                Ok(()) => {
                    ctx.ledger.record(Activation::Mount {
                        device: entry.spec.clone(),
                        mountpoint: target,
                    });
                    if entry.mountpoint == "/boot" {
                        self.check_boot_size(&entry, &device, ctx)?;
                    }
                    return Ok(());
                }
                Err(detail) => detail,
            };

            warn!("mounting {} at {} failed: {detail}", entry.spec, entry.mountpoint);
            match ask_mount_failure(&mut *ctx.decisions, &entry, &detail) {
                MountFailureAction::Skip => {
                    ctx.decisions.notify(&Notice::MountSkipped {
                        mountpoint: entry.mountpoint.clone(),
                        detail,
                    });
                    return Ok(());
                }
                MountFailureAction::EditAndRetry => match ctx.decisions.edit_mount_entry(&entry) {
                    Some(edited) => entry = edited,
                    None => {
                        ctx.decisions.notify(&Notice::MountSkipped {
                            mountpoint: entry.mountpoint.clone(),
                            detail,
                        });
                        return Ok(());
                    }
                },
                MountFailureAction::Cancel => {
                    return Err(MountError::AuxiliaryMountFailed {
                        device: entry.spec,
                        mountpoint: entry.mountpoint,
                        detail,
                    })
                }
            }
        }
    }

    fn check_boot_size(
        &self,
        entry: &MountTableEntry,
        device: &DeviceId,
        ctx: &mut MountContext<'_>,
    ) -> Result<(), MountError> {
        let minimum = self.config.min_boot_size_bytes;
        let Some(size) = guards::device_size(
            self.runner,
            &*ctx.topology,
            ctx.registry.backward_names(),
            &entry.spec,
        ) else {
            warn!("size of /boot ({}) is unknown", entry.spec);
            return Ok(());
        };
        if size >= minimum {
            return Ok(());
        }

        let question = Question::ContinueWithSmallBoot {
            device: device.clone(),
            size_bytes: size,
            minimum_bytes: minimum,
        };
        if ctx.decisions.ask_yes_no(&question) {
            warn!("continuing with a {size} byte /boot");
            return Ok(());
        }
        Err(MountError::GuardRejected(format!(
            "/boot on {} has {} MiB, at least {} MiB are required",
            entry.spec,
            size / (1024 * 1024),
            minimum / (1024 * 1024)
        )))
    }

    fn activate_swap(&self, entry: &MountTableEntry, ctx: &mut MountContext<'_>) {
        let args = vec![entry.spec.clone()];
        let failure = match self.runner.run("swapon", &args) {
            Ok(out) if out.success() => None,
            Ok(out) => Some(out.diagnostics()),
            Err(err) => Some(format!("{err:#}")),
        };
        match failure {
            None => ctx.ledger.record(Activation::Swap {
                device: entry.spec.clone(),
            }),
            Some(detail) => {
                warn!("swapon {}: {detail}", entry.spec);
                ctx.decisions.notify(&Notice::SwapFailed {
                    device: entry.spec.clone(),
                    detail,
                });
            }
        }
    }

    /// Tell the storage model where each device now lives in the target.
    fn publish_mountpoints(&self, baseline: usize, ctx: &mut MountContext<'_>) {
        let staging = &self.config.staging_root;
        let mounted: Vec<(DeviceId, PathBuf)> = ctx.ledger.activations()[baseline..]
            .iter()
            .filter_map(|activation| match activation {
                Activation::Mount { device, mountpoint } => {
                    let relative = mountpoint.strip_prefix(staging).ok()?;
                    let dev = ctx
                        .topology
                        .find_by_any_name(device)
                        .unwrap_or_else(|| DeviceId::new(device));
                    Some((dev, Path::new("/").join(relative)))
                }
                _ => None,
            })
            .collect();
        for (device, mountpoint) in mounted {
            ctx.topology.set_mountpoint(&device, &mountpoint);
        }
    }

    fn target_dir(&self, mountpoint: &str) -> PathBuf {
        self.config.staging_root.join(mountpoint.trim_start_matches('/'))
    }

    fn mount_entry(&self, entry: &MountTableEntry, target: &Path) -> Result<(), String> {
        fs::create_dir_all(target)
            .map_err(|err| format!("creating '{}': {err}", target.display()))?;
        let args = vec![
            "-t".to_string(),
            entry.fstype.clone(),
            "-o".to_string(),
            entry.options_arg(),
            entry.spec.clone(),
            target.to_string_lossy().into_owned(),
        ];
        match self.runner.run("mount", &args) {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(out.diagnostics()),
            Err(err) => Err(format!("{err:#}")),
        }
    }
}

struct TemporaryVar {
    spec: String,
    /// Ledger length before the temporary mount.
    baseline: usize,
}

fn fstype_of(topology: &dyn StorageTopology, device: &DeviceId) -> Option<String> {
    topology
        .probed_filesystems()
        .ok()?
        .into_iter()
        .find(|c| &c.device == device)
        .map(|c| c.fstype)
}

fn read_table(device: &DeviceId, path: &Path) -> Result<Vec<MountTableEntry>, MountError> {
    let unusable = |problem| MountError::TableUnusable {
        device: device.to_string(),
        problem,
    };
    if !path.is_file() {
        return Err(unusable(TableProblem::Missing(path.to_path_buf())));
    }
    read_fstab(path).map_err(|err| {
        unusable(TableProblem::Unreadable {
            path: path.to_path_buf(),
            detail: format!("{err:#}"),
        })
    })
}

/// The translated root entry must name the device that is mounted.
fn check_root(
    device: &DeviceId,
    declared: &str,
    translated: &[MountTableEntry],
    topology: &dyn StorageTopology,
) -> Result<(), MountError> {
    let spec = root_entries(translated)
        .first()
        .map(|e| e.spec.as_str())
        .unwrap_or_default();
    let matches = spec == device.to_string()
        || topology.find_by_any_name(spec).as_ref() == Some(device);
    if matches {
        return Ok(());
    }
    Err(MountError::TableUnusable {
        device: device.to_string(),
        problem: TableProblem::RootMismatch {
            declared: declared.to_string(),
            mounted: device.to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandOutput;
    use crate::storage::LsblkTopology;
    use crate::testing::{
        stage_system, ScriptedDecisions, ScriptedRunner, ONE_DISK_LSBLK, THREE_DISK_LSBLK,
        TWO_DISK_LSBLK,
    };
    use anyhow::bail;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSnapshot {
        labels: Vec<String>,
        fail: bool,
    }

    impl SnapshotHook for RecordingSnapshot {
        fn create_pre_upgrade_snapshot(&mut self, label: &str) -> anyhow::Result<()> {
            if self.fail {
                bail!("snapper is not installed");
            }
            self.labels.push(label.to_string());
            Ok(())
        }
    }

    struct Harness {
        temp: TempDir,
        config: UpgradeConfig,
        runner: ScriptedRunner,
        topo: LsblkTopology,
        registry: RootPartitionRegistry,
        ledger: ActivationLedger,
        snapshot: RecordingSnapshot,
        stage: MountStage,
    }

    impl Harness {
        fn new(lsblk: &str, fstab: &str) -> Self {
            let temp = TempDir::new().unwrap();
            stage_system(temp.path(), fstab);
            let config = UpgradeConfig {
                staging_root: temp.path().to_path_buf(),
                ..UpgradeConfig::default()
            };
            let ledger = ActivationLedger::new(temp.path());
            Self {
                temp,
                config,
                runner: ScriptedRunner::new(),
                topo: LsblkTopology::from_json(lsblk).unwrap(),
                registry: RootPartitionRegistry::new(),
                ledger,
                snapshot: RecordingSnapshot::default(),
                stage: MountStage::NotStarted,
            }
        }

        fn mount(&mut self, dev: &str, port: &mut ScriptedDecisions) -> Result<(), MountError> {
            let mut orchestrator = MountOrchestrator::new(&self.runner, &self.config);
            let mut ctx = MountContext {
                registry: &mut self.registry,
                ledger: &mut self.ledger,
                topology: &mut self.topo,
                decisions: port,
                snapshot: &mut self.snapshot,
            };
            let result = orchestrator.mount(&DeviceId::new(dev), &mut ctx);
            self.stage = orchestrator.stage();
            result
        }

        fn root(&self) -> String {
            self.temp.path().display().to_string()
        }

        /// Target of every `mount`, relative to the staging root.
        fn mount_targets(&self) -> Vec<String> {
            self.runner
                .calls()
                .into_iter()
                .filter(|c| c.program == "mount")
                .filter_map(|c| c.args.last().cloned())
                .map(|t| match t.strip_prefix(&self.root()) {
                    Some("") => "/".to_string(),
                    Some(rest) => rest.to_string(),
                    None => t,
                })
                .collect()
        }

        fn staged(&self, rel: &str) -> PathBuf {
            self.temp.path().join(rel)
        }
    }

    fn fail_on(device: &'static str) -> impl Fn(&[String]) -> CommandOutput {
        move |args| {
            if args.iter().any(|a| a == device) {
                CommandOutput {
                    exit_code: 32,
                    stdout: String::new(),
                    stderr: format!("mount: {device}: can't read superblock"),
                }
            } else {
                CommandOutput::default()
            }
        }
    }

    #[test]
    fn test_same_disk_var_and_mount_order() {
        let mut h = Harness::new(
            ONE_DISK_LSBLK,
            "/dev/hda2 / ext4 acl 1 1\n\
             /dev/hda1 /boot ext4 defaults 1 2\n\
             /dev/hda3 /var xfs defaults 1 2\n\
             LABEL=home /home ext4 defaults 1 2\n\
             /dev/hda4 swap swap defaults 0 0\n\
             proc /proc proc defaults 0 0\n",
        );
        h.config.min_boot_size_bytes = 10 * 1024 * 1024;
        let mut port = ScriptedDecisions::new();

        h.mount("/dev/sda2", &mut port).unwrap();

        assert_eq!(h.mount_targets(), vec!["/", "/var", "/var", "/boot", "/home"]);
        assert_eq!(
            h.ledger.activations(),
            &[
                Activation::Mount {
                    device: "/dev/sda2".into(),
                    mountpoint: h.temp.path().to_path_buf(),
                },
                Activation::Mount {
                    device: "/dev/sda3".into(),
                    mountpoint: h.staged("var"),
                },
                Activation::Mount {
                    device: "/dev/sda1".into(),
                    mountpoint: h.staged("boot"),
                },
                Activation::Mount {
                    device: "LABEL=home".into(),
                    mountpoint: h.staged("home"),
                },
                Activation::Swap {
                    device: "/dev/sda4".into(),
                },
            ]
        );
        assert!(h
            .runner
            .commands()
            .contains(&format!("umount {}/var", h.root())));
        assert_eq!(h.registry.backward_names().get("/dev/sda3"), Some("/dev/hda3"));
        assert_eq!(
            h.topo.mountpoint_of(&DeviceId::new("/dev/sda5")),
            Some(Path::new("/home"))
        );
        assert_eq!(
            h.topo.mountpoint_of(&DeviceId::new("/dev/sda2")),
            Some(Path::new("/"))
        );
        assert!(matches!(
            port.notices(),
            [Notice::UnstableDeviceNames(names)] if names.len() == 4
        ));
        assert_eq!(h.snapshot.labels.len(), 1);
        assert_eq!(h.stage, MountStage::Recorded);
        assert!(h.registry.is_mount_active(&h.ledger));
    }

    #[test]
    fn test_second_mount_is_a_no_op() {
        let mut h = Harness::new(ONE_DISK_LSBLK, "UUID=root-uuid / ext4 defaults 1 1\n");
        let mut port = ScriptedDecisions::new();
        h.mount("/dev/sda2", &mut port).unwrap();
        let calls = h.runner.calls().len();

        h.mount("/dev/sda2", &mut port).unwrap();
        assert_eq!(h.runner.calls().len(), calls);
        assert_eq!(h.snapshot.labels.len(), 1);

        assert!(matches!(
            h.mount("/dev/sda3", &mut port),
            Err(MountError::GuardRejected(_))
        ));
        assert_eq!(h.runner.calls().len(), calls);
    }

    #[test]
    fn test_legacy_filesystem_rejects_table() {
        let mut h = Harness::new(
            ONE_DISK_LSBLK,
            "UUID=root-uuid / ext4 defaults 1 1\n\
             /dev/sda5 /home reiserfs defaults 1 2\n",
        );
        let mut port = ScriptedDecisions::new();

        let err = h.mount("/dev/sda2", &mut port).unwrap_err();
        assert_eq!(
            err,
            MountError::TableUnusable {
                device: "/dev/sda2".into(),
                problem: TableProblem::LegacyFilesystems(vec![(
                    "/home".into(),
                    "reiserfs".into()
                )]),
            }
        );
        assert!(err.to_string().contains("/home (reiserfs)"));
        assert_eq!(h.mount_targets(), vec!["/"]);
        assert!(h.ledger.is_empty());

        let calls = h.runner.calls().len();
        assert_eq!(h.mount("/dev/sda2", &mut port), Err(err));
        assert_eq!(h.runner.calls().len(), calls);
    }

    #[test]
    fn test_small_boot_cancel_unwinds() {
        let mut h = Harness::new(
            ONE_DISK_LSBLK,
            "UUID=root-uuid / ext4 defaults 1 1\n\
             LABEL=boot /boot ext4 defaults 1 2\n\
             UUID=home-uuid /home ext4 defaults 1 2\n",
        );
        let mut port = ScriptedDecisions::new().yes_no([false]);

        let err = h.mount("/dev/sda2", &mut port).unwrap_err();
        assert!(matches!(err, MountError::GuardRejected(ref msg) if msg.contains("50 MiB")));
        assert!(h.ledger.is_empty());
        assert_eq!(h.mount_targets(), vec!["/", "/boot"]);
        let umounts: Vec<String> = h
            .runner
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("umount"))
            .collect();
        assert_eq!(
            umounts,
            vec![format!("umount {}/boot", h.root()), format!("umount {}", h.root())]
        );
        assert_eq!(h.stage, MountStage::NotStarted);

        // Not terminal: answering "continue" on the retry mounts everything.
        let mut port = ScriptedDecisions::new().yes_no([true]);
        h.mount("/dev/sda2", &mut port).unwrap();
        assert_eq!(h.ledger.len(), 3);
    }

    #[test]
    fn test_two_disk_var_without_prompt() {
        let mut h = Harness::new(
            TWO_DISK_LSBLK,
            "/dev/hda2 / ext4 defaults 1 1\n/dev/hdb1 /var xfs defaults 1 2\n",
        );
        let mut port = ScriptedDecisions::new();
        h.mount("/dev/sda2", &mut port).unwrap();

        assert!(port.prompts().is_empty());
        assert_eq!(
            h.ledger.activations()[1],
            Activation::Mount {
                device: "/dev/sdb1".into(),
                mountpoint: h.staged("var"),
            }
        );
    }

    #[test]
    fn test_three_disk_var_is_rejected() {
        let mut h = Harness::new(
            THREE_DISK_LSBLK,
            "/dev/hda1 / ext4 defaults 1 1\n/dev/hdb1 /var xfs defaults 1 2\n",
        );
        let mut port = ScriptedDecisions::new();
        let err = h.mount("/dev/sda1", &mut port).unwrap_err();
        assert!(matches!(err, MountError::GuardRejected(_)));
        assert!(port.prompts().is_empty());
        assert!(h.ledger.is_empty());
    }

    #[test]
    fn test_crypto_volume_and_skipped_mount() {
        let mut h = Harness::new(
            ONE_DISK_LSBLK,
            "UUID=root-uuid / ext4 defaults 1 1\n\
             UUID=var-uuid /var xfs defaults 1 2\n\
             /dev/sdb9 /data ext4 defaults 1 2\n",
        );
        fs::write(h.staged("etc/cryptotab"), "cr_home /dev/sda5 /home ext4 acl\n").unwrap();
        h.runner.on("mount", fail_on("/dev/sdb9"));
        let mut port = ScriptedDecisions::new()
            .secrets([Some("secret")])
            .choices([Some(0)]);

        h.mount("/dev/sda2", &mut port).unwrap();

        assert_eq!(
            h.ledger.activations()[1..],
            [
                Activation::DecryptedVolume {
                    mapped_name: "cr_home".into(),
                },
                Activation::Mount {
                    device: "UUID=var-uuid".into(),
                    mountpoint: h.staged("var"),
                },
                Activation::Mount {
                    device: "/dev/mapper/cr_home".into(),
                    mountpoint: h.staged("home"),
                },
            ]
        );
        assert!(port
            .notices()
            .iter()
            .any(|n| matches!(n, Notice::MountSkipped { mountpoint, .. } if mountpoint == "/data")));

        let before = h.runner.calls().len();
        h.ledger.unwind(&h.runner, None).unwrap();
        let undo: Vec<String> = h.runner.commands()[before..].to_vec();
        assert_eq!(
            undo,
            vec![
                format!("umount {}/home", h.root()),
                format!("umount {}/var", h.root()),
                "cryptsetup close cr_home".to_string(),
                format!("umount {}", h.root()),
            ]
        );
    }

    #[test]
    fn test_cancel_after_failed_mount() {
        let mut h = Harness::new(
            ONE_DISK_LSBLK,
            "UUID=root-uuid / ext4 defaults 1 1\n/dev/sdb9 /data ext4 defaults 1 2\n",
        );
        h.runner.on("mount", fail_on("/dev/sdb9"));
        let mut port = ScriptedDecisions::new().choices([Some(2)]);

        let err = h.mount("/dev/sda2", &mut port).unwrap_err();
        assert!(matches!(
            &err,
            MountError::AuxiliaryMountFailed { mountpoint, detail, .. }
                if mountpoint == "/data" && detail.contains("can't read superblock")
        ));
        assert!(!err.is_terminal());
        assert!(h.ledger.is_empty());
    }

    #[test]
    fn test_edit_and_retry() {
        let mut h = Harness::new(
            ONE_DISK_LSBLK,
            "UUID=root-uuid / ext4 defaults 1 1\n/dev/sdb9 /data ext4 defaults 1 2\n",
        );
        h.runner.on("mount", fail_on("/dev/sdb9"));
        let edited = MountTableEntry::new("/dev/sda5", "/data", "ext4", "ro");
        let mut port = ScriptedDecisions::new()
            .choices([Some(1)])
            .edits([Some(edited)]);

        h.mount("/dev/sda2", &mut port).unwrap();
        assert_eq!(
            h.ledger.activations()[1],
            Activation::Mount {
                device: "/dev/sda5".into(),
                mountpoint: h.staged("data"),
            }
        );
    }

    #[test]
    fn test_root_mount_failure_is_terminal() {
        let mut h = Harness::new(ONE_DISK_LSBLK, "UUID=root-uuid / ext4 defaults 1 1\n");
        h.runner.on("mount", fail_on("/dev/sda2"));
        let mut port = ScriptedDecisions::new();

        let err = h.mount("/dev/sda2", &mut port).unwrap_err();
        assert!(matches!(err, MountError::RootMountFailed { .. }));
        assert!(err.is_terminal());
        assert_eq!(h.runner.count("umount"), 0);
        assert!(matches!(
            h.registry.mount_outcome(),
            Some(MountOutcome::Failed { .. })
        ));
    }

    #[test]
    fn test_root_mismatch_and_failed_unwind_reported() {
        let mut h = Harness::new(ONE_DISK_LSBLK, "UUID=home-uuid / ext4 defaults 1 1\n");
        h.runner.on("umount", |_| CommandOutput {
            exit_code: 32,
            stdout: String::new(),
            stderr: "target is busy".into(),
        });
        let mut port = ScriptedDecisions::new();

        let err = h.mount("/dev/sda2", &mut port).unwrap_err();
        assert!(matches!(
            err,
            MountError::TableUnusable {
                problem: TableProblem::RootMismatch { .. },
                ..
            }
        ));
        assert_eq!(h.ledger.len(), 1);
        assert!(port
            .notices()
            .iter()
            .any(|n| matches!(n, Notice::Unwind(w) if w.detail.contains("busy"))));
        let in_use = port
            .notices()
            .iter()
            .find(|n| matches!(n, Notice::RootInUse(_)))
            .unwrap();
        assert!(in_use.to_string().contains("unmount it manually"));
    }

    #[test]
    fn test_swap_and_snapshot_failures_are_not_fatal() {
        let mut h = Harness::new(
            ONE_DISK_LSBLK,
            "UUID=root-uuid / ext4 defaults 1 1\nUUID=swap-uuid swap swap defaults 0 0\n",
        );
        h.runner.on("swapon", |_| CommandOutput::with_code(255));
        h.snapshot.fail = true;
        let mut port = ScriptedDecisions::new();

        h.mount("/dev/sda2", &mut port).unwrap();
        assert_eq!(h.ledger.len(), 1);
        assert!(port
            .notices()
            .iter()
            .any(|n| matches!(n, Notice::SwapFailed { .. })));
        assert!(port
            .notices()
            .iter()
            .any(|n| matches!(n, Notice::SnapshotFailed(_))));
    }

    #[test]
    fn test_invalid_verdict_is_rejected_without_side_effects() {
        let mut h = Harness::new(ONE_DISK_LSBLK, "UUID=root-uuid / ext4 defaults 1 1\n");
        h.registry.store_verdict(crate::validate::CandidateVerdict {
            device: DeviceId::new("/dev/sda2"),
            valid: false,
            arch_valid: false,
            product: "unknown".into(),
            arch: "ppc64le".into(),
            label: String::new(),
            fs_type: "Ext4".into(),
            rejections: vec![crate::validate::Rejection::ArchitectureMismatch {
                installed: "ppc64le".into(),
                running: "x86_64".into(),
            }],
        });
        let mut port = ScriptedDecisions::new();
        let err = h.mount("/dev/sda2", &mut port).unwrap_err();
        assert!(matches!(err, MountError::ValidationRejected { .. }));
        assert!(h.runner.calls().is_empty());
    }

    fn verdict(device: &str, valid: bool) -> crate::validate::CandidateVerdict {
        crate::validate::CandidateVerdict {
            device: DeviceId::new(device),
            valid,
            arch_valid: true,
            product: "openSUSE Leap 15.5".into(),
            arch: "x86_64".into(),
            label: "root".into(),
            fs_type: "Ext4".into(),
            rejections: Vec::new(),
        }
    }

    #[test]
    fn test_unvalidated_device_rejected_after_scan() {
        let mut h = Harness::new(ONE_DISK_LSBLK, "UUID=root-uuid / ext4 defaults 1 1\n");
        fs::write(h.staged(".installation-incomplete"), "").unwrap();
        h.registry.mark_scanned();
        let mut port = ScriptedDecisions::new();

        let err = h.mount("/dev/sda2", &mut port).unwrap_err();
        assert!(matches!(
            &err,
            MountError::ValidationRejected { device, reason }
                if device == "/dev/sda2" && reason.contains("not among")
        ));
        assert!(h.runner.calls().is_empty());
        assert!(h.ledger.is_empty());

        let mut h = Harness::new(ONE_DISK_LSBLK, "UUID=root-uuid / ext4 defaults 1 1\n");
        h.registry.mark_scanned();
        h.registry.store_verdict(verdict("/dev/sda2", true));
        h.mount("/dev/sda2", &mut port).unwrap();
        assert_eq!(h.ledger.len(), 1);
    }

    #[test]
    fn test_crypto_backing_resolved_for_the_target() {
        let mut h = Harness::new(ONE_DISK_LSBLK, "/dev/hda2 / ext4 defaults 1 1\n");
        fs::write(
            h.staged("etc/cryptotab"),
            "cr_home /home/.crypt /home ext4 acl\n\
             cr_data /dev/hda5 /data ext4 defaults\n",
        )
        .unwrap();
        let mut port = ScriptedDecisions::new().secrets([Some("one"), Some("two")]);

        h.mount("/dev/sda2", &mut port).unwrap();

        let opens: Vec<String> = h
            .runner
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("cryptsetup"))
            .collect();
        assert_eq!(
            opens,
            vec![
                format!("cryptsetup open {}/home/.crypt cr_home --key-file=-", h.root()),
                "cryptsetup open /dev/sda5 cr_data --key-file=-".to_string(),
            ]
        );
        assert_eq!(h.mount_targets(), vec!["/", "/home", "/data"]);
    }

    fn failing_fsck(_: &[String]) -> CommandOutput {
        CommandOutput {
            exit_code: 4,
            stdout: "/dev/sda5: Inode 12 has illegal blocks.".into(),
            stderr: String::new(),
        }
    }

    #[test]
    fn test_failed_check_continue_mounts_and_is_not_repeated() {
        let mut h = Harness::new(
            ONE_DISK_LSBLK,
            "UUID=root-uuid / ext4 defaults 1 1\n\
             /dev/sda5 /home ext3 defaults 1 2\n\
             LABEL=home /srv ext3 defaults 1 2\n",
        );
        h.runner.on("fsck.ext3", failing_fsck);
        let mut port = ScriptedDecisions::new().yes_no([true]);

        h.mount("/dev/sda2", &mut port).unwrap();

        assert_eq!(h.mount_targets(), vec!["/", "/home", "/srv"]);
        assert_eq!(h.runner.count("fsck.ext3"), 1);
        assert_eq!(h.runner.commands()[1], "fsck.ext3 -n /dev/sda5");
        assert_eq!(port.prompts().len(), 1);
        assert!(port.prompts()[0].contains("illegal blocks"));
    }

    #[test]
    fn test_failed_check_skip_leaves_mount_out() {
        let mut h = Harness::new(
            ONE_DISK_LSBLK,
            "UUID=root-uuid / ext4 defaults 1 1\n/dev/sda5 /home ext3 defaults 1 2\n",
        );
        h.runner.on("fsck.ext3", failing_fsck);
        let mut port = ScriptedDecisions::new().yes_no([false]);

        h.mount("/dev/sda2", &mut port).unwrap();

        assert_eq!(h.mount_targets(), vec!["/"]);
        assert_eq!(h.runner.count("fsck.ext3"), 1);
        assert!(port.notices().iter().any(|n| matches!(
            n,
            Notice::MountSkipped { mountpoint, detail }
                if mountpoint == "/home" && detail.contains("consistency check")
        )));
    }

    #[test]
    fn test_root_check_not_repeated_on_retry() {
        let mut h = Harness::new(
            ONE_DISK_LSBLK,
            "UUID=root-uuid / ext4 defaults 1 1\n/dev/sdb9 /data xfs defaults 1 2\n",
        );
        h.config.fsck_filesystems = vec!["ext4".to_string()];
        h.runner.on("mount", fail_on("/dev/sdb9"));

        let mut cancel = ScriptedDecisions::new().choices([Some(2)]);
        assert!(h.mount("/dev/sda2", &mut cancel).is_err());
        assert_eq!(h.runner.commands()[0], "fsck.ext4 -n /dev/sda2");

        let mut skip = ScriptedDecisions::new().choices([Some(0)]);
        h.mount("/dev/sda2", &mut skip).unwrap();
        assert_eq!(h.runner.count("fsck.ext4"), 1);
    }
}
