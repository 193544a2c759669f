//! Ordered record of every reversible side effect of a mount attempt.
//!
//! Activations are appended as they succeed and undone in strict reverse
//! order: a mount under another mount, or a mount backed by a decrypted
//! volume, must go before the thing it depends on.

use crate::error::UnwindError;
use crate::process::ProcessRunner;
use anyhow::{Context, Result};
use fs2::FileExt;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Activation {
    Mount { device: String, mountpoint: PathBuf },
    Swap { device: String },
    DecryptedVolume { mapped_name: String },
}

impl Activation {
    /// The command that undoes this activation.
    fn reversal(&self) -> (&'static str, Vec<String>) {
        match self {
            Activation::Mount { mountpoint, .. } => {
                ("umount", vec![mountpoint.to_string_lossy().into_owned()])
            }
            Activation::Swap { device } => ("swapoff", vec![device.clone()]),
            Activation::DecryptedVolume { mapped_name } => {
                ("cryptsetup", vec!["close".to_string(), mapped_name.clone()])
            }
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activation::Mount { device, mountpoint } => {
                write!(f, "mount of {} at {}", device, mountpoint.display())
            }
            Activation::Swap { device } => write!(f, "swap on {device}"),
            Activation::DecryptedVolume { mapped_name } => {
                write!(f, "decrypted volume {mapped_name}")
            }
        }
    }
}

/// A reversal step that failed. The activation stays in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnwindWarning {
    pub activation: Activation,
    pub detail: String,
}

impl fmt::Display for UnwindWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "could not undo {}: {} (data loss is possible if the system is switched off now)",
            self.activation, self.detail
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationLedger {
    root: PathBuf,
    activations: Vec<Activation>,
    #[serde(default)]
    warnings: Vec<UnwindWarning>,
}

impl ActivationLedger {
    /// Ledger for mounts under `root`. Unmounting `root` itself is the one
    /// reversal whose failure is an error.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            activations: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn record(&mut self, activation: Activation) {
        info!("activated: {activation}");
        self.activations.push(activation);
    }

    pub fn activations(&self) -> &[Activation] {
        &self.activations
    }

    pub fn len(&self) -> usize {
        self.activations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }

    /// Failures from the most recent unwind.
    pub fn warnings(&self) -> &[UnwindWarning] {
        &self.warnings
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Undo activations newest first, keeping the oldest `keep` entries
    /// (all of them are undone when `keep` is `None`).
    ///
    /// Every step is attempted even if an earlier one failed. Failed steps
    /// stay in the ledger and are reported through [`Self::warnings`];
    /// only a failed unmount of the root is returned as an error.
    pub fn unwind(
        &mut self,
        runner: &dyn ProcessRunner,
        keep: Option<usize>,
    ) -> Result<(), UnwindError> {
        let keep = keep.unwrap_or(0).min(self.activations.len());
        let pending = self.activations.split_off(keep);
        self.warnings.clear();

        let mut residual = Vec::new();
        let mut root_error = None;
        for activation in pending.into_iter().rev() {
            let (program, args) = activation.reversal();
            let failure = match runner.run(program, &args) {
                Ok(out) if out.success() => None,
                Ok(out) => Some(out.diagnostics()),
                Err(err) => Some(format!("{err:#}")),
            };
            let Some(detail) = failure else {
                info!("undone: {activation}");
                continue;
            };

            if self.is_root_mount(&activation) && root_error.is_none() {
                warn!("root {} is still mounted: {detail}", self.root.display());
                root_error = Some(UnwindError::RootInUse {
                    mountpoint: self.root.clone(),
                    detail: detail.clone(),
                });
            } else {
                warn!("could not undo {activation}: {detail}");
            }
            self.warnings.push(UnwindWarning {
                activation: activation.clone(),
                detail,
            });
            residual.push(activation);
        }

        residual.reverse();
        self.activations.extend(residual);
        match root_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn is_root_mount(&self, activation: &Activation) -> bool {
        matches!(activation, Activation::Mount { mountpoint, .. } if *mountpoint == self.root)
    }

    /// Persist the ledger so a later process can unwind it.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating state directory '{}'", parent.display()))?;
        }
        let _lock = lock_state(path)?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(self).context("serializing activation ledger")?;
        fs::write(&tmp, bytes)
            .with_context(|| format!("writing activation ledger '{}'", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("replacing activation ledger '{}'", path.display()))?;
        Ok(())
    }

    /// Load a persisted ledger; `None` when nothing was saved.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading activation ledger '{}'", path.display()))
            }
        };
        let ledger = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing activation ledger '{}'", path.display()))?;
        Ok(Some(ledger))
    }

    /// Drop the persisted copy once nothing is left to undo.
    pub fn clear_saved(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("removing activation ledger '{}'", path.display())),
        }
    }
}

/// Exclusive lock next to the state file, held while it is rewritten.
fn lock_state(path: &Path) -> Result<File> {
    let lock_path = path.with_extension("lock");
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;
    if file.try_lock_exclusive().is_err() {
        return Err(anyhow::anyhow!(
            "Activation ledger is locked by another process: {}",
            lock_path.display()
        ));
    }
    Ok(file)
}
