//! The human in the loop.
//!
//! Every point where the engine needs a decision (continue after a failed
//! check, pick a device, enter a passphrase) is a blocking call on
//! [`DecisionPort`]. The engine's control flow is a finite loop over the
//! answers; how they are presented is up to the implementation.

use crate::fstab::MountTableEntry;
use crate::error::UnwindError;
use crate::ledger::UnwindWarning;
use crate::storage::DeviceId;
use std::fmt;
use std::path::PathBuf;
use zeroize::Zeroizing;

/// Yes/no questions the engine may ask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Question {
    /// The read-only consistency check reported problems.
    ContinueAfterFailedCheck { device: DeviceId, output: String },
    /// `/boot` is smaller than the configured minimum.
    ContinueWithSmallBoot {
        device: DeviceId,
        size_bytes: u64,
        minimum_bytes: u64,
    },
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Question::ContinueAfterFailedCheck { device, output } => write!(
                f,
                "The consistency check of {device} found errors:\n{output}\n\
                 Continue without repairing the file system?"
            ),
            Question::ContinueWithSmallBoot {
                device,
                size_bytes,
                minimum_bytes,
            } => write!(
                f,
                "The /boot partition {device} has {} MiB, less than the {} MiB \
                 the new kernel needs. Continue anyway?",
                size_bytes / (1024 * 1024),
                minimum_bytes / (1024 * 1024)
            ),
        }
    }
}

/// Non-fatal, user-visible information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The mount table names real disks by kernel name.
    UnstableDeviceNames(Vec<String>),
    /// Encrypted home directories through PAM are configured.
    EncryptedHome(PathBuf),
    MountSkipped { mountpoint: String, detail: String },
    SwapFailed { device: String, detail: String },
    SnapshotFailed(String),
    Unwind(UnwindWarning),
    /// The staging root is still mounted after an automatic unwind.
    RootInUse(UnwindError),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::UnstableDeviceNames(specs) => write!(
                f,
                "The mount table uses kernel device names that may change \
                 between boots: {}. Use UUID= or LABEL= entries instead.",
                specs.join(", ")
            ),
            Notice::EncryptedHome(path) => write!(
                f,
                "Encrypted home directories are configured in {}. They are \
                 not supported after the upgrade; decrypt them first.",
                path.display()
            ),
            Notice::MountSkipped { mountpoint, detail } => {
                write!(f, "{mountpoint} was not mounted: {detail}")
            }
            Notice::SwapFailed { device, detail } => {
                write!(f, "Swap on {device} could not be activated: {detail}")
            }
            Notice::SnapshotFailed(detail) => {
                write!(f, "The pre-upgrade snapshot could not be created: {detail}")
            }
            Notice::Unwind(warning) => write!(f, "{warning}"),
            Notice::RootInUse(error) => write!(f, "{error}"),
        }
    }
}

/// Decision-port collaborator.
pub trait DecisionPort {
    fn ask_yes_no(&mut self, question: &Question) -> bool;

    /// Index into `options`, or `None` when the user cancels.
    fn ask_choice(&mut self, prompt: &str, options: &[String]) -> Option<usize>;

    /// `None` or an empty string both mean cancel. The secret is wiped
    /// when the returned value is dropped.
    fn ask_secret(&mut self, prompt: &str) -> Option<Zeroizing<String>>;

    /// Let the user correct a mount entry; `None` keeps nothing.
    fn edit_mount_entry(&mut self, entry: &MountTableEntry) -> Option<MountTableEntry>;

    fn notify(&mut self, notice: &Notice);
}

/// Answer to a failed auxiliary mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountFailureAction {
    Skip,
    EditAndRetry,
    Cancel,
}

const MOUNT_FAILURE_OPTIONS: [(&str, MountFailureAction); 3] = [
    ("Continue without this mount", MountFailureAction::Skip),
    (
        "Specify different mount parameters",
        MountFailureAction::EditAndRetry,
    ),
    ("Cancel the upgrade", MountFailureAction::Cancel),
];

pub fn ask_mount_failure(
    port: &mut dyn DecisionPort,
    entry: &MountTableEntry,
    detail: &str,
) -> MountFailureAction {
    let prompt = format!(
        "Mounting {} at {} failed:\n{}",
        entry.spec, entry.mountpoint, detail
    );
    let options: Vec<String> = MOUNT_FAILURE_OPTIONS
        .iter()
        .map(|(label, _)| label.to_string())
        .collect();
    port.ask_choice(&prompt, &options)
        .and_then(|idx| MOUNT_FAILURE_OPTIONS.get(idx))
        .map(|(_, action)| *action)
        .unwrap_or(MountFailureAction::Cancel)
}
