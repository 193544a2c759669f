//! Error taxonomy of the mount engine.
//!
//! Validation problems never surface here: they are recorded in a
//! [`crate::validate::CandidateVerdict`] and only exclude a candidate.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Why a mount table cannot be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableProblem {
    Missing(PathBuf),
    Unreadable { path: PathBuf, detail: String },
    Empty(PathBuf),
    RootEntryCount(usize),
    RootMismatch { declared: String, mounted: String },
    /// (mount point, filesystem type) pairs.
    LegacyFilesystems(Vec<(String, String)>),
}

impl fmt::Display for TableProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableProblem::Missing(path) => write!(f, "{} does not exist", path.display()),
            TableProblem::Unreadable { path, detail } => {
                write!(f, "{} cannot be read: {}", path.display(), detail)
            }
            TableProblem::Empty(path) => write!(f, "{} has no entries", path.display()),
            TableProblem::RootEntryCount(n) => {
                write!(f, "expected exactly one entry for '/', found {n}")
            }
            TableProblem::RootMismatch { declared, mounted } => write!(
                f,
                "root entry '{declared}' does not match the mounted device {mounted}"
            ),
            TableProblem::LegacyFilesystems(found) => {
                let list = found
                    .iter()
                    .map(|(mp, fstype)| format!("{mp} ({fstype})"))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "file systems no longer supported: {list}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MountError {
    #[error("{device} is not a usable upgrade target: {reason}")]
    ValidationRejected { device: String, reason: String },

    #[error("could not mount {device} at {mountpoint}: {detail}")]
    RootMountFailed {
        device: String,
        mountpoint: PathBuf,
        detail: String,
    },

    #[error("mount table of {device} is unusable: {problem}")]
    TableUnusable { device: String, problem: TableProblem },

    #[error("could not mount {device} at {mountpoint}: {detail}")]
    AuxiliaryMountFailed {
        device: String,
        mountpoint: String,
        detail: String,
    },

    #[error("upgrade stopped: {0}")]
    GuardRejected(String),
}

impl MountError {
    /// Terminal failures will fail the same way again for this candidate;
    /// the caller has to pick another one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MountError::ValidationRejected { .. }
                | MountError::RootMountFailed { .. }
                | MountError::TableUnusable { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnwindError {
    #[error(
        "could not unmount {}: it is in use ({detail}). Restart the system or unmount it manually.",
        mountpoint.display()
    )]
    RootInUse { mountpoint: PathBuf, detail: String },
}
