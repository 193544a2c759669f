//! Find, validate and mount an existing Linux installation for an in-place
//! upgrade.
//!
//! The engine scans block devices for file systems, classifies each one as
//! an upgrade target, and mounts the selected system together with its
//! auxiliary file systems, encrypted volumes and swap under a staging root.
//! Every side effect is recorded so it can be undone in reverse order.
//!
//! # Architecture
//!
//! ```text
//! DeviceProbe ──▶ CandidateValidator ──▶ RootPartitionRegistry
//!                                              │ select
//!                                              ▼
//!                 MountTableTranslator ◀── MountOrchestrator ──▶ ActivationLedger
//! ```
//!
//! Everything outside the engine is a collaborator trait:
//!
//! - [`storage::StorageTopology`] - the probed block devices ([`storage::LsblkTopology`])
//! - [`process::ProcessRunner`] - mount, umount, swapon, cryptsetup, fsck
//! - [`decision::DecisionPort`] - questions for the user
//! - [`hooks::SupportPolicy`] and [`hooks::SnapshotHook`]
//!
//! # Example
//!
//! ```rust,ignore
//! use upgrade_root::{
//!     discovery::auto_select, ActivationLedger, CandidateValidator, DeviceProbe,
//!     MountContext, MountOrchestrator, ProductAllowList, RootDiscovery,
//!     RootPartitionRegistry, SystemRunner, LsblkTopology, UpgradeConfig, NoSnapshot,
//! };
//!
//! let config = UpgradeConfig::default();
//! let runner = SystemRunner;
//! let mut topology = LsblkTopology::probe(&runner)?;
//! let policy = ProductAllowList::new(config.supported_products.clone());
//! let mut registry = RootPartitionRegistry::new();
//!
//! let discovery = RootDiscovery::new(
//!     DeviceProbe::new(&topology, &config),
//!     CandidateValidator::new(&runner, &topology, &policy, &config),
//! );
//! discovery.run(&mut registry, &mut port)?;
//! let device = auto_select(&mut registry, &mut port).context("no candidate")?;
//!
//! let mut ledger = ActivationLedger::new(&config.staging_root);
//! MountOrchestrator::new(&runner, &config).mount(&device, &mut MountContext {
//!     registry: &mut registry,
//!     ledger: &mut ledger,
//!     topology: &mut topology,
//!     decisions: &mut port,
//!     snapshot: &mut NoSnapshot,
//! })?;
//! ```

pub mod config;
pub mod decision;
pub mod discovery;
pub mod elf;
pub mod error;
pub mod fsck;
pub mod fstab;
pub mod hooks;
pub mod ledger;
pub mod orchestrator;
pub mod probe;
pub mod process;
pub mod registry;
pub mod storage;
pub mod translate;
pub mod validate;

#[cfg(test)]
pub(crate) mod testing;

pub use config::UpgradeConfig;
pub use decision::{DecisionPort, Notice, Question};
pub use discovery::RootDiscovery;
pub use error::{MountError, TableProblem, UnwindError};
pub use hooks::{CommandSnapshotHook, NoSnapshot, ProductAllowList, SnapshotHook, SupportPolicy};
pub use ledger::{Activation, ActivationLedger, UnwindWarning};
pub use orchestrator::{MountContext, MountOrchestrator, MountStage};
pub use probe::DeviceProbe;
pub use process::{ProcessRunner, SystemRunner};
pub use registry::{MountOutcome, RootPartitionRegistry};
pub use storage::{DeviceId, LsblkTopology, StorageTopology};
pub use translate::MountTableTranslator;
pub use validate::{CandidateValidator, CandidateVerdict, Rejection};
