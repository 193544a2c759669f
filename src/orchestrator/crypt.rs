//! Unlocking crypto-table volumes.

use crate::decision::{DecisionPort, Notice};
use crate::fstab::CryptEntry;
use crate::process::ProcessRunner;
use log::{info, warn};

/// `cryptsetup` exit code for "no key available with this passphrase".
const WRONG_PASSPHRASE: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum UnlockResult {
    Unlocked,
    /// The user gave no passphrase; only this volume is skipped.
    Cancelled,
    Failed(String),
}

/// Ask for a passphrase until the volume opens or the user gives up.
pub(super) fn unlock(
    runner: &dyn ProcessRunner,
    decisions: &mut dyn DecisionPort,
    entry: &CryptEntry,
) -> UnlockResult {
    let args = vec![
        "open".to_string(),
        entry.backing.clone(),
        entry.name.clone(),
        "--key-file=-".to_string(),
    ];
    let mut prompt = format!(
        "Passphrase for the encrypted volume {} ({})",
        entry.backing, entry.mountpoint
    );

    loop {
        let passphrase = match decisions.ask_secret(&prompt) {
            Some(p) if !p.is_empty() => p,
            _ => {
                info!("{}: no passphrase given, skipping", entry.name);
                decisions.notify(&Notice::MountSkipped {
                    mountpoint: entry.mountpoint.clone(),
                    detail: format!("{} was not unlocked", entry.backing),
                });
                return UnlockResult::Cancelled;
            }
        };

        let out = match runner.run_with_input("cryptsetup", &args, &passphrase) {
            Ok(out) => out,
            Err(err) => return UnlockResult::Failed(format!("{err:#}")),
        };
        if out.success() {
            info!("unlocked {} as {}", entry.backing, entry.mapped_device());
            return UnlockResult::Unlocked;
        }
        if out.exit_code != WRONG_PASSPHRASE {
            warn!("cryptsetup open {}: {}", entry.backing, out.diagnostics());
            return UnlockResult::Failed(out.diagnostics());
        }
        warn!("wrong passphrase for {}", entry.backing);
        prompt = format!(
            "Wrong passphrase. Passphrase for the encrypted volume {} ({})",
            entry.backing, entry.mountpoint
        );
    }
}
