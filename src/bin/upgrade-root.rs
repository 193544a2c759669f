use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use env_logger::Env;
use upgrade_root::decision::{DecisionPort, Notice, Question};
use upgrade_root::discovery::auto_select;
use upgrade_root::fstab::MountTableEntry;
use upgrade_root::process::missing_programs;
use upgrade_root::{
    ActivationLedger, CandidateValidator, CommandSnapshotHook, DeviceProbe, LsblkTopology,
    MountContext, MountOrchestrator, NoSnapshot, ProductAllowList, RootDiscovery,
    RootPartitionRegistry, SnapshotHook, StorageTopology, SystemRunner, UpgradeConfig,
};
use zeroize::Zeroizing;

const DEFAULT_LOG_FILTER: &str = "info,upgrade_root=info";
const REQUIRED_TOOLS: &[&str] = &["lsblk", "mount", "umount"];

fn usage() -> &'static str {
    "Usage:\n  upgrade-root [--config PATH] [--log-filter FILTER] scan\n  upgrade-root [--config PATH] [--log-filter FILTER] mount [DEVICE]\n  upgrade-root [--config PATH] [--log-filter FILTER] unmount"
}

#[derive(Default)]
struct GlobalOptions {
    config: Option<PathBuf>,
    log_filter: Option<String>,
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (options, command) = parse_options(&args)?;
    init_logging(options.log_filter.as_deref());

    let config = match &options.config {
        Some(path) => UpgradeConfig::load(path)?,
        None => UpgradeConfig::default(),
    };

    match command {
        [scan] if scan == "scan" => scan_command(&config),
        [mount] if mount == "mount" => mount_command(&config, None),
        [mount, device] if mount == "mount" => mount_command(&config, Some(device)),
        [unmount] if unmount == "unmount" => unmount_command(&config),
        _ => bail!(usage()),
    }
}

fn parse_options(mut args: &[String]) -> Result<(GlobalOptions, &[String])> {
    let mut options = GlobalOptions::default();
    loop {
        match args {
            [flag, value, rest @ ..] if flag == "--config" => {
                options.config = Some(PathBuf::from(value));
                args = rest;
            }
            [flag, value, rest @ ..] if flag == "--log-filter" => {
                options.log_filter = Some(value.clone());
                args = rest;
            }
            [flag, ..] if flag.starts_with("--") => {
                bail!("unknown option '{}'\n{}", flag, usage())
            }
            _ => return Ok((options, args)),
        }
    }
}

fn init_logging(cli_filter: Option<&str>) {
    let env = Env::default().default_filter_or(DEFAULT_LOG_FILTER);
    let mut builder = env_logger::Builder::from_env(env);
    if let Some(filter) = cli_filter {
        builder.parse_filters(filter);
    }
    builder.format_timestamp_secs();
    builder.init();
}

fn preflight() -> Result<()> {
    let missing = missing_programs(REQUIRED_TOOLS);
    if !missing.is_empty() {
        bail!("required tools not found in PATH: {}", missing.join(", "));
    }
    Ok(())
}

fn discover(
    config: &UpgradeConfig,
    runner: &SystemRunner,
    topology: &LsblkTopology,
    registry: &mut RootPartitionRegistry,
    port: &mut TerminalPort,
) -> Result<()> {
    let policy = ProductAllowList::new(config.supported_products.clone());
    let discovery = RootDiscovery::new(
        DeviceProbe::new(topology, config),
        CandidateValidator::new(runner, topology, &policy, config),
    );
    discovery
        .run(registry, port)
        .context("scanning for installed systems")?;
    Ok(())
}

fn scan_command(config: &UpgradeConfig) -> Result<()> {
    preflight()?;
    let runner = SystemRunner;
    let topology = LsblkTopology::probe(&runner)?;
    let mut registry = RootPartitionRegistry::new();
    let mut port = TerminalPort;
    discover(config, &runner, &topology, &mut registry, &mut port)?;

    for verdict in registry.verdicts() {
        let status = if verdict.valid { "valid" } else { "invalid" };
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            verdict.device,
            status,
            verdict.product,
            verdict.arch,
            verdict.fs_type,
            verdict.label,
            verdict.reason()
        );
    }
    Ok(())
}

fn mount_command(config: &UpgradeConfig, device: Option<&str>) -> Result<()> {
    if let Some(saved) = ActivationLedger::load(&config.state_file)? {
        if !saved.is_empty() {
            bail!(
                "{} activations from an earlier mount are still recorded in '{}'; run 'upgrade-root unmount' first",
                saved.len(),
                config.state_file.display()
            );
        }
    }

    preflight()?;
    let runner = SystemRunner;
    let mut topology = LsblkTopology::probe(&runner)?;
    let mut registry = RootPartitionRegistry::new();
    let mut port = TerminalPort;
    discover(config, &runner, &topology, &mut registry, &mut port)?;

    let device = match device {
        Some(name) => {
            let Some(device) = topology.find_by_any_name(name) else {
                bail!("'{name}' is not a probed block device");
            };
            registry.select(device.clone());
            device
        }
        None => match auto_select(&mut registry, &mut port) {
            Some(device) => device,
            None => bail!("no installed system suitable for upgrade was found"),
        },
    };

    let mut snapshot: Box<dyn SnapshotHook + '_> = match &config.snapshot_command {
        Some(command) => Box::new(CommandSnapshotHook::new(&runner, command.clone())),
        None => Box::new(NoSnapshot),
    };
    let mut ledger = ActivationLedger::new(&config.staging_root);
    let result = MountOrchestrator::new(&runner, config).mount(
        &device,
        &mut MountContext {
            registry: &mut registry,
            ledger: &mut ledger,
            topology: &mut topology,
            decisions: &mut port,
            snapshot: snapshot.as_mut(),
        },
    );

    // Residual activations of a failed unwind must stay reachable too.
    if !ledger.is_empty() {
        ledger.save(&config.state_file)?;
    }
    result.with_context(|| format!("mounting {device}"))?;
    println!("{} mounted at {}", device, config.staging_root.display());
    Ok(())
}

fn unmount_command(config: &UpgradeConfig) -> Result<()> {
    let Some(mut ledger) = ActivationLedger::load(&config.state_file)? else {
        println!("nothing is mounted");
        return Ok(());
    };

    let runner = SystemRunner;
    let result = ledger.unwind(&runner, None);
    for warning in ledger.warnings() {
        eprintln!("warning: {warning}");
    }
    if ledger.is_empty() {
        ActivationLedger::clear_saved(&config.state_file)?;
    } else {
        ledger.save(&config.state_file)?;
    }
    result?;
    println!("{} unmounted", ledger.root().display());
    Ok(())
}

/// Decision port on the controlling terminal.
struct TerminalPort;

impl TerminalPort {
    fn read_line(prompt: &str) -> Option<String> {
        print!("{prompt} ");
        io::stdout().flush().ok()?;
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()),
        }
    }
}

impl DecisionPort for TerminalPort {
    fn ask_yes_no(&mut self, question: &Question) -> bool {
        Self::read_line(&format!("{question} [y/N]"))
            .is_some_and(|answer| matches!(answer.as_str(), "y" | "Y" | "yes"))
    }

    fn ask_choice(&mut self, prompt: &str, options: &[String]) -> Option<usize> {
        println!("{prompt}");
        for (idx, option) in options.iter().enumerate() {
            println!("  {}) {}", idx + 1, option);
        }
        let answer = Self::read_line("Number (empty to cancel):")?;
        let picked: usize = answer.parse().ok()?;
        picked.checked_sub(1).filter(|idx| *idx < options.len())
    }

    fn ask_secret(&mut self, prompt: &str) -> Option<Zeroizing<String>> {
        print!("{prompt}: ");
        io::stdout().flush().ok()?;
        let mut line = Zeroizing::new(String::new());
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
        // Trim in place so no unwiped copy is left behind.
        let len = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(len);
        (!line.is_empty()).then_some(line)
    }

    fn edit_mount_entry(&mut self, entry: &MountTableEntry) -> Option<MountTableEntry> {
        println!("Current entry: {entry}");
        let device = Self::read_line(&format!("Device [{}]:", entry.spec))?;
        let options = Self::read_line(&format!("Options [{}]:", entry.options_arg()))?;
        let mut edited = entry.clone();
        if !device.is_empty() {
            edited.spec = device;
        }
        if !options.is_empty() {
            edited.options = upgrade_root::fstab::split_options(&options);
        }
        Some(edited)
    }

    fn notify(&mut self, notice: &Notice) {
        eprintln!("note: {notice}");
    }
}
