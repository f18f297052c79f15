//! portwall - deny-by-default iptables firewall setup
//!
//! # Usage
//!
//! ```bash
//! portwall                              # Allow 22/tcp, 80/tcp, 443/tcp, 9100/tcp
//! portwall --ports 22/tcp,53/udp        # Allow exactly these
//! portwall --ports 22/tcp --dry-run     # Preview, change nothing
//! portwall --no-save                    # Apply without boot persistence
//! portwall --reset                      # Open everything
//! portwall --restore                    # Go back to the pre-change backup
//! ```
//!
//! # Exit Codes
//!
//! - `0`: success, `--help`, `--dry-run`
//! - `1`: not root, bad flag or bad port spec
//! - other non-zero: an iptables call failed (its own exit status when available)

use clap::Parser;
use clap::error::ErrorKind;
use portwall::core::applier::{BackupSettings, RuleApplier, control_channel_port};
use portwall::core::filter::IptablesFilter;
use portwall::core::firewall::FirewallPolicy;
use portwall::core::persist::{self, HostProbe};
use portwall::{Error, audit, config, elevation, utils, validators};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

shadow_rs::shadow!(build);

fn long_version() -> &'static str {
    format!(
        "{} (commit {}, built {})",
        build::PKG_VERSION,
        build::SHORT_COMMIT,
        build::BUILD_TIME
    )
    .leak()
}

#[derive(Parser)]
#[command(name = "portwall")]
#[command(about = "Deny-by-default iptables policy for a listed set of ports", long_about = None)]
#[command(version = build::PKG_VERSION, long_version = long_version())]
struct Cli {
    /// Comma-separated PORT/PROTOCOL list to allow inbound
    /// (default: 22/tcp,80/tcp,443/tcp,9100/tcp, or `default_ports` from the config file)
    #[arg(short, long, value_name = "PORTS")]
    ports: Option<String>,

    /// Open the firewall completely: all policies ACCEPT, no rules, no custom chains
    #[arg(long)]
    reset: bool,

    /// Show what would be applied without changing anything
    #[arg(long, conflicts_with = "reset")]
    dry_run: bool,

    /// Do not persist the rules for the next boot
    #[arg(long)]
    no_save: bool,

    /// Restore a saved snapshot (default: the pre-change backup)
    #[arg(
        long,
        value_name = "PATH",
        num_args = 0..=1,
        conflicts_with_all = ["reset", "dry_run", "ports"]
    )]
    restore: Option<Option<PathBuf>>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    let _ = utils::ensure_dirs();
    init_logging();

    // One thread: every iptables call completes before the next is issued
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_logging() {
    if let Some(mut log_path) = utils::get_state_dir() {
        log_path.push("portwall.log");
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
        {
            tracing_subscriber::fmt()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .with_max_level(tracing::Level::DEBUG)
                .init();
            return;
        }
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();
}

fn report_error(e: &Error) {
    eprintln!("Error: {e}");

    if let Some(translation) = e.translation() {
        eprintln!("{}", translation.user_message);
        for suggestion in &translation.suggestions {
            eprintln!("  - {suggestion}");
        }
    }

    if e.is_pre_mutation() {
        eprintln!("No changes were made to the firewall.");
    }
}

async fn run(cli: Cli) -> portwall::Result<()> {
    let config = config::load_config().await;

    if let Some(path) = cli.restore {
        let path = path.unwrap_or_else(|| config.backup_path.clone());
        return restore(&path).await;
    }

    // Argument errors surface before anything is touched
    let raw_ports = cli.ports.unwrap_or_else(|| config.default_ports_arg());
    let policy = FirewallPolicy::new(validators::parse_port_list(&raw_ports)?);

    if cli.reset {
        return reset().await;
    }

    if cli.dry_run {
        return dry_run(&policy).await;
    }

    elevation::require_root()?;

    if let Some(port) = control_channel_port(&policy, std::env::var("SSH_CONNECTION").ok().as_deref()) {
        warn!("SSH session port {port} is not in the allowed list");
        eprintln!("Warning: this SSH session arrived on {port}, which is not in the allowed list.");
        eprintln!("         The session will be cut off once the rules are applied.");
    }

    let backup = BackupSettings {
        path: config.backup_path.clone(),
        archive_dir: utils::get_snapshot_dir(),
        retention: config.snapshot_retention,
    };
    let mut applier = RuleApplier::new(IptablesFilter::new(), backup);
    let port_names: Vec<String> = policy.ports.iter().map(ToString::to_string).collect();

    println!("Applying deny-by-default policy...");
    match applier.apply_deny_by_default(&policy).await {
        Ok(report) => {
            audit::log_snapshot(&report.backup.path, &report.backup.checksum).await;
            audit::log_apply(&port_names, true, None).await;
            println!("✓ Previous rules saved to {}", report.backup.path.display());
            if let Some(archived) = &report.archived {
                info!("Archived copy at {:?}", archived);
            }
            println!("✓ Firewall rules applied ({} accept rules)", report.rules_added);
            for name in &port_names {
                println!("    allow {name}");
            }
        }
        Err(e) => {
            audit::log_apply(&port_names, false, Some(e.to_string())).await;
            if let Some(backup) = applier.last_backup() {
                error!("Apply aborted after backup {:?}", backup.path);
                eprintln!("✗ Rule application aborted; the firewall may be partially configured.");
                eprintln!(
                    "  Restore the previous rules with: portwall --restore {}",
                    backup.path.display()
                );
            }
            return Err(e);
        }
    }

    if cli.no_save || !config.persist {
        info!("Persistence skipped");
        println!("Rules not persisted; they will revert on reboot.");
        return Ok(());
    }

    match persist::persist(applier.filter_mut(), &HostProbe).await {
        Ok(backend) => {
            audit::log_persist(Some(backend.to_string()), true, None).await;
            println!("✓ Rules persisted via {backend}");
        }
        Err(e) => {
            let backend = match &e {
                persist::PersistError::Failed { backend, .. } => Some(backend.to_string()),
                persist::PersistError::Unavailable => None,
            };
            audit::log_persist(backend, false, Some(e.to_string())).await;
            eprintln!("Warning: {e}");
            eprintln!("         The applied rules are active but will not survive a reboot.");
        }
    }

    Ok(())
}

async fn reset() -> portwall::Result<()> {
    elevation::require_root()?;

    let mut applier = RuleApplier::new(IptablesFilter::new(), BackupSettings::default());
    println!("Resetting firewall...");
    match applier.reset().await {
        Ok(()) => {
            audit::log_reset(true, None).await;
            println!("✓ Firewall reset: all traffic allowed, no rules.");
            Ok(())
        }
        Err(e) => {
            audit::log_reset(false, Some(e.to_string())).await;
            Err(e)
        }
    }
}

async fn dry_run(policy: &FirewallPolicy) -> portwall::Result<()> {
    let applier = RuleApplier::new(IptablesFilter::new(), BackupSettings::default());
    let preview = applier.dry_run(policy).await?;

    println!("Dry run: no changes made.");
    println!("Ports that would be allowed:");
    for spec in &preview.ports {
        println!("  {spec}");
    }
    println!();
    println!("Resulting ruleset:");
    print!("{}", preview.rules_text);
    Ok(())
}

async fn restore(path: &std::path::Path) -> portwall::Result<()> {
    elevation::require_root()?;

    let mut applier = RuleApplier::new(IptablesFilter::new(), BackupSettings::default());
    println!("Restoring {}...", path.display());
    match applier.restore(path).await {
        Ok(()) => {
            audit::log_restore(path, true, None).await;
            println!("✓ Rules restored.");
            Ok(())
        }
        Err(e) => {
            audit::log_restore(path, false, Some(e.to_string())).await;
            Err(e)
        }
    }
}
