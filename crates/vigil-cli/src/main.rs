//! Vigil command-line interface for status, preflight, and manual operations.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::path::{Path, PathBuf};
use vigil_core::{
    config::{VigilConfig, DEFAULT_CONFIG_PATH},
    ledger::{AccessLedger, NotificationLedger},
    logging,
    monitor::Monitor,
    notify::{self, MailCommandNotifier, Notifier},
    privilege,
    system::SystemFacade,
    wipe::{StepOutcome, WipeSequencer},
};

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "vigil",
    version,
    about = "Inactivity watchdog for an encrypted vault: status, checks, and manual operations."
)]
struct Cli {
    /// Path to the Vigil configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Subcommands covering the operator surface of a Vigil deployment.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the countdown, delivered warnings, and key material state.
    Status,

    /// Validate the configuration and run the wipe safety checks without
    /// touching anything.
    Check,

    /// Record an access now, resetting the countdown and clearing warnings.
    RecordAccess,

    /// Send a sample warning through the configured mail transport.
    TestNotify,

    /// Run the destructive wipe sequence by hand.
    Wipe {
        /// Required acknowledgement that the data becomes unrecoverable.
        #[arg(long)]
        confirm: bool,

        /// Run the safety checks only and report what would happen.
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the JSON schema of the configuration file.
    Schema,
}

fn load_cli_config(path: &Path) -> Result<VigilConfig> {
    let config = VigilConfig::load_or_bootstrap(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    if config.path != path {
        println!(
            "Using bootstrap configuration at {} (override VIGIL_CONFIG to replace).",
            config.path.display()
        );
    }

    Ok(config)
}

fn main() -> Result<()> {
    logging::init("warn");
    let cli = Cli::parse();

    match cli.command {
        Commands::Status => status(&cli.config),
        Commands::Check => check(&cli.config),
        Commands::RecordAccess => record_access(&cli.config),
        Commands::TestNotify => test_notify(&cli.config),
        Commands::Wipe { confirm, dry_run } => wipe(&cli.config, confirm, dry_run),
        Commands::Schema => {
            let schema = schema_for!(VigilConfig);
            println!("{}", to_string_pretty(&schema)?);
            Ok(())
        }
    }
}

fn status(config_path: &Path) -> Result<()> {
    let config = load_cli_config(config_path)?;
    let access = AccessLedger::new(config.access_file_path());
    let notices = NotificationLedger::new(config.notification_file_path());
    let keyfile = config.keyfile_path();

    println!("Configuration:  {}", config.path.display());
    println!(
        "Key material:   {} ({})",
        keyfile.display(),
        if keyfile.exists() {
            "present"
        } else {
            "ABSENT - vault already wiped"
        }
    );

    match access.last_access() {
        Some(at) => {
            let days = access.days_since_last_access().unwrap_or_default();
            println!(
                "Last access:    {} ({days}/{} days elapsed)",
                at.format("%Y-%m-%d %H:%M:%S UTC"),
                config.policy.inactivity_days
            );
            if let Some(destruction) = access.scheduled_destruction(config.policy.inactivity_days)
            {
                let remaining = (destruction - Utc::now()).num_days().max(0);
                println!(
                    "Destruction:    {} (in {remaining} day(s))",
                    destruction.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
        }
        None => println!("Last access:    never recorded (first epoch not yet seeded)"),
    }

    let records = notices.records();
    if records.is_empty() {
        println!("Warnings sent:  none this epoch");
    } else {
        println!("Warnings sent:");
        for (day, record) in records {
            println!(
                "  day {day}: sent {} ({} days elapsed)",
                record.sent_at.format("%Y-%m-%d %H:%M:%S UTC"),
                record.days_elapsed
            );
        }
    }

    Ok(())
}

fn check(config_path: &Path) -> Result<()> {
    let config = load_cli_config(config_path)?;

    let issues = config.validate();
    if issues.is_empty() {
        println!("Configuration: OK");
    } else {
        println!("Configuration problems:");
        for issue in &issues {
            println!("  - {issue}");
        }
    }

    let facade = SystemFacade::from_config(&config);
    let sequencer = WipeSequencer::from_config(&config, &facade);
    let safety = sequencer.preflight();
    if safety.is_empty() {
        println!("Wipe safety checks: OK");
        println!("  device:      {}", config.storage.device);
        println!("  mount point: {}", config.storage.mount_point);
        println!("  keyfile:     {}", config.keyfile_path().display());
    } else {
        println!("Wipe safety problems:");
        for issue in &safety {
            println!("  - {issue}");
        }
    }

    if issues.is_empty() && safety.is_empty() {
        Ok(())
    } else {
        bail!("checks reported problems")
    }
}

fn record_access(config_path: &Path) -> Result<()> {
    let config = load_cli_config(config_path)?;
    let notifier = notify::from_config(&config);
    let monitor = Monitor::from_config(&config, notifier).map_err(anyhow::Error::new)?;

    let cancelled = monitor.record_access(None).map_err(anyhow::Error::new)?;
    println!("Access recorded; countdown reset.");
    if cancelled {
        println!("A pending destruction was cancelled and announced.");
    }
    Ok(())
}

fn test_notify(config_path: &Path) -> Result<()> {
    let config = load_cli_config(config_path)?;
    if !config.notify.enabled {
        bail!("notify.enabled is false; enable it and configure from/to first");
    }

    let notifier = MailCommandNotifier::from_config(&config);
    let destruction_at = Utc::now() + chrono::Duration::days(7);
    if notifier.send_warning(23, 23, 30, destruction_at) {
        println!("Test warning handed to {}.", config.notify.mail_command);
        Ok(())
    } else {
        bail!("test warning could not be delivered; see log output")
    }
}

fn wipe(config_path: &Path, confirm: bool, dry_run: bool) -> Result<()> {
    let config = load_cli_config(config_path)?;
    let facade = SystemFacade::from_config(&config);
    let sequencer = WipeSequencer::from_config(&config, &facade);

    if dry_run {
        let safety = sequencer.preflight();
        if safety.is_empty() {
            println!("All safety checks passed; a real run would destroy the key material.");
            return Ok(());
        }
        println!("Safety checks would refuse the run:");
        for issue in &safety {
            println!("  - {issue}");
        }
        bail!("safety checks failed");
    }

    if !confirm {
        bail!("refusing to wipe without --confirm; this permanently destroys the vault key");
    }
    privilege::ensure_root().map_err(anyhow::Error::new)?;

    let outcome = sequencer.run().map_err(anyhow::Error::new)?;
    for record in &outcome.steps {
        let state = match &record.outcome {
            StepOutcome::Succeeded => "ok".to_string(),
            StepOutcome::SkippedAlreadySatisfied => "already satisfied".to_string(),
            StepOutcome::Failed(reason) => format!("failed: {reason}"),
        };
        println!("  {:<28} {state}", record.step.label());
    }

    if outcome.is_fatal() {
        bail!("key destruction failed; the key may still exist - intervene manually NOW");
    }

    println!("Wipe complete; the vault data is permanently unrecoverable.");
    Ok(())
}
