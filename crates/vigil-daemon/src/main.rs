//! Background daemon that tails share access and wipes the vault key after
//! prolonged inactivity.

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::signal;
use tokio::sync::watch;
use tokio::time::{interval, sleep};
use vigil_core::{
    config::{VigilConfig, DEFAULT_CONFIG_PATH},
    logging,
    monitor::{Monitor, TickOutcome},
    notify::{LogNotifier, MailCommandNotifier, Notifier},
    privilege,
    system::{OsFacade, SystemFacade},
    wipe::WipeSequencer,
};

const CONFIG_ENV: &str = "VIGIL_CONFIG";

/// Transport selected at startup from the notify section.
#[derive(Clone)]
enum RuntimeNotifier {
    Mail(MailCommandNotifier),
    Log(LogNotifier),
}

impl RuntimeNotifier {
    fn from_config(config: &VigilConfig) -> Self {
        if config.notify.enabled {
            RuntimeNotifier::Mail(MailCommandNotifier::from_config(config))
        } else {
            RuntimeNotifier::Log(LogNotifier)
        }
    }
}

impl Notifier for RuntimeNotifier {
    fn send_warning(
        &self,
        warning_day: u64,
        days_elapsed: u64,
        inactivity_days: u64,
        destruction_at: chrono::DateTime<chrono::Utc>,
    ) -> bool {
        match self {
            RuntimeNotifier::Mail(notifier) => {
                notifier.send_warning(warning_day, days_elapsed, inactivity_days, destruction_at)
            }
            RuntimeNotifier::Log(notifier) => {
                notifier.send_warning(warning_day, days_elapsed, inactivity_days, destruction_at)
            }
        }
    }

    fn send_destruction_cancelled(&self) -> bool {
        match self {
            RuntimeNotifier::Mail(notifier) => notifier.send_destruction_cancelled(),
            RuntimeNotifier::Log(notifier) => notifier.send_destruction_cancelled(),
        }
    }

    fn send_destruction_complete(
        &self,
        days_elapsed: u64,
        last_access: Option<chrono::DateTime<chrono::Utc>>,
    ) -> bool {
        match self {
            RuntimeNotifier::Mail(notifier) => {
                notifier.send_destruction_complete(days_elapsed, last_access)
            }
            RuntimeNotifier::Log(notifier) => {
                notifier.send_destruction_complete(days_elapsed, last_access)
            }
        }
    }

    fn send_operational_alert(&self, subject: &str, detail: &str) -> bool {
        match self {
            RuntimeNotifier::Mail(notifier) => notifier.send_operational_alert(subject, detail),
            RuntimeNotifier::Log(notifier) => notifier.send_operational_alert(subject, detail),
        }
    }
}

/// Entry point for the Tokio runtime; logs failures before exit.
#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        error!("daemon exit: {err:?}");
        std::process::exit(1);
    }
}

/// Load configuration, run the startup check, and host both loops.
async fn run() -> Result<()> {
    logging::init("info");

    let config_path =
        std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config_path = PathBuf::from(config_path);
    let config = Arc::new(
        VigilConfig::load_or_bootstrap(&config_path)
            .with_context(|| format!("load config {}", config_path.display()))?,
    );

    let issues = config.validate();
    if !issues.is_empty() {
        for issue in &issues {
            error!("configuration error: {issue}");
        }
        bail!("configuration at {} is invalid; refusing to start", config.path.display());
    }

    privilege::ensure_root().map_err(anyhow::Error::new)?;

    info!("vigil daemon booting (config: {})", config.path.display());
    info!(
        "inactivity threshold {} days, warnings at {:?}, notifications {}",
        config.policy.inactivity_days,
        config.policy.warning_days,
        if config.notify.enabled { "enabled" } else { "disabled" }
    );

    // a missing keyfile means a previous run already destroyed the data;
    // there is nothing left to guard
    let keyfile = config.keyfile_path();
    if !keyfile.exists() {
        info!(
            "key material at {} not found - the vault was already wiped; exiting",
            keyfile.display()
        );
        return Ok(());
    }

    let notifier = RuntimeNotifier::from_config(&config);
    let monitor = Arc::new(Monitor::from_config(&config, notifier).map_err(anyhow::Error::new)?);
    let facade = Arc::new(SystemFacade::from_config(&config));

    // a daemon restarted past the threshold must not wait for the first tick
    info!("performing startup check");
    match monitor.tick().map_err(anyhow::Error::new)? {
        TickOutcome::DestructionDue => {
            warn!("inactivity threshold already exceeded at startup");
            return execute_wipe(&config, &monitor, &facade);
        }
        outcome => debug!("startup check: {outcome:?}"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tail_handle = tokio::spawn(tail_access_log(
        config.clone(),
        monitor.clone(),
        shutdown_rx.clone(),
    ));
    let mut eval_handle = tokio::spawn(run_evaluator(
        config.clone(),
        monitor.clone(),
        facade.clone(),
        shutdown_rx,
    ));

    tokio::select! {
        res = &mut eval_handle => {
            tail_handle.abort();
            res.context("evaluator task failed")??;
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal; letting in-flight work finish");
            let _ = shutdown_tx.send(true);
            // the evaluator observes the flag between iterations only, so a
            // wipe already underway runs to completion
            let res = eval_handle.await;
            tail_handle.abort();
            let _ = tail_handle.await;
            res.context("evaluator task failed")??;
        }
    }

    info!("vigil daemon stopped");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            error!("failed to install SIGTERM handler: {err}");
            let _ = signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

/// Follow the audit log and record every qualifying access event.
async fn tail_access_log(
    config: Arc<VigilConfig>,
    monitor: Arc<Monitor<RuntimeNotifier>>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let path = PathBuf::from(&config.watch.audit_log);
    if !path.exists() {
        warn!(
            "audit log {} not found; access tracking relies on periodic checks only",
            path.display()
        );
        return Ok(());
    }

    let file = File::open(&path)
        .await
        .with_context(|| format!("open audit log {}", path.display()))?;
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::End(0)).await?;
    info!("tailing access log {}", path.display());

    let mut shutdown = shutdown;
    let mut line = String::new();
    loop {
        if *shutdown.borrow() {
            info!("access tail stopping");
            return Ok(());
        }

        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            tokio::select! {
                _ = sleep(config.poll_interval()) => {}
                _ = shutdown.changed() => {}
            }
            continue;
        }

        if line.contains(&config.watch.match_token) {
            debug!("access detected: {}", line.trim_end());
            match monitor.record_access(None) {
                Ok(true) => info!("pending destruction cancelled by access"),
                Ok(false) => {}
                Err(err) => error!("failed to record access: {err}"),
            }
        }
    }
}

/// Periodic evaluation loop; ends permanently once destruction runs.
async fn run_evaluator(
    config: Arc<VigilConfig>,
    monitor: Arc<Monitor<RuntimeNotifier>>,
    facade: Arc<SystemFacade>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut ticker = interval(config.check_interval());
    // the first tick fires immediately and would duplicate the startup check
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            info!("evaluator stopping");
            return Ok(());
        }

        info!("performing periodic check");
        match monitor.tick() {
            Ok(TickOutcome::DestructionDue) => {
                return execute_wipe(&config, &monitor, &facade);
            }
            Ok(outcome) => debug!("periodic check: {outcome:?}"),
            Err(err) => error!("periodic check failed: {err}"),
        }
    }
}

/// Terminal path: run the sequencer to completion and never monitor again.
fn execute_wipe(
    config: &VigilConfig,
    monitor: &Monitor<RuntimeNotifier>,
    facade: &SystemFacade,
) -> Result<()> {
    let last_access = monitor.access().last_access();
    let days_elapsed = monitor.access().days_since_last_access().unwrap_or_default();

    warn!("executing secure wipe (last access: {last_access:?}, {days_elapsed} days ago)");

    let sequencer = WipeSequencer::from_config(config, facade);
    let outcome = match sequencer.run() {
        Ok(outcome) => outcome,
        Err(err) => {
            monitor.notifier().send_operational_alert(
                "secure wipe refused by safety checks",
                &err.to_string(),
            );
            return Err(anyhow::Error::new(err).context("wipe refused"));
        }
    };

    info!(
        "wipe steps: {}/{} succeeded (finished at {})",
        outcome.steps_succeeded(),
        outcome.steps_attempted(),
        outcome.completed_at
    );

    if outcome.is_fatal() {
        monitor.notifier().send_operational_alert(
            "key destruction failed",
            "the wipe sequence could not destroy the key material; \
             the key may still exist and manual destruction is required immediately",
        );
        bail!("key destruction failed; manual intervention required");
    }

    if !monitor
        .notifier()
        .send_destruction_complete(days_elapsed, last_access)
    {
        warn!("could not send destruction-complete notice");
    }

    // keep a unit restart from resurrecting a watchdog with nothing to guard
    if let Err(err) = facade.disable_service(&config.wipe.disable_unit) {
        warn!("could not disable {}: {err}", config.wipe.disable_unit);
    }

    if config.wipe.reboot_after {
        warn!("rebooting to clear residual mount state");
        facade.reboot().map_err(anyhow::Error::new)?;
    }

    Ok(())
}
