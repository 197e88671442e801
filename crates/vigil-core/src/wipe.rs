//! Ordered, partially fault-tolerant destruction of the vault.
//!
//! Every step is best-effort except key destruction: the sequence exists to
//! make the data unrecoverable, so a stuck service or a busy mount must not
//! stop it, while a failure to destroy existing key material is the one
//! result the caller has to treat as an operational emergency.

use crate::config::VigilConfig;
use crate::error::{VigilError, VigilResult};
use crate::system::{OsFacade, UnmountMode};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use zeroize::Zeroizing;

/// Delay between an unmount attempt and its verification, giving the kernel
/// time to settle the mount table.
const UNMOUNT_SETTLE: Duration = Duration::from_millis(200);

/// The ordered steps of a wipe run.
///
/// `DisableAutoRemount` must strictly precede `Unmount`: removing the
/// persistent mount declaration and stopping the mount unit first is what
/// keeps the automounter from racing the unmount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WipeStep {
    StopService,
    DisableAutoRemount,
    Unmount,
    ClearGhostFiles,
    CloseMapping,
    DestroyKey,
}

const SEQUENCE: &[WipeStep] = &[
    WipeStep::StopService,
    WipeStep::DisableAutoRemount,
    WipeStep::Unmount,
    WipeStep::ClearGhostFiles,
    WipeStep::CloseMapping,
    WipeStep::DestroyKey,
];

impl WipeStep {
    /// Fixed fatality table: only key destruction aborts the sequence.
    pub fn is_fatal(self) -> bool {
        matches!(self, WipeStep::DestroyKey)
    }

    pub fn label(self) -> &'static str {
        match self {
            WipeStep::StopService => "stop dependent service",
            WipeStep::DisableAutoRemount => "disable auto-remount",
            WipeStep::Unmount => "unmount volume",
            WipeStep::ClearGhostFiles => "clear ghost files",
            WipeStep::CloseMapping => "close encrypted mapping",
            WipeStep::DestroyKey => "destroy key material",
        }
    }
}

/// Result of one step, with fatality decided by [`WipeStep::is_fatal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    SkippedAlreadySatisfied,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step: WipeStep,
    pub outcome: StepOutcome,
}

/// Write-once terminal record of a destructive run.
#[derive(Debug, Clone)]
pub struct WipeOutcome {
    pub steps: Vec<StepRecord>,
    pub fatal_step: Option<WipeStep>,
    pub completed_at: DateTime<Utc>,
}

impl WipeOutcome {
    pub fn steps_attempted(&self) -> usize {
        self.steps.len()
    }

    pub fn steps_succeeded(&self) -> usize {
        self.steps
            .iter()
            .filter(|record| {
                matches!(
                    record.outcome,
                    StepOutcome::Succeeded | StepOutcome::SkippedAlreadySatisfied
                )
            })
            .count()
    }

    /// True when key material may still exist; manual intervention required.
    pub fn is_fatal(&self) -> bool {
        self.fatal_step.is_some()
    }
}

struct StepContext {
    unmounted: bool,
}

/// Runs the destruction sequence against an [`OsFacade`].
pub struct WipeSequencer<'a, F: OsFacade> {
    facade: &'a F,
    device: String,
    mount_point: PathBuf,
    mapping_name: String,
    keyfile: PathBuf,
    service: String,
    shred_passes: u32,
}

impl<'a, F: OsFacade> WipeSequencer<'a, F> {
    pub fn new(
        facade: &'a F,
        device: String,
        mount_point: PathBuf,
        mapping_name: String,
        keyfile: PathBuf,
        service: String,
        shred_passes: u32,
    ) -> Self {
        Self {
            facade,
            device,
            mount_point,
            mapping_name,
            keyfile,
            service,
            shred_passes,
        }
    }

    pub fn from_config(config: &VigilConfig, facade: &'a F) -> Self {
        Self::new(
            facade,
            config.storage.device.clone(),
            config.mount_point_path(),
            config.storage.mapping_name.clone(),
            config.keyfile_path(),
            config.storage.service.clone(),
            config.wipe.shred_passes,
        )
    }

    /// Safety checks; every issue returned must block the destructive run.
    ///
    /// Key-file absence is deliberately not an issue: it means a previous run
    /// already destroyed the key, and the remaining steps are idempotent.
    pub fn preflight(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.device.trim().is_empty() {
            issues.push("no target device configured".to_string());
        } else if !Path::new(&self.device).exists() {
            issues.push(format!("target device {} does not exist", self.device));
        }

        match self.facade.root_block_device() {
            Ok(root) => {
                if !self.device.trim().is_empty() && self.device.starts_with(&root) {
                    issues.push(format!(
                        "target device {} is the system device (root is on {root})",
                        self.device
                    ));
                }
            }
            Err(err) => {
                issues.push(format!("unable to resolve the root device: {err}"));
            }
        }

        if self.keyfile.exists() {
            match self.facade.device_for_path(&self.keyfile) {
                Ok(device) if device == self.device => {
                    issues.push(format!(
                        "key material at {} lives on the target device",
                        self.keyfile.display()
                    ));
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        "could not verify the device behind {}: {err}",
                        self.keyfile.display()
                    );
                }
            }
        }

        issues
    }

    /// Run the full sequence.
    ///
    /// Returns `Err` only when the safety checks refuse the run. A key
    /// destruction failure is reported through `WipeOutcome::fatal_step`; the
    /// caller must not treat such an outcome as success.
    pub fn run(&self) -> VigilResult<WipeOutcome> {
        let issues = self.preflight();
        if !issues.is_empty() {
            for issue in &issues {
                error!("wipe refused: {issue}");
            }
            return Err(VigilError::Unsafe(issues.join("; ")));
        }
        info!("all wipe safety checks passed");

        let mut steps = Vec::with_capacity(SEQUENCE.len());
        let mut ctx = StepContext { unmounted: false };
        let mut fatal_step = None;

        for step in SEQUENCE {
            let outcome = self.execute(*step, &mut ctx);
            match &outcome {
                StepOutcome::Succeeded => info!("{}: done", step.label()),
                StepOutcome::SkippedAlreadySatisfied => {
                    info!("{}: already satisfied", step.label())
                }
                StepOutcome::Failed(reason) => {
                    if step.is_fatal() {
                        error!("{}: FAILED: {reason}", step.label());
                    } else {
                        warn!("{}: failed, continuing: {reason}", step.label());
                    }
                }
            }

            let failed = matches!(outcome, StepOutcome::Failed(_));
            steps.push(StepRecord {
                step: *step,
                outcome,
            });

            if failed && step.is_fatal() {
                fatal_step = Some(*step);
                break;
            }
        }

        let outcome = WipeOutcome {
            steps,
            fatal_step,
            completed_at: Utc::now(),
        };

        if outcome.is_fatal() {
            error!(
                "wipe sequence failed at `{}`; key material may still exist",
                outcome.fatal_step.map(WipeStep::label).unwrap_or("?")
            );
        } else {
            warn!("wipe sequence complete; the vault key no longer exists");
            if ctx.unmounted {
                info!("volume is unmounted and its mapping is no longer usable");
            } else {
                warn!(
                    "volume at {} is still mounted; plaintext may remain visible until reboot",
                    self.mount_point.display()
                );
            }
        }

        Ok(outcome)
    }

    fn execute(&self, step: WipeStep, ctx: &mut StepContext) -> StepOutcome {
        match step {
            WipeStep::StopService => match self.facade.stop_service(&self.service) {
                Ok(()) => StepOutcome::Succeeded,
                Err(err) => StepOutcome::Failed(err.to_string()),
            },
            WipeStep::DisableAutoRemount => {
                match self.facade.remove_mount_declaration(&self.mount_point) {
                    Ok(()) => StepOutcome::Succeeded,
                    Err(err) => StepOutcome::Failed(err.to_string()),
                }
            }
            WipeStep::Unmount => self.unmount_with_escalation(ctx),
            WipeStep::ClearGhostFiles => {
                if !ctx.unmounted {
                    // removing files under a live mount would hit the wrong
                    // filesystem
                    StepOutcome::Failed(
                        "volume is still mounted; refusing to clear ghost files".to_string(),
                    )
                } else {
                    self.clear_ghost_files()
                }
            }
            WipeStep::CloseMapping => match self.facade.close_mapping(&self.mapping_name) {
                Ok(()) => StepOutcome::Succeeded,
                Err(err) => StepOutcome::Failed(err.to_string()),
            },
            WipeStep::DestroyKey => self.destroy_key(),
        }
    }

    fn mounted(&self) -> bool {
        match self.facade.is_mounted(&self.mount_point) {
            Ok(mounted) => mounted,
            Err(err) => {
                // unverifiable counts as mounted so ghost cleanup stays off
                warn!(
                    "could not verify mount state of {}: {err}",
                    self.mount_point.display()
                );
                true
            }
        }
    }

    fn unmount_with_escalation(&self, ctx: &mut StepContext) -> StepOutcome {
        if !self.mounted() {
            ctx.unmounted = true;
            return StepOutcome::SkippedAlreadySatisfied;
        }

        let stages: &[(&str, UnmountMode, bool)] = &[
            ("unmount", UnmountMode::Normal, false),
            ("kill holders and retry", UnmountMode::Normal, true),
            ("lazy unmount", UnmountMode::Lazy, false),
            ("forced unmount", UnmountMode::Force, false),
        ];

        for (stage, mode, kill_first) in stages {
            if *kill_first {
                if let Err(err) = self.facade.kill_holders(&self.mount_point) {
                    warn!("kill holders failed: {err}");
                }
            }

            if let Err(err) = self.facade.unmount(&self.mount_point, *mode) {
                warn!("{stage} failed: {err}");
            }

            thread::sleep(UNMOUNT_SETTLE);
            if !self.mounted() {
                ctx.unmounted = true;
                return StepOutcome::Succeeded;
            }
        }

        StepOutcome::Failed(format!(
            "{} is still mounted after every escalation",
            self.mount_point.display()
        ))
    }

    /// Remove plaintext remnants left on the underlying filesystem at the
    /// mount path. Only called once the volume is verified unmounted.
    fn clear_ghost_files(&self) -> StepOutcome {
        let entries = match fs::read_dir(&self.mount_point) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return StepOutcome::SkippedAlreadySatisfied;
            }
            Err(err) => {
                return StepOutcome::Failed(format!(
                    "cannot enumerate {}: {err}",
                    self.mount_point.display()
                ));
            }
        };

        let mut removed = 0usize;
        let mut failures = 0usize;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("ghost-file enumeration error: {err}");
                    failures += 1;
                    continue;
                }
            };

            let path = entry.path();
            let result = if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };

            match result {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!("failed to remove ghost entry {}: {err}", path.display());
                    failures += 1;
                }
            }
        }

        if failures > 0 {
            StepOutcome::Failed(format!(
                "removed {removed} ghost entr{}, {failures} left behind",
                if removed == 1 { "y" } else { "ies" }
            ))
        } else if removed == 0 {
            StepOutcome::SkippedAlreadySatisfied
        } else {
            info!("removed {removed} ghost entries from {}", self.mount_point.display());
            StepOutcome::Succeeded
        }
    }

    fn destroy_key(&self) -> StepOutcome {
        match fs::symlink_metadata(&self.keyfile) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "key material at {} already absent; destruction already satisfied",
                    self.keyfile.display()
                );
                return StepOutcome::SkippedAlreadySatisfied;
            }
            Err(err) => {
                return StepOutcome::Failed(format!(
                    "cannot stat {}: {err}",
                    self.keyfile.display()
                ));
            }
            Ok(_) => {}
        }

        // leave an auditable fingerprint of what was destroyed
        match fs::read(&self.keyfile) {
            Ok(bytes) => {
                let bytes = Zeroizing::new(bytes);
                let digest = hex::encode(Sha256::digest(&bytes[..]));
                info!("destroying key material (sha256 {digest})");
            }
            Err(err) => warn!("could not fingerprint key material: {err}"),
        }

        match self
            .facade
            .overwrite_and_delete(&self.keyfile, self.shred_passes)
        {
            Ok(()) => {
                warn!(
                    "key material at {} overwritten and deleted; the data is now unrecoverable",
                    self.keyfile.display()
                );
                StepOutcome::Succeeded
            }
            Err(err) => StepOutcome::Failed(err.to_string()),
        }
    }
}
