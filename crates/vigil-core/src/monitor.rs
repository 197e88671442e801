//! Evaluation-side orchestration shared by the daemon and CLI.
//!
//! `Monitor` owns the two ledgers and the escalation policy and turns each
//! periodic evaluation into at most one action. The async shell in
//! `vigil-daemon` supplies the timing, the log tail, and the terminal wipe;
//! everything here is synchronous and testable.

use crate::config::VigilConfig;
use crate::error::VigilResult;
use crate::ledger::{AccessLedger, NotificationLedger};
use crate::notify::Notifier;
use crate::policy::{Action, EscalationPolicy};
use chrono::{DateTime, Utc};
use log::{error, info, warn};

/// What a single evaluation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No history existed; a fresh epoch was seeded.
    Initialized,
    /// The warning for this day threshold was delivered and recorded.
    Warned(u64),
    /// Delivery failed; the level stays unsent and retries next tick.
    WarnFailed(u64),
    /// The inactivity threshold is reached; the caller must run the wipe.
    DestructionDue,
    Idle,
}

pub struct Monitor<N: Notifier> {
    access: AccessLedger,
    notices: NotificationLedger,
    policy: EscalationPolicy,
    notifier: N,
}

impl<N: Notifier> Monitor<N> {
    pub fn new(
        access: AccessLedger,
        notices: NotificationLedger,
        policy: EscalationPolicy,
        notifier: N,
    ) -> Self {
        Self {
            access,
            notices,
            policy,
            notifier,
        }
    }

    pub fn from_config(config: &VigilConfig, notifier: N) -> VigilResult<Self> {
        Ok(Self::new(
            AccessLedger::new(config.access_file_path()),
            NotificationLedger::new(config.notification_file_path()),
            EscalationPolicy::from_config(config)?,
            notifier,
        ))
    }

    pub fn access(&self) -> &AccessLedger {
        &self.access
    }

    pub fn notices(&self) -> &NotificationLedger {
        &self.notices
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Handle a qualifying access event: update the ledger, reset the
    /// notification epoch, and announce the cancelled destruction when a
    /// warning had already gone out.
    ///
    /// Returns whether a cancellation notice was emitted.
    pub fn record_access(&self, at: Option<DateTime<Utc>>) -> VigilResult<bool> {
        let elapsed = self.access.days_since_last_access();
        let warned_epoch = match (elapsed, self.policy.first_warning_day()) {
            (Some(days), Some(first)) => days >= first && !self.notices.sent_days().is_empty(),
            _ => false,
        };

        self.access.record_access(at)?;
        self.notices.reset_epoch()?;

        if warned_epoch {
            if self.notifier.send_destruction_cancelled() {
                info!("destruction cancelled notice sent");
                return Ok(true);
            }
            warn!("failed to send destruction cancelled notice");
        }
        Ok(false)
    }

    /// Run one evaluation and act on the result.
    pub fn tick(&self) -> VigilResult<TickOutcome> {
        let elapsed = self.access.days_since_last_access();
        let sent = self.notices.sent_days();

        match self.policy.evaluate(elapsed, &sent) {
            Action::Initialize => {
                info!("no access history found; seeding the first epoch");
                self.access.record_access(None)?;
                Ok(TickOutcome::Initialized)
            }
            Action::Destroy => {
                let days = elapsed.unwrap_or_default();
                error!(
                    "inactivity threshold reached ({days} >= {} days)",
                    self.policy.inactivity_days()
                );
                Ok(TickOutcome::DestructionDue)
            }
            Action::Warn(day) => {
                let days = elapsed.unwrap_or_default();
                let destruction_at = match self
                    .access
                    .scheduled_destruction(self.policy.inactivity_days())
                {
                    Some(at) => at,
                    None => {
                        // the record vanished between evaluate and now;
                        // treat as a fresh epoch next tick
                        warn!("access record disappeared mid-evaluation");
                        return Ok(TickOutcome::Idle);
                    }
                };

                info!(
                    "day-{day} warning due ({days}/{} days elapsed)",
                    self.policy.inactivity_days()
                );
                if self
                    .notifier
                    .send_warning(day, days, self.policy.inactivity_days(), destruction_at)
                {
                    self.notices.mark_sent(day, days)?;
                    Ok(TickOutcome::Warned(day))
                } else {
                    // not recorded: the level fires again on the next tick
                    warn!("day-{day} warning could not be delivered; will retry");
                    Ok(TickOutcome::WarnFailed(day))
                }
            }
            Action::Idle => Ok(TickOutcome::Idle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<String>>,
        fail_warnings: bool,
    }

    impl RecordingNotifier {
        fn events(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn send_warning(
            &self,
            warning_day: u64,
            _days_elapsed: u64,
            _inactivity_days: u64,
            _destruction_at: DateTime<Utc>,
        ) -> bool {
            if self.fail_warnings {
                return false;
            }
            self.sent.lock().unwrap().push(format!("warn {warning_day}"));
            true
        }

        fn send_destruction_cancelled(&self) -> bool {
            self.sent.lock().unwrap().push("cancelled".to_string());
            true
        }

        fn send_destruction_complete(
            &self,
            _days_elapsed: u64,
            _last_access: Option<DateTime<Utc>>,
        ) -> bool {
            self.sent.lock().unwrap().push("complete".to_string());
            true
        }

        fn send_operational_alert(&self, subject: &str, _detail: &str) -> bool {
            self.sent.lock().unwrap().push(format!("alert {subject}"));
            true
        }
    }

    fn monitor(dir: &std::path::Path) -> Monitor<RecordingNotifier> {
        Monitor::new(
            AccessLedger::new(dir.join("last_access.json")),
            NotificationLedger::new(dir.join("notifications.json")),
            EscalationPolicy::new(30, &[23, 27, 29]).unwrap(),
            RecordingNotifier::default(),
        )
    }

    fn age_access(monitor: &Monitor<RecordingNotifier>, days: i64) {
        monitor
            .access()
            .record_access(Some(Utc::now() - Duration::days(days)))
            .unwrap();
    }

    #[test]
    fn first_tick_initializes_then_idles() {
        let dir = tempdir().unwrap();
        let monitor = monitor(dir.path());

        assert_eq!(monitor.tick().unwrap(), TickOutcome::Initialized);
        // elapsed is now 0: nothing further happens
        assert_eq!(monitor.tick().unwrap(), TickOutcome::Idle);
    }

    #[test]
    fn warning_is_sent_once_then_idles() {
        let dir = tempdir().unwrap();
        let monitor = monitor(dir.path());
        age_access(&monitor, 23);

        assert_eq!(monitor.tick().unwrap(), TickOutcome::Warned(23));
        assert_eq!(monitor.notifier().events(), vec!["warn 23"]);
        // identical elapsed: 23 already sent, 27 and 29 not yet crossed
        assert_eq!(monitor.tick().unwrap(), TickOutcome::Idle);
        assert_eq!(monitor.notifier().events(), vec!["warn 23"]);
    }

    #[test]
    fn failed_delivery_retries_on_next_tick() {
        let dir = tempdir().unwrap();
        let mut monitor = monitor(dir.path());
        monitor.notifier.fail_warnings = true;
        age_access(&monitor, 23);

        assert_eq!(monitor.tick().unwrap(), TickOutcome::WarnFailed(23));
        assert!(!monitor.notices().already_sent(23));

        monitor.notifier.fail_warnings = false;
        assert_eq!(monitor.tick().unwrap(), TickOutcome::Warned(23));
        assert!(monitor.notices().already_sent(23));
    }

    #[test]
    fn destruction_due_at_threshold() {
        let dir = tempdir().unwrap();
        let monitor = monitor(dir.path());
        age_access(&monitor, 30);

        assert_eq!(monitor.tick().unwrap(), TickOutcome::DestructionDue);
    }

    #[test]
    fn access_after_warning_emits_cancellation() {
        let dir = tempdir().unwrap();
        let monitor = monitor(dir.path());
        age_access(&monitor, 23);
        assert_eq!(monitor.tick().unwrap(), TickOutcome::Warned(23));

        let cancelled = monitor.record_access(None).unwrap();
        assert!(cancelled);
        assert_eq!(monitor.notifier().events(), vec!["warn 23", "cancelled"]);
        // sent-set cleared with the new epoch
        assert!(monitor.notices().sent_days().is_empty());
        assert_eq!(monitor.access().days_since_last_access(), Some(0));
    }

    #[test]
    fn access_before_any_warning_stays_quiet() {
        let dir = tempdir().unwrap();
        let monitor = monitor(dir.path());
        age_access(&monitor, 10);

        let cancelled = monitor.record_access(None).unwrap();
        assert!(!cancelled);
        assert!(monitor.notifier().events().is_empty());
    }

    #[test]
    fn reset_epoch_lets_warnings_fire_again() {
        let dir = tempdir().unwrap();
        let monitor = monitor(dir.path());
        age_access(&monitor, 28);

        assert_eq!(monitor.tick().unwrap(), TickOutcome::Warned(23));
        assert_eq!(monitor.tick().unwrap(), TickOutcome::Warned(27));
        assert_eq!(monitor.tick().unwrap(), TickOutcome::Idle);

        monitor.record_access(None).unwrap();
        age_access(&monitor, 24);
        // fresh epoch: the lowest threshold fires again
        assert_eq!(monitor.tick().unwrap(), TickOutcome::Warned(23));
    }
}
