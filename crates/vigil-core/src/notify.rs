//! Notification contract and transports.
//!
//! The core only depends on the [`Notifier`] trait; what a warning looks like
//! on the wire is the transport's business. The bundled transport pipes a
//! composed text message into a sendmail-compatible binary so no SMTP state
//! lives in this process.

use crate::command::CommandRunner;
use crate::config::VigilConfig;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Outbound notification channel.
///
/// Every method returns `true` only when the message was handed off; a
/// `false` result means the caller must treat the notice as not yet sent and
/// retry on a later evaluation. Implementations may be called repeatedly for
/// the same event; the notification ledger deduplicates warnings upstream.
pub trait Notifier {
    fn send_warning(
        &self,
        warning_day: u64,
        days_elapsed: u64,
        inactivity_days: u64,
        destruction_at: DateTime<Utc>,
    ) -> bool;

    fn send_destruction_cancelled(&self) -> bool;

    fn send_destruction_complete(&self, days_elapsed: u64, last_access: Option<DateTime<Utc>>)
        -> bool;

    /// Highest-severity channel for conditions needing manual intervention.
    fn send_operational_alert(&self, subject: &str, detail: &str) -> bool;
}

/// Urgency tier derived from the days left before destruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Urgent,
    Final,
}

impl Severity {
    pub fn for_days_remaining(days_remaining: u64) -> Self {
        match days_remaining {
            0 | 1 => Severity::Final,
            2 | 3 => Severity::Urgent,
            _ => Severity::Warning,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Severity::Warning => "WARNING",
            Severity::Urgent => "URGENT",
            Severity::Final => "FINAL NOTICE",
        }
    }
}

/// Composed message, transport-agnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub body: String,
}

/// Host details woven into message bodies.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub hostname: String,
    pub share_name: String,
}

impl MessageContext {
    pub fn from_config(config: &VigilConfig) -> Self {
        let hostname = config
            .notify
            .hostname_hint
            .as_deref()
            .map(str::trim)
            .filter(|hint| !hint.is_empty())
            .map(str::to_string)
            .unwrap_or_else(local_hostname);
        Self {
            hostname,
            share_name: config.notify.share_name.clone(),
        }
    }
}

/// Best-effort hostname lookup; notifications still read sensibly without it.
pub fn local_hostname() -> String {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|name| name.trim().to_string())
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

pub fn compose_warning(
    ctx: &MessageContext,
    days_elapsed: u64,
    inactivity_days: u64,
    destruction_at: DateTime<Utc>,
) -> Message {
    let days_remaining = inactivity_days.saturating_sub(days_elapsed);
    let severity = Severity::for_days_remaining(days_remaining);

    let subject = format!(
        "[{}] vault data will be destroyed in {days_remaining} day(s)",
        severity.tag()
    );

    let body = format!(
        "Automated notice from the vigil watchdog on {host}.\n\
         \n\
         Severity:              {tag}\n\
         Last access:           {days_elapsed} day(s) ago\n\
         Time remaining:        {days_remaining} day(s)\n\
         Scheduled destruction: {destruction}\n\
         \n\
         If no access is observed within {days_remaining} day(s), the\n\
         encryption key for the vault will be irreversibly destroyed and the\n\
         data will become unrecoverable.\n\
         \n\
         To keep the data, access the share now; any access resets the\n\
         countdown to the full {inactivity_days}-day window.\n\
         \n\
         Access paths:\n\
           Windows:   \\\\{host}\\{share}\n\
           macOS:     smb://{host}.local/{share}\n\
           Linux:     smb://{host}.local/{share}\n\
         \n\
         To let the data be destroyed, do nothing.\n",
        host = ctx.hostname,
        share = ctx.share_name,
        tag = severity.tag(),
        destruction = destruction_at.format("%Y-%m-%d %H:%M:%S UTC"),
    );

    Message { subject, body }
}

pub fn compose_cancelled(ctx: &MessageContext) -> Message {
    let subject = "[CLEARED] vault data destruction cancelled".to_string();
    let body = format!(
        "Automated notice from the vigil watchdog on {host}.\n\
         \n\
         Access to the vault was detected, so the scheduled destruction has\n\
         been cancelled. Earlier warnings no longer apply and the inactivity\n\
         countdown has restarted from zero.\n\
         \n\
         The data remains available:\n\
           Windows:   \\\\{host}\\{share}\n\
           macOS:     smb://{host}.local/{share}\n",
        host = ctx.hostname,
        share = ctx.share_name,
    );
    Message { subject, body }
}

pub fn compose_complete(
    ctx: &MessageContext,
    days_elapsed: u64,
    last_access: Option<DateTime<Utc>>,
) -> Message {
    let subject = "[COMPLETE] vault data has been destroyed".to_string();
    let last_access_line = last_access
        .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never recorded".to_string());

    let body = format!(
        "Automated notice from the vigil watchdog on {host}.\n\
         \n\
         The inactivity threshold was reached and the secure wipe has\n\
         completed.\n\
         \n\
         Last access:       {last_access_line}\n\
         Days elapsed:      {days_elapsed}\n\
         Wipe finished at:  {finished}\n\
         \n\
         The encryption key has been destroyed. The ciphertext remains on\n\
         disk but can no longer be decrypted; recovery is not possible.\n\
         Re-provisioning requires a fresh setup with new key material.\n",
        host = ctx.hostname,
        finished = Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
    );
    Message { subject, body }
}

/// Transport that pipes messages into a sendmail-compatible binary.
#[derive(Debug, Clone)]
pub struct MailCommandNotifier {
    runner: CommandRunner,
    from: String,
    to: String,
    context: MessageContext,
}

impl MailCommandNotifier {
    pub fn new(
        mail_command: PathBuf,
        timeout: Duration,
        from: String,
        to: String,
        context: MessageContext,
    ) -> Self {
        Self {
            runner: CommandRunner::new(mail_command, timeout),
            from,
            to,
            context,
        }
    }

    pub fn from_config(config: &VigilConfig) -> Self {
        Self::new(
            PathBuf::from(&config.notify.mail_command),
            config.send_timeout(),
            config.notify.from.clone(),
            config.notify.to.clone(),
            MessageContext::from_config(config),
        )
    }

    fn deliver(&self, message: &Message) -> bool {
        let payload = format!(
            "From: {}\nTo: {}\nSubject: {}\n\n{}",
            self.from, self.to, message.subject, message.body
        );

        match self.runner.run(&["-t"], Some(payload.as_bytes())) {
            Ok(out) if out.success() => {
                info!("notification delivered to {}: {}", self.to, message.subject);
                true
            }
            Ok(out) => {
                error!(
                    "mail command exited with {}: {}",
                    out.status,
                    out.diagnostic()
                );
                false
            }
            Err(err) => {
                error!("mail command failed: {err}");
                false
            }
        }
    }
}

impl Notifier for MailCommandNotifier {
    fn send_warning(
        &self,
        warning_day: u64,
        days_elapsed: u64,
        inactivity_days: u64,
        destruction_at: DateTime<Utc>,
    ) -> bool {
        info!("sending day-{warning_day} warning ({days_elapsed} elapsed)");
        let message = compose_warning(&self.context, days_elapsed, inactivity_days, destruction_at);
        self.deliver(&message)
    }

    fn send_destruction_cancelled(&self) -> bool {
        self.deliver(&compose_cancelled(&self.context))
    }

    fn send_destruction_complete(
        &self,
        days_elapsed: u64,
        last_access: Option<DateTime<Utc>>,
    ) -> bool {
        self.deliver(&compose_complete(&self.context, days_elapsed, last_access))
    }

    fn send_operational_alert(&self, subject: &str, detail: &str) -> bool {
        let message = Message {
            subject: format!("[EMERGENCY] {subject}"),
            body: format!(
                "Automated notice from the vigil watchdog on {}.\n\
                 \n\
                 {detail}\n\
                 \n\
                 Manual intervention is required.\n",
                self.context.hostname
            ),
        };
        self.deliver(&message)
    }
}

impl Notifier for Box<dyn Notifier + Send + Sync> {
    fn send_warning(
        &self,
        warning_day: u64,
        days_elapsed: u64,
        inactivity_days: u64,
        destruction_at: DateTime<Utc>,
    ) -> bool {
        (**self).send_warning(warning_day, days_elapsed, inactivity_days, destruction_at)
    }

    fn send_destruction_cancelled(&self) -> bool {
        (**self).send_destruction_cancelled()
    }

    fn send_destruction_complete(
        &self,
        days_elapsed: u64,
        last_access: Option<DateTime<Utc>>,
    ) -> bool {
        (**self).send_destruction_complete(days_elapsed, last_access)
    }

    fn send_operational_alert(&self, subject: &str, detail: &str) -> bool {
        (**self).send_operational_alert(subject, detail)
    }
}

/// Build the transport the configuration asks for.
pub fn from_config(config: &VigilConfig) -> Box<dyn Notifier + Send + Sync> {
    if config.notify.enabled {
        Box::new(MailCommandNotifier::from_config(config))
    } else {
        Box::new(LogNotifier)
    }
}

/// Stand-in transport used when notifications are disabled.
///
/// Events are logged at WARN and reported as delivered so the ledger still
/// deduplicates levels instead of retrying forever against a void.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send_warning(
        &self,
        warning_day: u64,
        days_elapsed: u64,
        inactivity_days: u64,
        destruction_at: DateTime<Utc>,
    ) -> bool {
        warn!(
            "inactivity warning (day {warning_day}): {days_elapsed}/{inactivity_days} days \
             elapsed, destruction scheduled for {destruction_at} (notifications disabled)"
        );
        true
    }

    fn send_destruction_cancelled(&self) -> bool {
        warn!("destruction cancelled by resumed access (notifications disabled)");
        true
    }

    fn send_destruction_complete(
        &self,
        days_elapsed: u64,
        last_access: Option<DateTime<Utc>>,
    ) -> bool {
        warn!(
            "destruction complete after {days_elapsed} day(s); last access {last_access:?} \
             (notifications disabled)"
        );
        true
    }

    fn send_operational_alert(&self, subject: &str, detail: &str) -> bool {
        error!("operational emergency: {subject}: {detail}");
        true
    }
}
