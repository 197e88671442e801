//! Core building blocks shared by Vigil binaries.
//!
//! Configuration, ledgers, the escalation policy, and the wipe sequencer live
//! here so the daemon and CLI can focus on operator surfaces instead of
//! reimplementing orchestration.

pub mod command;
pub mod config;
pub mod error;
pub mod fstab;
pub mod ledger;
pub mod logging;
pub mod monitor;
pub mod notify;
pub mod policy;
pub mod privilege;
pub mod system;
pub mod wipe;

pub use config::{VigilConfig, DEFAULT_CONFIG_PATH};
pub use error::{VigilError, VigilResult};
pub use ledger::{AccessLedger, NotificationLedger};
pub use monitor::{Monitor, TickOutcome};
pub use notify::{LogNotifier, MailCommandNotifier, Notifier};
pub use policy::{Action, EscalationPolicy};
pub use system::{OsFacade, SystemFacade, UnmountMode};
pub use wipe::{StepOutcome, WipeOutcome, WipeSequencer, WipeStep};
