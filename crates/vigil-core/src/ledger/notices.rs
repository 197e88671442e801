//! Delivered-warning ledger: at most one send per level per access epoch.

use super::{read_json_tolerant, write_json_atomic};
use crate::error::VigilResult;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Delivery record for a single warning level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SentWarning {
    pub sent: bool,
    pub sent_at: DateTime<Utc>,
    pub days_elapsed: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NoticeDocument {
    warnings: BTreeMap<u64, SentWarning>,
}

/// Owns the notification record and its on-disk document.
///
/// A level is present with `sent = true` iff that warning has been delivered
/// for the current access epoch; `reset_epoch` clears the whole map when a
/// new access is observed.
#[derive(Debug, Clone)]
pub struct NotificationLedger {
    state_file: PathBuf,
}

impl NotificationLedger {
    pub fn new(state_file: PathBuf) -> Self {
        Self { state_file }
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    fn document(&self) -> NoticeDocument {
        read_json_tolerant(&self.state_file).unwrap_or_default()
    }

    pub fn already_sent(&self, warning_day: u64) -> bool {
        self.document()
            .warnings
            .get(&warning_day)
            .map(|record| record.sent)
            .unwrap_or(false)
    }

    /// Warning levels delivered in the current epoch, ascending.
    pub fn sent_days(&self) -> BTreeSet<u64> {
        self.document()
            .warnings
            .iter()
            .filter(|(_, record)| record.sent)
            .map(|(day, _)| *day)
            .collect()
    }

    /// Full delivery records, for status reporting.
    pub fn records(&self) -> BTreeMap<u64, SentWarning> {
        self.document().warnings
    }

    /// Record delivery of `warning_day`. Idempotent: a second call leaves the
    /// ledger byte-identical.
    pub fn mark_sent(&self, warning_day: u64, days_elapsed: u64) -> VigilResult<()> {
        let mut document = self.document();
        if document
            .warnings
            .get(&warning_day)
            .map(|record| record.sent)
            .unwrap_or(false)
        {
            debug!("warning for day {warning_day} already recorded");
            return Ok(());
        }

        document.warnings.insert(
            warning_day,
            SentWarning {
                sent: true,
                sent_at: Utc::now(),
                days_elapsed,
            },
        );
        write_json_atomic(&self.state_file, &document)?;
        info!("recorded warning delivery for day {warning_day}");
        Ok(())
    }

    /// Clear every level, marking the start of a new access epoch.
    ///
    /// Returns whether any level had been delivered before the reset so the
    /// caller can decide to announce the cancelled destruction.
    pub fn reset_epoch(&self) -> VigilResult<bool> {
        let had_sent = !self.sent_days().is_empty();
        write_json_atomic(&self.state_file, &NoticeDocument::default())?;
        if had_sent {
            info!("notification epoch reset; previously delivered warnings cleared");
        }
        Ok(had_sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn nothing_sent_initially() {
        let dir = tempdir().unwrap();
        let ledger = NotificationLedger::new(dir.path().join("notifications.json"));
        assert!(!ledger.already_sent(23));
        assert!(ledger.sent_days().is_empty());
    }

    #[test]
    fn mark_sent_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notifications.json");
        let ledger = NotificationLedger::new(path.clone());

        ledger.mark_sent(23, 23).unwrap();
        let first = fs::read_to_string(&path).unwrap();

        ledger.mark_sent(23, 24).unwrap();
        let second = fs::read_to_string(&path).unwrap();

        assert_eq!(first, second);
        assert!(ledger.already_sent(23));
        assert_eq!(ledger.records().get(&23).unwrap().days_elapsed, 23);
    }

    #[test]
    fn sent_days_tracks_multiple_levels() {
        let dir = tempdir().unwrap();
        let ledger = NotificationLedger::new(dir.path().join("notifications.json"));

        ledger.mark_sent(23, 23).unwrap();
        ledger.mark_sent(27, 27).unwrap();

        let days: Vec<u64> = ledger.sent_days().into_iter().collect();
        assert_eq!(days, vec![23, 27]);
    }

    #[test]
    fn reset_epoch_clears_every_level() {
        let dir = tempdir().unwrap();
        let ledger = NotificationLedger::new(dir.path().join("notifications.json"));

        ledger.mark_sent(23, 23).unwrap();
        ledger.mark_sent(27, 27).unwrap();

        let had_sent = ledger.reset_epoch().unwrap();
        assert!(had_sent);
        assert!(!ledger.already_sent(23));
        assert!(!ledger.already_sent(27));
        assert!(ledger.sent_days().is_empty());
    }

    #[test]
    fn reset_epoch_reports_when_nothing_was_sent() {
        let dir = tempdir().unwrap();
        let ledger = NotificationLedger::new(dir.path().join("notifications.json"));
        assert!(!ledger.reset_epoch().unwrap());
    }

    #[test]
    fn corrupt_document_degrades_to_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notifications.json");
        fs::write(&path, "][").unwrap();

        let ledger = NotificationLedger::new(path);
        assert!(ledger.sent_days().is_empty());
        // a write through the tolerant-empty state recovers the document
        ledger.mark_sent(23, 23).unwrap();
        assert!(ledger.already_sent(23));
    }
}
