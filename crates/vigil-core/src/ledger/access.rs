//! Last-access ledger: the sole mechanism for cancelling destruction.

use super::{read_json_tolerant, write_json_atomic};
use crate::error::VigilResult;
use chrono::{DateTime, Duration, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Persisted record of the most recent qualifying access.
///
/// Absence of the document means "never accessed", which is a distinct state
/// from any timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessRecord {
    pub last_access: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

/// Owns the access record and its on-disk document.
#[derive(Debug, Clone)]
pub struct AccessLedger {
    state_file: PathBuf,
}

impl AccessLedger {
    pub fn new(state_file: PathBuf) -> Self {
        Self { state_file }
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Persist a new access instant atomically.
    ///
    /// A persistence failure is propagated to the caller: recording access is
    /// what cancels destruction, so it must never fail silently.
    pub fn record_access(&self, at: Option<DateTime<Utc>>) -> VigilResult<DateTime<Utc>> {
        let last_access = at.unwrap_or_else(Utc::now);
        let record = AccessRecord {
            last_access,
            recorded_at: Utc::now(),
        };
        write_json_atomic(&self.state_file, &record)?;
        info!("recorded access at {last_access}");
        Ok(last_access)
    }

    /// The most recent access, or `None` when never recorded.
    ///
    /// Missing or corrupt documents degrade to `None`.
    pub fn last_access(&self) -> Option<DateTime<Utc>> {
        read_json_tolerant::<AccessRecord>(&self.state_file).map(|record| record.last_access)
    }

    /// Time since the last access, computed fresh on every call.
    pub fn elapsed(&self) -> Option<Duration> {
        self.last_access().map(|at| Utc::now() - at)
    }

    /// Whole days since the last access.
    pub fn days_since_last_access(&self) -> Option<u64> {
        self.elapsed().map(|delta| delta.num_days().max(0) as u64)
    }

    /// The instant destruction becomes due under `inactivity_days`.
    pub fn scheduled_destruction(&self, inactivity_days: u64) -> Option<DateTime<Utc>> {
        self.last_access()
            .map(|at| at + Duration::days(inactivity_days as i64))
    }

    /// Remove the persisted record entirely.
    pub fn clear(&self) -> VigilResult<()> {
        match std::fs::remove_file(&self.state_file) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn absent_record_means_never_accessed() {
        let dir = tempdir().unwrap();
        let ledger = AccessLedger::new(dir.path().join("last_access.json"));
        assert_eq!(ledger.last_access(), None);
        assert_eq!(ledger.elapsed(), None);
        assert_eq!(ledger.days_since_last_access(), None);
        assert_eq!(ledger.scheduled_destruction(30), None);
    }

    #[test]
    fn record_access_round_trips() {
        let dir = tempdir().unwrap();
        let ledger = AccessLedger::new(dir.path().join("last_access.json"));
        let at = Utc::now() - Duration::days(3);

        ledger.record_access(Some(at)).unwrap();
        assert_eq!(ledger.last_access(), Some(at));
        assert_eq!(ledger.days_since_last_access(), Some(3));
    }

    #[test]
    fn scheduled_destruction_is_last_access_plus_threshold() {
        let dir = tempdir().unwrap();
        let ledger = AccessLedger::new(dir.path().join("last_access.json"));
        let at = Utc::now() - Duration::days(10);

        ledger.record_access(Some(at)).unwrap();
        assert_eq!(
            ledger.scheduled_destruction(30),
            Some(at + Duration::days(30))
        );
    }

    #[test]
    fn corrupt_record_degrades_to_never_accessed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("last_access.json");
        fs::write(&path, "{not json").unwrap();

        let ledger = AccessLedger::new(path);
        assert_eq!(ledger.last_access(), None);
    }

    #[test]
    fn record_access_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("state").join("last_access.json");
        let ledger = AccessLedger::new(nested.clone());
        ledger.record_access(None).unwrap();
        assert!(nested.exists());
    }

    #[test]
    fn clear_removes_the_document() {
        let dir = tempdir().unwrap();
        let ledger = AccessLedger::new(dir.path().join("last_access.json"));
        ledger.record_access(None).unwrap();
        ledger.clear().unwrap();
        assert_eq!(ledger.last_access(), None);
        // idempotent on an already-missing file
        ledger.clear().unwrap();
    }
}
