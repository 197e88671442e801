//! Persisted ledgers tracking access history and delivered warnings.
//!
//! Both ledgers are small versionless JSON documents written via atomic
//! replace, so a crashed writer never leaves a reader with a torn record.

mod access;
mod notices;

pub use access::{AccessLedger, AccessRecord};
pub use notices::{NotificationLedger, SentWarning};

use crate::error::{VigilError, VigilResult};
use log::error;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Write `value` to `path` via write-temp-then-rename.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> VigilResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    let payload = serde_json::to_vec_pretty(value)?;
    temp.as_file_mut().write_all(&payload)?;
    temp.as_file_mut().flush()?;
    let _ = temp.as_file().sync_all();
    temp.persist(path).map_err(|err| VigilError::Ledger {
        path: path.to_path_buf(),
        reason: err.error.to_string(),
    })?;
    let _ = sync_parent_dir(parent);
    Ok(())
}

/// Read `path`, degrading missing or corrupt documents to `None`.
///
/// Corruption is logged and never propagated; the caller treats the result
/// as "no record", which is always the safe direction for a watchdog that
/// only destroys on positive evidence of inactivity.
fn read_json_tolerant<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            error!("failed to read ledger {}: {err}", path.display());
            return None;
        }
    };

    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            error!("corrupt ledger {}: {err}", path.display());
            None
        }
    }
}

fn sync_parent_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).and_then(|file| file.sync_all())
}
