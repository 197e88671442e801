//! Error taxonomy shared across the workspace.

use std::path::PathBuf;
use thiserror::Error;

pub type VigilResult<T> = Result<T, VigilError>;

#[derive(Debug, Error)]
pub enum VigilError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("ledger write failed for {path}: {reason}")]
    Ledger { path: PathBuf, reason: String },

    #[error("{0}")]
    System(String),

    #[error("wipe safety check failed: {0}")]
    Unsafe(String),

    #[error("key destruction failed for {path}: {reason}")]
    KeyDestruction { path: PathBuf, reason: String },

    #[error("insufficient privileges: {0}")]
    Privilege(String),

    #[error(transparent)]
    TomlParse(#[from] toml::de::Error),

    #[error(transparent)]
    TomlRender(#[from] toml::ser::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
