// Media Migrator Error Types

use thiserror::Error;

use crate::encoder::EncodeError;

#[derive(Error, Debug)]
pub enum MigratorError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Media item not found: {0}")]
    MediaNotFound(i64),

    #[error("URL map build failed: {0}")]
    MapBuildFailed(String),

    #[error("Rewrite failed for row {row}: {reason}")]
    RewriteRowFailed { row: String, reason: String },

    #[error("Metadata write failed: {0}")]
    MetadataWriteFailed(String),

    #[error("Quarantine failed: {0}")]
    QuarantineFailed(String),

    #[error("Commit failed: {0}")]
    CommitFailed(String),

    #[error("Rollback failed: {0}")]
    RollbackFailed(String),

    #[error("Item {0} is not quarantined")]
    NotQuarantined(i64),

    #[error("Item {0} is not in a failed state")]
    NotRetryable(i64),

    #[error("Another migration run holds the lock (owner {0})")]
    ConcurrentActivation(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Migration is running; stop it first")]
    Running,

    #[error("Payload codec error: {0}")]
    Codec(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, MigratorError>;
