//! Error types for Stacker.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Subject resolution failed. Reported to the user, nothing is mutated.
    #[error("Could not find {0}")]
    IdentityNotFound(String),

    /// Command arrived outside a channel (private chat). Never replied to.
    #[error("Command is not supported outside a channel")]
    UnsupportedContext,

    /// Backing engine unreachable or a compound operation could not complete.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Migration conflict in channel {channel}: {reason}")]
    MigrationConflict { channel: String, reason: String },

    #[error("Telegram error: {0}")]
    Telegram(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap an engine failure with the operation that hit it.
    pub fn store(op: &str, err: impl std::fmt::Display) -> Self {
        Error::StoreUnavailable(format!("{}: {}", op, err))
    }
}
