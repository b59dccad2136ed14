use thiserror::Error;

/// Failures surfaced by a [`MessageStore`](crate::storage::MessageStore).
#[derive(Error, Debug)]
pub enum StoreError {
    /// The client offset is already in the log. Nothing was written.
    #[error("Client offset {0} already stored")]
    DuplicateKey(String),
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::DuplicateKey(_))
    }
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
