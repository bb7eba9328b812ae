//! Error types shared by the store and the sync pipeline.

use thiserror::Error;

use crate::models::{RemoteEntity, Table};

/// Errors raised by the durable entity store and the outbox.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The outbox append for a mutation failed; the mutation was rolled back.
    #[error("Failed to capture {table} change for '{record_id}': {reason}")]
    Capture {
        table: Table,
        record_id: String,
        reason: String,
    },

    #[error("Record not found: {table}/{id}")]
    NotFound { table: Table, id: String },

    #[error("Record already exists: {table}/{id}")]
    AlreadyExists { table: Table, id: String },

    #[error("'{0}' is not an entity table")]
    NotEntityTable(Table),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while talking to the remote server.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server returned status {0}")]
    ServerStatus(u16),

    #[error("Invalid server response: {0}")]
    Protocol(String),

    #[error("{0} does not accept pushes")]
    NotPushable(RemoteEntity),

    #[error("Sync not configured. Add sync.server_url to config.")]
    NotConfigured,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    pub fn transport(message: impl Into<String>) -> Self {
        SyncError::Transport(message.into())
    }

    /// Transport-class failures leave entries pending and are retried by the
    /// next signal or sweep.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::Timeout | SyncError::ServerStatus(_)
        )
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::Store(StoreError::Database(e))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SyncError::Timeout
        } else if let Some(status) = e.status() {
            SyncError::ServerStatus(status.as_u16())
        } else if e.is_decode() {
            SyncError::Protocol(e.to_string())
        } else {
            SyncError::transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_class_is_retryable() {
        assert!(SyncError::transport("connection reset").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::ServerStatus(503).is_retryable());
        assert!(!SyncError::Protocol("bad json".into()).is_retryable());
        assert!(!SyncError::NotPushable(RemoteEntity::Products).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::NotFound {
            table: Table::Orders,
            id: "o1".into(),
        };
        assert_eq!(err.to_string(), "Record not found: orders/o1");

        let err = SyncError::NotPushable(RemoteEntity::Categories);
        assert_eq!(err.to_string(), "Categories does not accept pushes");
    }
}
