use std::{borrow::Cow, error::Error as StdError, fmt, io};

use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use sqlx::{
    error::{DatabaseError, ErrorKind as DatabaseErrorKind},
    migrate::MigrateError,
    Error as SqlxError,
};
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Custom error: {0}")]
    Custom(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Event payload missing: {0}")]
    MissingPayload(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl From<toml::de::Error> for SyncError {
    fn from(src: toml::de::Error) -> SyncError {
        SyncError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(src: toml::ser::Error) -> SyncError {
        SyncError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<JsonError> for SyncError {
    fn from(src: JsonError) -> SyncError {
        SyncError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<io::Error> for SyncError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => SyncError::NotFound(format!("{x}")),
            _ => SyncError::Io(format!("IOError: {}: {x}", x.kind())),
        }
    }
}

impl From<fmt::Error> for SyncError {
    fn from(x: fmt::Error) -> Self {
        SyncError::Custom(format!("{x}"))
    }
}

impl From<SqlxError> for SyncError {
    fn from(db_error: SqlxError) -> Self {
        match db_error {
            SqlxError::RowNotFound => SyncError::NotFound("database row not found".to_string()),
            other => SyncError::Database(other.to_string()),
        }
    }
}

impl From<MigrateError> for SyncError {
    fn from(migrate_error: MigrateError) -> Self {
        SyncError::Database(format!("migration error: {migrate_error}"))
    }
}

impl From<Elapsed> for SyncError {
    fn from(elapsed: Elapsed) -> Self {
        SyncError::Timeout(format!("{elapsed}"))
    }
}

impl DatabaseError for SyncError {
    fn message(&self) -> &str {
        "docgraph FromRow parsing failure"
    }

    fn kind(&self) -> DatabaseErrorKind {
        DatabaseErrorKind::Other
    }

    /// The extended result code.
    #[inline]
    fn code(&self) -> Option<Cow<'_, str>> {
        None
    }

    #[doc(hidden)]
    fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self
    }

    #[doc(hidden)]
    fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
        self
    }

    #[doc(hidden)]
    fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
        self
    }
}
