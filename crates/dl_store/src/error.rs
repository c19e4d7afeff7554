use thiserror::Error;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(
        "Database schema version {stored} is newer than this build supports ({expected}); \
         it was written by a newer Darklock release, please upgrade"
    )]
    IncompatibleSchemaVersion { stored: i64, expected: i64 },

    #[error("Could not acquire a database connection: {0}")]
    ConnectionAcquire(#[source] r2d2::Error),

    #[error("Could not build the connection pool: {0}")]
    Pool(#[source] r2d2::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database has been closed")]
    Closed,

    #[error("Invalid connection source: {0}")]
    InvalidConnectionSource(&'static str),

    #[error("Invalid identity key: {0}")]
    InvalidIdentityKey(String),

    #[error("Unknown trust level ordinal {0}")]
    InvalidTrustLevel(i64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl StoreError {
    /// Everyday storage failures the triggering feature may retry.
    /// Schema conflicts, a closed engine and programming errors are fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionAcquire(_) | StoreError::Database(_) | StoreError::Io(_)
        )
    }
}
