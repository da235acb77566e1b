//! Error types shared by the registry, the event log and the import pipeline.
//!
//! Lifecycle anomalies (a worker that is not running, a forced kill) are not
//! errors here: they are reported through status enums. Only conditions the
//! caller has to act on end up in [`CollectorError`].

use thiserror::Error;

/// Result alias used across the crate
pub type CollectorResult<T> = Result<T, CollectorError>;

/// Comprehensive error type for collector operations.
#[derive(Error, Debug)]
pub enum CollectorError {
    /// A live worker already exists for the session
    #[error("Collector for session '{session_id}' is already running")]
    AlreadyRunning { session_id: String },

    /// No event log has been created for the session yet
    #[error("No chat log found for session '{session_id}'")]
    NoLogFound { session_id: String },

    /// A log name was requested that does not exist in the log directory
    #[error("Chat log '{name}' not found")]
    LogNotFound { name: String },

    /// Session ids end up in file names, so they are restricted
    #[error("Invalid session id '{session_id}'")]
    InvalidSessionId { session_id: String },

    /// Log names must be bare file names produced by this crate
    #[error("Invalid chat log name '{name}'")]
    InvalidLogName { name: String },

    /// The durable store could not complete the operation
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] rusqlite::Error),

    /// Spawning the worker process failed
    #[error("Failed to spawn worker for session '{session_id}': {source}")]
    WorkerSpawn {
        session_id: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error when reading or writing logs
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or unusable configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CollectorError {
    /// Create an already running error
    pub fn already_running(session_id: impl Into<String>) -> Self {
        Self::AlreadyRunning {
            session_id: session_id.into(),
        }
    }

    /// Create a no log found error
    pub fn no_log_found(session_id: impl Into<String>) -> Self {
        Self::NoLogFound {
            session_id: session_id.into(),
        }
    }

    /// Create an invalid session id error
    pub fn invalid_session_id(session_id: impl Into<String>) -> Self {
        Self::InvalidSessionId {
            session_id: session_id.into(),
        }
    }

    /// Create an invalid log name error
    pub fn invalid_log_name(name: impl Into<String>) -> Self {
        Self::InvalidLogName { name: name.into() }
    }
}
