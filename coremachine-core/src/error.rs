use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error taxonomy surfaced to clients and stamped onto
/// dead-lettered messages. Stable: never carries raw internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidParams,
    ResourceMissing,
    Duplicate,
    UnknownHandler,
    HandlerError,
    TransientBrokerError,
    TransientDbError,
    ParentCancelled,
    Poison,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidParams => "invalid_params",
            ErrorKind::ResourceMissing => "resource_missing",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::UnknownHandler => "unknown_handler",
            ErrorKind::HandlerError => "handler_error",
            ErrorKind::TransientBrokerError => "transient_broker_error",
            ErrorKind::TransientDbError => "transient_db_error",
            ErrorKind::ParentCancelled => "parent_cancelled",
            ErrorKind::Poison => "poison",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors for operations on the Postgres-backed message queues.
/// sqlx errors are wrapped to provide command context.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("could not serialize message body: {error}")]
    SerializationError { error: serde_json::Error },
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    OversizeMessage { size: usize, limit: usize },
    #[error("lease for message {id} is no longer held")]
    LeaseLost { id: i64 },
}

/// Errors from the StateManager's transactional transitions.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("{command} transaction failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("finalize for job {job_id} failed: {message}")]
    FinalizeError { job_id: String, message: String },
}

impl From<sqlx::Error> for StateError {
    fn from(error: sqlx::Error) -> Self {
        StateError::TransactionError {
            command: "state".to_owned(),
            error,
        }
    }
}

/// Errors surfaced by the platform submission boundary. Every variant maps
/// onto a stable ErrorKind; internals never leak into responses.
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("missing resource: {0}")]
    ResourceMissing(String),
    #[error("unknown job type {0}")]
    UnknownJobType(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl PlatformError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlatformError::InvalidParams(_) => ErrorKind::InvalidParams,
            PlatformError::ResourceMissing(_) => ErrorKind::ResourceMissing,
            PlatformError::UnknownJobType(_) => ErrorKind::InvalidParams,
            PlatformError::Queue(_) => ErrorKind::TransientBrokerError,
            PlatformError::Database(_) => ErrorKind::TransientDbError,
        }
    }
}

/// Errors from the dispatch kernel's message processing.
#[derive(Error, Debug)]
pub enum MachineError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("job spec error: {0}")]
    Spec(String),
    #[error("blob store error: {0}")]
    Blob(String),
}
