//! Error taxonomy shared by the store, queue, sync manager and gateway.
use thiserror::Error;

use crate::remote::TransportError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Local persistence is broken (disk full, corruption, schema drift).
    /// Never retried; always surfaced to the caller.
    #[error("storage fault: {0}")]
    StorageFault(String),

    /// No connectivity and the caller asked for `force_online`, or nothing
    /// local could stand in for the remote answer.
    #[error("offline: {0}")]
    Offline(String),

    /// The remote authority answered with a non-2xx status.
    #[error("remote rejected request ({status}): {message}")]
    RemoteRejected { status: u16, message: String },

    /// Network flake or timeout.
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// A mutation exhausted its retry budget and now lives in the conflict list.
    #[error("retry budget exhausted for mutation {id}")]
    ConflictExceeded { id: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageFault(message.into())
    }

    pub fn is_storage_fault(&self) -> bool {
        matches!(self, Self::StorageFault(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::StorageFault(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::StorageFault(format!("migration failed: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::StorageFault(format!("corrupt stored value: {err}"))
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Status { code, body } => Self::RemoteRejected {
                status: code,
                message: body,
            },
            TransportError::Decode(message) => Self::RemoteRejected {
                status: 200,
                message: format!("undecodable response: {message}"),
            },
            TransportError::Network(message) => Self::TransientNetwork(message),
            TransportError::Timeout => Self::TransientNetwork("request timed out".into()),
        }
    }
}
