//! Error taxonomy for the synchronization core.
//!
//! Request-facing operations return [`Error`]; its [`ErrorKind`] decides
//! whether a failure is the caller's fault or the server's.
//! Transport failures are only ever logged by broadcast paths.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("node {id} was modified concurrently (expected version {expected}, found {actual})")]
    VersionConflict { id: Uuid, expected: u64, actual: u64 },
    #[error("storage failure: {0}")]
    Storage(String),
}

impl RegistryError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broker did not acknowledge {topic} within {timeout:?}")]
    Timeout { topic: String, timeout: Duration },
    #[error("broker rejected publish to {topic}: {reason}")]
    Broker { topic: String, reason: String },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Internal,
    Transport,
}

impl Error {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Internal(_) | Self::Registry(_) | Self::Serialization(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
