//! Error type of the subscription layer.

use thiserror::Error;
use ycommon::{ErrorCode, ErrorInfo};
use yangstore_shm::ShmError;

/// Errors returned by the subscription context and the delivery engine.
#[derive(Error, Debug)]
pub enum SubscrError {
    /// Shared-memory layer failure.
    #[error(transparent)]
    Shm(#[from] ShmError),

    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalArg(String),

    /// Item already exists.
    #[error("already exists: {0}")]
    Exists(String),

    /// Item not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A lock could not be taken within its timeout.
    #[error("locked: {0}")]
    Locked(String),

    /// One or more application callbacks failed; the chained error list is
    /// what the engine aggregated across waves.
    #[error("callback failed: {0}")]
    Callback(ErrorInfo),

    /// The operation itself failed; carries the aggregated errors.
    #[error("operation failed: {0}")]
    Operation(ErrorInfo),
}

impl SubscrError {
    /// Map onto the boundary error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Shm(e) => e.code(),
            Self::InvalArg(_) => ErrorCode::InvalArg,
            Self::Exists(_) => ErrorCode::Exists,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Locked(_) => ErrorCode::Locked,
            Self::Callback(info) => info
                .first()
                .and_then(|e| e.error_code())
                .unwrap_or(ErrorCode::CallbackFailed),
            Self::Operation(_) => ErrorCode::OperationFailed,
        }
    }

    /// The chained error list, when the failure carries one.
    pub fn error_info(&self) -> Option<&ErrorInfo> {
        match self {
            Self::Callback(info) | Self::Operation(info) => Some(info),
            _ => None,
        }
    }
}

/// Result type of the subscription layer.
pub type SubscrResult<T> = Result<T, SubscrError>;
