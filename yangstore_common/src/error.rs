//! Boundary error codes and structured error information.
//!
//! Error codes are the stable vocabulary visible at the library boundary and
//! inside event-channel reply records. Structured errors carry an optional
//! format identifier plus opaque data so applications can transport their
//! own error encodings; unknown codes are preserved verbatim.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes visible at the library boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ErrorCode {
    /// No error.
    Ok = 0,
    /// Invalid argument.
    InvalArg = 1,
    /// Error generated by the schema engine.
    Ly = 2,
    /// System function call failed.
    Sys = 3,
    /// Not enough memory.
    NoMemory = 4,
    /// Item not found.
    NotFound = 5,
    /// Item already exists.
    Exists = 6,
    /// Other internal error.
    Internal = 7,
    /// Unsupported operation or incompatible SHM layout.
    Unsupported = 8,
    /// Validation of the changes failed.
    ValidationFailed = 9,
    /// An operation failed.
    OperationFailed = 10,
    /// Operation not authorized.
    Unauthorized = 11,
    /// Requested resource is already locked.
    Locked = 12,
    /// Time out has expired.
    TimeOut = 13,
    /// User callback failure caused the operation to fail.
    CallbackFailed = 14,
    /// User callback has not processed the event and will do so on some
    /// future event processing.
    CallbackShelve = 15,
}

impl ErrorCode {
    /// Convert from a raw `u32`. Returns `None` for unknown codes, which
    /// are still transported verbatim inside [`ErrorItem`].
    #[inline]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::InvalArg),
            2 => Some(Self::Ly),
            3 => Some(Self::Sys),
            4 => Some(Self::NoMemory),
            5 => Some(Self::NotFound),
            6 => Some(Self::Exists),
            7 => Some(Self::Internal),
            8 => Some(Self::Unsupported),
            9 => Some(Self::ValidationFailed),
            10 => Some(Self::OperationFailed),
            11 => Some(Self::Unauthorized),
            12 => Some(Self::Locked),
            13 => Some(Self::TimeOut),
            14 => Some(Self::CallbackFailed),
            15 => Some(Self::CallbackShelve),
            _ => None,
        }
    }
}

/// A single, detailed error message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message} (code {code})")]
pub struct ErrorItem {
    /// Raw error code. Known values map onto [`ErrorCode`]; unknown
    /// application codes are carried through unchanged.
    pub code: u32,
    /// Human-readable message.
    pub message: String,
    /// Error format identifier, if the application set one.
    pub format_id: Option<String>,
    /// Opaque error data specific to `format_id`.
    pub opaque_data: Option<serde_json::Value>,
}

impl ErrorItem {
    /// Create an error item from a known code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code as u32,
            message: message.into(),
            format_id: None,
            opaque_data: None,
        }
    }

    /// Create an error item from a raw application code, preserved
    /// verbatim even when it is not a known [`ErrorCode`].
    pub fn from_raw(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            format_id: None,
            opaque_data: None,
        }
    }

    /// The known error code, if any.
    #[inline]
    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_u32(self.code)
    }

    /// Whether this item requests a shelve rather than reporting a failure.
    #[inline]
    pub fn is_shelve(&self) -> bool {
        self.code == ErrorCode::CallbackShelve as u32
    }
}

/// Accumulated error information of one session or one engine operation.
/// The engine chains wave errors into this list; the first entry is the
/// error returned to the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// All generated errors, in generation order.
    pub errors: Vec<ErrorItem>,
}

impl ErrorInfo {
    /// An empty error list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one error.
    pub fn push(&mut self, item: ErrorItem) {
        self.errors.push(item);
    }

    /// Append all errors of another list.
    pub fn extend(&mut self, other: ErrorInfo) {
        self.errors.extend(other.errors);
    }

    /// Whether any error was recorded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// The first recorded error, which is what operations return.
    pub fn first(&self) -> Option<&ErrorItem> {
        self.errors.first()
    }
}

impl From<ErrorItem> for ErrorInfo {
    fn from(item: ErrorItem) -> Self {
        Self { errors: vec![item] }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.errors.as_slice() {
            [] => write!(f, "no error"),
            [first] => write!(f, "{first}"),
            [first, rest @ ..] => write!(f, "{first} (+{} more)", rest.len()),
        }
    }
}

impl std::error::Error for ErrorInfo {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_round_trip() {
        for raw in 0..16u32 {
            let code = ErrorCode::from_u32(raw).unwrap();
            assert_eq!(code as u32, raw);
        }
        assert!(ErrorCode::from_u32(16).is_none());
    }

    #[test]
    fn unknown_code_is_preserved() {
        let item = ErrorItem::from_raw(4242, "application specific");
        assert_eq!(item.code, 4242);
        assert!(item.error_code().is_none());
        assert!(!item.is_shelve());
    }

    #[test]
    fn shelve_is_detected() {
        let item = ErrorItem::new(ErrorCode::CallbackShelve, "later");
        assert!(item.is_shelve());
    }

    #[test]
    fn info_chains_and_returns_first() {
        let mut info = ErrorInfo::new();
        info.push(ErrorItem::new(ErrorCode::CallbackFailed, "verifier denied"));
        info.push(ErrorItem::new(ErrorCode::TimeOut, "wave timeout"));
        assert_eq!(info.first().unwrap().code, ErrorCode::CallbackFailed as u32);
        assert_eq!(info.errors.len(), 2);
    }
}
