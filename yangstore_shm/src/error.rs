//! Error types for shared memory operations.

use thiserror::Error;
use ycommon::ErrorCode;

/// Errors that can occur during shared memory operations.
#[derive(Error, Debug)]
pub enum ShmError {
    /// Incompatible magic, version or endianness in a mapped file.
    #[error("unsupported SHM layout in '{file}': {reason}")]
    Unsupported {
        /// File the magic header was read from.
        file: String,
        /// What exactly did not match.
        reason: String,
    },

    /// A lock acquisition or a protocol wait expired.
    #[error("timed out after {ms} ms waiting for {what}")]
    TimedOut {
        /// What was being waited for.
        what: &'static str,
        /// Timeout that expired, in milliseconds.
        ms: u64,
    },

    /// An argument does not fit the SHM layout constraints.
    #[error("invalid argument: {what}")]
    InvalidArg {
        /// What was rejected.
        what: String,
    },

    /// A fixed-capacity SHM structure is full.
    #[error("shared memory exhausted: {what}")]
    NoMemory {
        /// The structure that ran out of space.
        what: String,
    },

    /// A named entity was not found in SHM.
    #[error("{what} not found")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// A channel header cell holds a value outside the event enum range.
    #[error("channel '{channel}' corrupted: event kind {value}")]
    Corrupted {
        /// Channel file name.
        channel: String,
        /// The out-of-range cell value.
        value: u32,
    },

    /// IO error.
    #[error("IO error: {source}")]
    Io {
        /// Source IO error.
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error.
    #[error("system call error: {source}")]
    Nix {
        /// Source nix error.
        #[from]
        source: nix::Error,
    },
}

impl ShmError {
    /// Map onto the boundary error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unsupported { .. } => ErrorCode::Unsupported,
            Self::InvalidArg { .. } => ErrorCode::InvalArg,
            Self::TimedOut { .. } => ErrorCode::TimeOut,
            Self::NoMemory { .. } => ErrorCode::NoMemory,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Corrupted { .. } => ErrorCode::Internal,
            Self::Io { .. } | Self::Nix { .. } => ErrorCode::Sys,
        }
    }
}

/// Result type for shared memory operations.
pub type ShmResult<T> = Result<T, ShmError>;
