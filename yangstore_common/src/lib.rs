//! Yangstore Common Library
//!
//! This crate provides the shared vocabulary of the yangstore workspace:
//! constants, configuration loading, the boundary error codes and the core
//! value types (datastore selectors, event kinds, subscription options).
//!
//! # Module Structure
//!
//! - [`consts`] - Shared-memory layout constants and file names
//! - [`config`] - Configuration loading traits and types
//! - [`error`] - Boundary error codes and structured error info
//! - [`types`] - Datastore, event and lock-mode enumerations
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with an alias for shorter imports:
//! ```toml
//! [dependencies]
//! ycommon = { package = "yangstore_common", path = "../yangstore_common" }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod consts;
pub mod error;
pub mod types;

pub use config::{ConfigLoader, ShmConfig};
pub use error::{ErrorCode, ErrorInfo, ErrorItem};
pub use types::{Datastore, EventKind, LockClass, LockMode, NotifKind, SubscrOptions};

/// Initialize tracing for the workspace binaries and tests.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
