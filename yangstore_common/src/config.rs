//! Configuration loading traits and types.
//!
//! Provides a standardized way to load TOML configuration files across the
//! yangstore crates, plus the [`ShmConfig`] every SHM consumer needs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at the specified path.
    #[error("configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Shared-memory configuration used by every process attaching to the same
/// daemon instance. All attached processes must agree on `run_dir`.
///
/// # TOML Example
///
/// ```toml
/// [shm]
/// run_dir = "/dev/shm/yangstore"
/// max_modules = 128
/// apply_timeout_ms = 5000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShmConfig {
    /// Directory holding all SHM files of one daemon instance.
    pub run_dir: PathBuf,

    /// Upper bound on registered modules before main-SHM growth stops.
    #[serde(default = "default_max_modules")]
    pub max_modules: usize,

    /// Publisher wait per delivery wave, in milliseconds.
    #[serde(default = "default_apply_timeout_ms")]
    pub apply_timeout_ms: u64,

    /// Registry `subs_lock` acquisition timeout, in milliseconds.
    #[serde(default = "default_subs_lock_timeout_ms")]
    pub subs_lock_timeout_ms: u64,

    /// Per-kind SHM sublock acquisition timeout, in milliseconds.
    #[serde(default = "default_shm_lock_timeout_ms")]
    pub shm_lock_timeout_ms: u64,
}

fn default_max_modules() -> usize {
    1024
}

fn default_apply_timeout_ms() -> u64 {
    consts::APPLY_TIMEOUT_MS
}

fn default_subs_lock_timeout_ms() -> u64 {
    consts::SUBS_LOCK_TIMEOUT_MS
}

fn default_shm_lock_timeout_ms() -> u64 {
    consts::SHM_SUB_LOCK_TIMEOUT_MS
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from(consts::DEFAULT_RUN_DIR),
            max_modules: default_max_modules(),
            apply_timeout_ms: default_apply_timeout_ms(),
            subs_lock_timeout_ms: default_subs_lock_timeout_ms(),
            shm_lock_timeout_ms: default_shm_lock_timeout_ms(),
        }
    }
}

impl ShmConfig {
    /// Default configuration with the run directory taken from the
    /// `YANGSTORE_SHM_DIR` environment variable when set.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(dir) = std::env::var(consts::RUN_DIR_ENV) {
            cfg.run_dir = PathBuf::from(dir);
        }
        cfg
    }

    /// Configuration rooted at an explicit run directory. Used by tests.
    pub fn with_run_dir(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
            ..Self::default()
        }
    }

    /// Publisher wave timeout as a [`Duration`].
    #[inline]
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    /// Registry lock timeout as a [`Duration`].
    #[inline]
    pub fn subs_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.subs_lock_timeout_ms)
    }

    /// SHM sublock timeout as a [`Duration`].
    #[inline]
    pub fn shm_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.shm_lock_timeout_ms)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `run_dir` is empty, no
    /// module can be registered, or any timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "run_dir cannot be empty".to_string(),
            ));
        }
        if self.max_modules == 0 {
            return Err(ConfigError::ValidationError(
                "max_modules must be at least 1".to_string(),
            ));
        }
        if self.apply_timeout_ms == 0 || self.subs_lock_timeout_ms == 0 || self.shm_lock_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load and parse the configuration file at `path`.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound);
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl ConfigLoader for ShmConfig {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        assert!(ShmConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let cfg = ShmConfig {
            apply_timeout_ms: 0,
            ..ShmConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shm.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "run_dir = \"/tmp/ys-test\"").unwrap();
        writeln!(f, "apply_timeout_ms = 1234").unwrap();

        let cfg = ShmConfig::load(&path).unwrap();
        assert_eq!(cfg.run_dir, PathBuf::from("/tmp/ys-test"));
        assert_eq!(cfg.apply_timeout_ms, 1234);
        assert_eq!(cfg.max_modules, 1024);
    }

    #[test]
    fn missing_file_is_reported() {
        let err = ShmConfig::load(Path::new("/nonexistent/shm.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound));
    }
}
