//! Configuration types and loading for askpass-relay.
//!
//! Configuration is loaded from `~/.config/askpass-relay/config.toml`.
//!
//! # Error Handling
//!
//! - If the config file doesn't exist, default values are returned.
//! - If the config file exists but is invalid, an error is returned (fail fast).
//!
//! # Example Configuration
//!
//! ```toml
//! [timeouts]
//! prompt_secs = 60            # per askpass round trip
//! invocation_secs = 600       # total wall clock per git command
//! grace_millis = 2000         # SIGTERM -> SIGKILL window
//!
//! [termination]
//! max_passes = 5
//! poll_interval_millis = 50
//!
//! [helpers]
//! askpass = "/usr/libexec/askpass-relay/askpass-client"
//! setsid = "/usr/libexec/askpass-relay/askpass-setsid"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// File name of the askpass helper binary.
pub const ASKPASS_BIN: &str = "askpass-client";

/// File name of the session helper binary.
pub const SETSID_BIN: &str = "askpass-setsid";

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A timeout or pass count was configured as zero.
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    /// A helper binary could not be located.
    #[error("helper binary {0} not found; set [helpers] in the config file")]
    HelperNotFound(&'static str),
}

/// Main configuration struct.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    /// Timeout configuration.
    pub timeouts: TimeoutConfig,
    /// Process tree termination configuration.
    pub termination: TerminationConfig,
    /// Helper binary locations.
    pub helpers: HelperConfig,
}

/// Timeouts. Every prompt and every invocation is bounded.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Seconds the relay waits for the credential callback (default: 60).
    pub prompt_secs: u64,
    /// Total wall-clock seconds per invocation (default: 600).
    pub invocation_secs: u64,
    /// Milliseconds between the graceful and the forced kill (default: 2000).
    pub grace_millis: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            prompt_secs: 60,
            invocation_secs: 600,
            grace_millis: 2000,
        }
    }
}

/// Settings for the process tree controller.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TerminationConfig {
    /// Kill passes before giving up with a partial termination (default: 5).
    pub max_passes: u32,
    /// Milliseconds between liveness checks (default: 50).
    pub poll_interval_millis: u64,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            max_passes: 5,
            poll_interval_millis: 50,
        }
    }
}

/// Helper binary locations. Unset paths are looked up next to the current
/// executable.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct HelperConfig {
    /// Path of the askpass helper.
    pub askpass: Option<PathBuf>,
    /// Path of the session helper (ignored on Windows).
    pub setsid: Option<PathBuf>,
}

impl RelayConfig {
    /// Returns the default configuration file path.
    ///
    /// Returns `~/.config/askpass-relay/config.toml` using `dirs::config_dir()`,
    /// or `None` if the config directory cannot be determined.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("askpass-relay").join("config.toml"))
    }

    /// Load configuration from the default path.
    ///
    /// - Returns `Ok(RelayConfig::default())` if no config file exists.
    /// - Returns `Err` if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would disable a mandatory timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeouts.prompt_secs == 0 {
            return Err(ConfigError::ZeroValue("timeouts.prompt_secs"));
        }
        if self.timeouts.invocation_secs == 0 {
            return Err(ConfigError::ZeroValue("timeouts.invocation_secs"));
        }
        if self.termination.max_passes == 0 {
            return Err(ConfigError::ZeroValue("termination.max_passes"));
        }
        Ok(())
    }

    /// How long the relay waits for one credential answer.
    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.prompt_secs)
    }

    /// Total wall-clock budget of one invocation.
    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.invocation_secs)
    }

    /// Window between graceful and forced termination.
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.timeouts.grace_millis)
    }

    /// Interval between liveness checks during termination.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.termination.poll_interval_millis.max(1))
    }

    /// Resolve the askpass helper path.
    ///
    /// Resolution order:
    /// 1. `[helpers] askpass` from config
    /// 2. `askpass-client` next to the current executable
    pub fn askpass_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.helpers.askpass {
            Some(path) => Ok(path.clone()),
            None => sibling_binary(ASKPASS_BIN).ok_or(ConfigError::HelperNotFound(ASKPASS_BIN)),
        }
    }

    /// Resolve the session helper path, if one is available.
    ///
    /// Without a session helper the spawner falls back to placing the child
    /// in a new process group directly.
    pub fn setsid_path(&self) -> Option<PathBuf> {
        if cfg!(windows) {
            return None;
        }
        self.helpers
            .setsid
            .clone()
            .or_else(|| sibling_binary(SETSID_BIN))
    }
}

/// Find `name` in the directory of the current executable.
fn sibling_binary(name: &str) -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let candidate = exe
        .parent()?
        .join(format!("{}{}", name, std::env::consts::EXE_SUFFIX));
    candidate.is_file().then_some(candidate)
}
