//! Coordinator configuration via `xact.toml`
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working coordinator. Durations are stored as milliseconds.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use xact_core::{Result, XactError};

/// Config file name looked up by applications that keep one next to their data.
pub const CONFIG_FILE_NAME: &str = "xact.toml";

/// Coordinator configuration loaded from `xact.toml`.
///
/// # Example
///
/// ```toml
/// # Timeout applied when `begin` is called without one
/// default_timeout_ms = 10000
/// # Upper bound for caller-specified timeouts
/// max_timeout_ms = 300000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Timeout applied when `begin` is called without one.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Caller-specified timeouts above this are clamped.
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    /// How often the deadline sweeper wakes up.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Terminal transactions whose outcome was never consumed are dropped after this long.
    #[serde(default = "default_reap_after_ms")]
    pub reap_after_ms: u64,
    /// Extra attempts for a prepare that failed with a transient error.
    #[serde(default = "default_prepare_retries")]
    pub prepare_retries: u32,
    /// Dispatch prepare/commit/rollback to adapters in parallel.
    #[serde(default)]
    pub parallel_dispatch: bool,
    /// How long `shutdown` waits for in-flight transactions.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_timeout_ms() -> u64 {
    300_000
}

fn default_sweep_interval_ms() -> u64 {
    100
}

fn default_reap_after_ms() -> u64 {
    60_000
}

fn default_prepare_retries() -> u32 {
    1
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            reap_after_ms: default_reap_after_ms(),
            prepare_retries: default_prepare_retries(),
            parallel_dispatch: false,
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl CoordinatorConfig {
    /// Timeout applied when `begin` is called without one
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Upper bound for caller-specified timeouts
    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    /// Sweeper wake-up interval
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Retention of unconsumed terminal outcomes
    pub fn reap_after(&self) -> Duration {
        Duration::from_millis(self.reap_after_ms)
    }

    /// Grace period for `shutdown`
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Resolve the timeout for a new transaction.
    ///
    /// `None` and zero fall back to the default; anything above the maximum
    /// is clamped.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(t) if !t.is_zero() => t.min(self.max_timeout()),
            _ => self.default_timeout(),
        }
    }

    /// Check the configuration for values the coordinator cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `XactError::Config` if a timeout or interval is zero or the
    /// default timeout exceeds the maximum.
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_ms == 0 {
            return Err(XactError::Config(
                "default_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_timeout_ms < self.default_timeout_ms {
            return Err(XactError::Config(format!(
                "max_timeout_ms ({}) must not be below default_timeout_ms ({})",
                self.max_timeout_ms, self.default_timeout_ms
            )));
        }
        if self.sweep_interval_ms == 0 {
            return Err(XactError::Config(
                "sweep_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# xact coordinator configuration
#
# Timeout applied when a transaction is begun without one (milliseconds)
default_timeout_ms = 10000

# Caller-specified timeouts above this are clamped (milliseconds)
max_timeout_ms = 300000

# How often expired transactions are rolled back (milliseconds)
sweep_interval_ms = 100

# Terminal outcomes nobody consumed are dropped after this long (milliseconds)
reap_after_ms = 60000

# Extra attempts for a prepare that failed with a transient error
prepare_retries = 1

# Dispatch prepare/commit/rollback to all resources in parallel
parallel_dispatch = false

# How long shutdown waits for in-flight transactions (milliseconds)
shutdown_grace_ms = 5000
"#
    }

    /// Parse config from a TOML string and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CoordinatorConfig = toml::from_str(content)
            .map_err(|e| XactError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            XactError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            XactError::Config(msg) => {
                XactError::Config(format!("{} (in '{}')", msg, path.display()))
            }
            other => other,
        })
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                XactError::Internal(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| XactError::Internal(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            XactError::Internal(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
