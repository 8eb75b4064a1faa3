//! Configuration loading and validation.
//!
//! Precedence, highest first: environment overrides, then the TOML file,
//! then built-in defaults. The file path comes from
//! `STRAYLIGHT_CONFIG_PATH` or falls back to `./straylight.toml`; a
//! missing file is not an error.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::debug;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "STRAYLIGHT_CONFIG_PATH";

/// Environment override for [`Limits::max_queue_len`].
pub const MAX_QUEUE_LEN_ENV: &str = "STRAYLIGHT_MAX_QUEUE_LEN";

/// Environment override for [`Limits::max_names_per_connection`].
pub const MAX_NAMES_ENV: &str = "STRAYLIGHT_MAX_NAMES";

/// Resource limits applied to every connection on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Limits {
    /// Maximum envelopes a connection's inbound queue may hold.
    #[serde(default = "default_max_queue_len")]
    pub max_queue_len: usize,

    /// Maximum well-known names a single connection may own.
    #[serde(default = "default_max_names")]
    pub max_names_per_connection: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_queue_len: default_max_queue_len(),
            max_names_per_connection: default_max_names(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Per-connection resource limits.
    #[serde(default)]
    pub limits: Limits,
}

// Default value functions for serde

fn default_max_queue_len() -> usize {
    1024
}
fn default_max_names() -> usize {
    256
}

impl Config {
    /// Load configuration with full precedence: environment overrides on
    /// top of the file (if present) on top of defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed,
    /// or if an environment override is not a valid number.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from the resolved file path, or defaults when
    /// no file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from_file() -> anyhow::Result<Self> {
        let path = config_path_with(|key| std::env::var(key).ok());
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "failed to read config at {}: {e}",
                    path.display()
                ))
            }
        };
        let config: Config = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Apply environment overrides from the given lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a set variable does not parse as a number.
    pub fn apply_overrides(
        &mut self,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        if let Some(raw) = env(MAX_QUEUE_LEN_ENV) {
            self.limits.max_queue_len = raw
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid {MAX_QUEUE_LEN_ENV}='{raw}': {e}"))?;
        }
        if let Some(raw) = env(MAX_NAMES_ENV) {
            self.limits.max_names_per_connection = raw
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid {MAX_NAMES_ENV}='{raw}': {e}"))?;
        }
        Ok(())
    }
}

/// Resolve the config file path from the given environment lookup.
pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
    env(CONFIG_PATH_ENV)
        .map_or_else(|| PathBuf::from("straylight.toml"), PathBuf::from)
}
