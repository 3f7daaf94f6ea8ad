//! Keepalive configuration.
//!
//! Settings are read from the `[keepalive]` table of a TOML file. Every field
//! has a default, so a missing file or table yields the stock cadence.
//!
//! ```toml
//! [keepalive]
//! message_timeout_ms = 20000
//! min_interval_ms = 20000
//! max_interval_ms = 30000
//! extra_probes = 0
//! ```

mod interval;
mod message_timeout;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use interval::ProbeInterval;
pub use message_timeout::MessageTimeout;

/// Errors from loading or validating keepalive settings
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse keepalive settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid keepalive settings: {message}")]
    Invalid { message: String },
}

impl SettingsError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        SettingsError::Invalid {
            message: message.into(),
        }
    }
}

/// Raw keepalive settings as they appear in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct KeepaliveSettings {
    /// Budget for every request/response wait
    pub message_timeout_ms: u64,
    /// Lower bound of the jittered sleep between keepalive rounds
    pub min_interval_ms: u64,
    /// Upper bound (exclusive) of the jittered sleep
    pub max_interval_ms: u64,
    /// Opportunistic liveness probes to run from the loop after connecting
    pub extra_probes: u32,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            message_timeout_ms: 20_000,
            min_interval_ms: 20_000,
            max_interval_ms: 30_000,
            extra_probes: 0,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    keepalive: KeepaliveSettings,
}

/// Settings after validation, ready to drive a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub message_timeout: MessageTimeout,
    pub interval: ProbeInterval,
    pub extra_probes: u32,
}

impl KeepaliveSettings {
    pub fn validate(&self) -> Result<KeepaliveConfig, SettingsError> {
        let message_timeout =
            MessageTimeout::new(Duration::from_millis(self.message_timeout_ms))?;
        let interval = ProbeInterval::from_millis(self.min_interval_ms, self.max_interval_ms)?;
        Ok(KeepaliveConfig {
            message_timeout,
            interval,
            extra_probes: self.extra_probes,
        })
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            message_timeout: MessageTimeout::default(),
            interval: ProbeInterval::default(),
            extra_probes: 0,
        }
    }
}

/// Parse keepalive settings from TOML text.
pub fn parse_settings(contents: &str) -> Result<KeepaliveSettings, SettingsError> {
    let file: SettingsFile = toml::from_str(contents)?;
    Ok(file.keepalive)
}

/// Load keepalive settings from `path`.
///
/// A missing file is not an error: the defaults apply (zero-config).
pub fn load_settings(path: &Path) -> Result<KeepaliveSettings, SettingsError> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let settings = parse_settings(&contents)?;
            log::info!(
                target: "pulsewire::config",
                "Loaded keepalive settings from {}",
                path.display()
            );
            Ok(settings)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            log::debug!(
                target: "pulsewire::config",
                "No settings file at {}, using defaults",
                path.display()
            );
            Ok(KeepaliveSettings::default())
        }
        Err(source) => Err(SettingsError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}
