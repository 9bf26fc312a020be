//! Bus configuration
//!
//! All knobs have defaults matching the behavior the bus was tuned for; a JSON
//! document only needs to name the fields it overrides:
//!
//! ```text
//! { "identity_attempts": 3, "relay_mode": "always" }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default number of identity-resolution attempts.
pub const DEFAULT_IDENTITY_ATTEMPTS: u32 = 10;

/// Default delay between identity-resolution attempts.
pub const DEFAULT_IDENTITY_DELAY_MS: u64 = 200;

/// Default SeenIdCache size. Far above the number of calls a context keeps in flight.
pub const DEFAULT_SEEN_CAPACITY: usize = 4096;

/// Default SeenIdCache horizon. Must exceed the longest relay delay of a duplicate.
pub const DEFAULT_SEEN_TTL_SECS: u64 = 600;

/// Default largest serialized envelope the host accepts (64 MiB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Default number of undrained fire-and-forget failures a runtime keeps.
pub const DEFAULT_REPORT_CAPACITY: usize = 256;

/// Default URL prefix of privileged extension pages.
pub const DEFAULT_EXTENSION_ORIGIN: &str = "ctxbus-extension://";

/// Errors that can occur loading a configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Which relay heuristic the broker uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Host delivers frame → extension parent directly; skip relaying those.
    Chromium,
    /// Host delivers nothing directly; relay every context-to-context message.
    Always,
}

/// Configuration shared by every runtime on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub identity_attempts: u32,
    pub identity_delay_ms: u64,
    pub seen_capacity: usize,
    pub seen_ttl_secs: u64,
    pub max_message_bytes: usize,
    pub relay_mode: RelayMode,
    pub extension_origin: String,
    /// Kinds a non-background context ignores silently when unhandled
    pub silent_kinds: Vec<String>,
    pub capture_backtraces: bool,
    /// Undrained error reports kept; the oldest is dropped past this
    pub report_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            identity_attempts: DEFAULT_IDENTITY_ATTEMPTS,
            identity_delay_ms: DEFAULT_IDENTITY_DELAY_MS,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            seen_ttl_secs: DEFAULT_SEEN_TTL_SECS,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            relay_mode: RelayMode::Chromium,
            extension_origin: DEFAULT_EXTENSION_ORIGIN.to_string(),
            silent_kinds: vec![crate::bus::kinds::TAB_ID.to_string()],
            capture_backtraces: false,
            report_capacity: DEFAULT_REPORT_CAPACITY,
        }
    }
}

impl BusConfig {
    /// Parse and validate a JSON config document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: BusConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "identity_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.seen_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "seen_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.seen_ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "seen_ttl_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_message_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_message_bytes",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.report_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "report_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.extension_origin.is_empty() {
            return Err(ConfigError::Invalid {
                field: "extension_origin",
                reason: "cannot be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn identity_delay(&self) -> Duration {
        Duration::from_millis(self.identity_delay_ms)
    }

    pub fn seen_ttl(&self) -> Duration {
        Duration::from_secs(self.seen_ttl_secs)
    }

    pub fn is_silent_kind(&self, kind: &str) -> bool {
        self.silent_kinds.iter().any(|k| k == kind)
    }
}
