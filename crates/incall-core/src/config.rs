//! Registry configuration
//!
//! Defaults reproduce the stock dialer timings. Every value can be overridden
//! from TOML:
//!
//! ```toml
//! emergency_callback_window_secs = 600
//! spam_check_enabled = false
//!
//! [retention]
//! local_hangup_ms = 150
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};
use crate::types::DisconnectCode;

/// Longest grace period a disconnected call may be retained
pub const MAX_RETENTION: Duration = Duration::from_secs(60);

/// How long disconnected calls stay visible, per cause category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Hung up on this device
    pub local_hangup_ms: u64,
    /// Hung up remotely, or failed with an error
    pub remote_hangup_ms: u64,
    /// Everything except rejected, missed and canceled calls
    pub default_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            local_hangup_ms: 200,
            remote_hangup_ms: 2_000,
            default_ms: 5_000,
        }
    }
}

impl RetentionConfig {
    /// Grace period for a disconnect cause
    ///
    /// Rejected, missed and canceled calls are never retained.
    pub fn delay_for(&self, code: DisconnectCode) -> Duration {
        match code {
            DisconnectCode::Local => Duration::from_millis(self.local_hangup_ms),
            DisconnectCode::Remote | DisconnectCode::Error => {
                Duration::from_millis(self.remote_hangup_ms)
            }
            DisconnectCode::Rejected | DisconnectCode::Missed | DisconnectCode::Canceled => {
                Duration::ZERO
            }
            _ => Duration::from_millis(self.default_ms),
        }
    }
}

/// Configuration for a [`crate::CallRegistry`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Trailing window after an emergency call during which incoming calls
    /// are treated as potential callbacks
    pub emergency_callback_window_secs: u64,
    pub spam_check_enabled: bool,
    pub block_check_enabled: bool,
    /// Country used for classification lookups when telephony supplies none
    pub default_country_iso: Option<String>,
    /// Capacity of the broadcast channel carrying [`crate::CallListEvent`]s
    pub event_channel_capacity: usize,
    /// Capacity of the owner task's command channel
    pub command_channel_capacity: usize,
    pub retention: RetentionConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            emergency_callback_window_secs: 300,
            spam_check_enabled: true,
            block_check_enabled: true,
            default_country_iso: None,
            event_channel_capacity: 256,
            command_channel_capacity: 256,
            retention: RetentionConfig::default(),
        }
    }
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_emergency_callback_window(mut self, window: Duration) -> Self {
        self.emergency_callback_window_secs = window.as_secs();
        self
    }

    pub fn with_spam_check(mut self, enabled: bool) -> Self {
        self.spam_check_enabled = enabled;
        self
    }

    pub fn with_block_check(mut self, enabled: bool) -> Self {
        self.block_check_enabled = enabled;
        self
    }

    pub fn with_default_country_iso(mut self, iso: impl Into<String>) -> Self {
        self.default_country_iso = Some(iso.into());
        self
    }

    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    pub fn emergency_callback_window(&self) -> Duration {
        Duration::from_secs(self.emergency_callback_window_secs)
    }

    /// Check that the configuration can be used to build a registry
    pub fn validate(&self) -> Result<()> {
        if self.event_channel_capacity == 0 {
            return Err(RegistryError::config("event_channel_capacity must be at least 1"));
        }
        if self.command_channel_capacity == 0 {
            return Err(RegistryError::config("command_channel_capacity must be at least 1"));
        }
        let retention = &self.retention;
        for (name, millis) in [
            ("local_hangup_ms", retention.local_hangup_ms),
            ("remote_hangup_ms", retention.remote_hangup_ms),
            ("default_ms", retention.default_ms),
        ] {
            if Duration::from_millis(millis) > MAX_RETENTION {
                return Err(RegistryError::config(format!(
                    "retention.{} exceeds {}s",
                    name,
                    MAX_RETENTION.as_secs()
                )));
            }
        }
        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| RegistryError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| RegistryError::config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_delays() {
        let retention = RetentionConfig::default();
        assert_eq!(retention.delay_for(DisconnectCode::Local), Duration::from_millis(200));
        assert_eq!(retention.delay_for(DisconnectCode::Remote), Duration::from_secs(2));
        assert_eq!(retention.delay_for(DisconnectCode::Error), Duration::from_secs(2));
        assert_eq!(retention.delay_for(DisconnectCode::Rejected), Duration::ZERO);
        assert_eq!(retention.delay_for(DisconnectCode::Missed), Duration::ZERO);
        assert_eq!(retention.delay_for(DisconnectCode::Canceled), Duration::ZERO);
        assert_eq!(retention.delay_for(DisconnectCode::Busy), Duration::from_secs(5));
        assert_eq!(retention.delay_for(DisconnectCode::Unknown), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RegistryConfig::from_toml_str(
            r#"
            spam_check_enabled = false

            [retention]
            local_hangup_ms = 150
            "#,
        )
        .unwrap();
        assert!(!config.spam_check_enabled);
        assert_eq!(config.retention.local_hangup_ms, 150);
        assert_eq!(config.retention.remote_hangup_ms, 2_000);
        assert_eq!(config.emergency_callback_window(), Duration::from_secs(300));
    }

    #[test]
    fn test_validation() {
        let config = RegistryConfig::new().with_event_channel_capacity(0);
        assert!(config.validate().is_err());

        let config = RegistryConfig::new().with_retention(RetentionConfig {
            default_ms: 120_000,
            ..Default::default()
        });
        assert!(config.validate().is_err());

        assert!(RegistryConfig::from_toml_str("spam_check_enabled = \"yes\"").is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = RegistryConfig::new()
            .with_default_country_iso("GB")
            .with_emergency_callback_window(Duration::from_secs(600));
        let text = config.to_toml_string().unwrap();
        assert_eq!(RegistryConfig::from_toml_str(&text).unwrap(), config);
    }
}
