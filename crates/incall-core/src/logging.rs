//! Logging setup
//!
//! The library only emits `tracing` events, all under the [`REGISTRY_TARGET`]
//! prefix. Binaries call [`setup_logging`] once to install a formatter on
//! stderr; stdout stays free for event output.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::{RegistryError, Result};

/// Target prefix of every event this crate emits
pub const REGISTRY_TARGET: &str = "incall_core";

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level for every target
    pub level: Level,
    /// Level for the registry's own events, when it differs from `level`
    pub registry_level: Option<Level>,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl LoggingConfig {
    pub fn new(level: Level) -> Self {
        LoggingConfig {
            level,
            registry_level: None,
            json: false,
        }
    }

    pub fn with_registry_level(mut self, level: Level) -> Self {
        self.registry_level = Some(level);
        self
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    /// Per-target directive for the registry, if one is configured
    pub fn registry_directive(&self) -> Option<String> {
        self.registry_level
            .map(|level| format!("{}={}", REGISTRY_TARGET, level.as_str().to_ascii_lowercase()))
    }
}

/// Install a global subscriber writing to stderr
///
/// `RUST_LOG` directives are honoured alongside `config`. Fails if a global
/// subscriber is already set.
pub fn setup_logging(config: LoggingConfig) -> Result<()> {
    let mut filter = EnvFilter::from_default_env().add_directive(config.level.into());
    if let Some(directive) = config.registry_directive() {
        let directive = directive
            .parse::<Directive>()
            .map_err(|e| RegistryError::config(format!("Invalid log directive {}: {}", directive, e)))?;
        filter = filter.add_directive(directive);
    }

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = if config.json {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };
    installed.map_err(|e| RegistryError::config(format!("logging already initialised: {}", e)))?;

    tracing::debug!(
        target: REGISTRY_TARGET,
        "Logging initialised at {} (registry {:?})",
        config.level,
        config.registry_level
    );
    Ok(())
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| RegistryError::config(format!("Invalid log level: {}", level)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(parse_log_level("chatty").is_err());
    }

    #[test]
    fn test_registry_directive() {
        assert_eq!(LoggingConfig::new(Level::WARN).registry_directive(), None);
        assert_eq!(
            LoggingConfig::new(Level::INFO)
                .with_registry_level(Level::TRACE)
                .registry_directive()
                .as_deref(),
            Some("incall_core=trace")
        );
    }

    #[test]
    fn test_registry_directive_parses() {
        let config = LoggingConfig::default().with_registry_level(Level::DEBUG).with_json();
        assert!(config.json);
        let directive = config.registry_directive().unwrap();
        assert!(directive.parse::<Directive>().is_ok());
    }
}
