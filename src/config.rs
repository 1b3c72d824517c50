//! Live actuator configuration.
//!
//! The controller and scheduler take a fresh [`SharedConfig::snapshot`] on
//! every cycle, so an [`SharedConfig::update`] applies from the next run on
//! without restarting anything.

use std::sync::RwLock;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorConfig {
    /// Host (and optional port) of the relay plug, e.g. `192.168.1.111`
    pub actuator_address: String,
    /// °C
    pub temperature_threshold: f64,
    /// %
    pub humidity_threshold: f64,
    /// Seconds between scheduled runs, at least 1
    pub interval_seconds: u64,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        ActuatorConfig {
            actuator_address: "192.168.1.111".to_string(),
            temperature_threshold: 25.0,
            humidity_threshold: 70.0,
            interval_seconds: 60,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("interval must be at least 1 second, got {0}")]
    InvalidInterval(u64),
    #[error("actuator address must not be empty")]
    EmptyAddress,
}

impl ActuatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_seconds < 1 {
            return Err(ConfigError::InvalidInterval(self.interval_seconds));
        }
        if self.actuator_address.trim().is_empty() {
            return Err(ConfigError::EmptyAddress);
        }
        Ok(())
    }
}

/// Process-wide configuration record, readable and updatable at runtime.
#[derive(Debug)]
pub struct SharedConfig {
    current: RwLock<ActuatorConfig>,
    changes: watch::Sender<ActuatorConfig>,
}

impl SharedConfig {
    pub fn new(initial: ActuatorConfig) -> Result<Self, ConfigError> {
        initial.validate()?;
        let (changes, _) = watch::channel(initial.clone());
        Ok(SharedConfig {
            current: RwLock::new(initial),
            changes,
        })
    }

    /// Consistent copy of the whole record.
    pub fn snapshot(&self) -> ActuatorConfig {
        match self.current.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the record; invalid records are refused and the old one kept.
    pub fn update(&self, next: ActuatorConfig) -> Result<(), ConfigError> {
        next.validate()?;
        match self.current.write() {
            Ok(mut current) => *current = next.clone(),
            Err(poisoned) => *poisoned.into_inner() = next.clone(),
        }
        self.changes.send_replace(next);
        Ok(())
    }

    /// Receiver that observes every accepted update.
    pub fn subscribe(&self) -> watch::Receiver<ActuatorConfig> {
        self.changes.subscribe()
    }
}
