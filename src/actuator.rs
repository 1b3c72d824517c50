//! Threshold rules that switch the relay plug on or off.
//!
//! The plug is energized when the latest temperature is above its threshold,
//! or when the latest humidity is above its threshold outside the night
//! window. Commands are absolute (`turn=on` / `turn=off`), so repeating one is
//! harmless and two overlapping runs need no coordination.

use crate::config::{ActuatorConfig, SharedConfig};
use crate::logger::Logger;
use crate::reading::ReadingField;
use crate::scheduler::Job;
use crate::store::{ReadingStore, SettingsStore, StoreError};
use chrono::{Local, Timelike};
use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchCommand {
    On,
    Off,
}

impl SwitchCommand {
    fn turn(self) -> &'static str {
        match self {
            SwitchCommand::On => "on",
            SwitchCommand::Off => "off",
        }
    }
}

impl fmt::Display for SwitchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SwitchCommand::On => "ON",
            SwitchCommand::Off => "OFF",
        })
    }
}

#[derive(Error, Debug)]
pub enum SwitchError {
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("relay answered {0}")]
    Status(StatusCode),
}

/// Something that can put the relay into an absolute state.
pub trait Switch: Send + Sync {
    fn send<'a>(
        &'a self,
        address: &'a str,
        command: SwitchCommand,
    ) -> BoxFuture<'a, Result<(), SwitchError>>;
}

/// Shelly-style relay reached over plain HTTP.
#[derive(Debug, Clone)]
pub struct HttpSwitch {
    client: Client,
}

impl HttpSwitch {
    /// `timeout` bounds the whole request, connect included.
    pub fn new(timeout: Duration) -> Result<Self, SwitchError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(HttpSwitch { client })
    }
}

pub fn command_url(address: &str, command: SwitchCommand) -> String {
    format!("http://{address}/relay/0?turn={}", command.turn())
}

impl Switch for HttpSwitch {
    fn send<'a>(
        &'a self,
        address: &'a str,
        command: SwitchCommand,
    ) -> BoxFuture<'a, Result<(), SwitchError>> {
        Box::pin(async move {
            let response = self.client.get(command_url(address, command)).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(SwitchError::Status(status));
            }
            Ok(())
        })
    }
}

/// Source of the local wall-clock hour.
pub trait Clock: Send + Sync {
    fn local_hour(&self) -> u32;
}

/// The host's local time zone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn local_hour(&self) -> u32 {
        Local::now().hour()
    }
}

/// Hours during which humidity alone never energizes the plug.
///
/// Both bounds are inclusive; a window with `start > end` wraps midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NightWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for NightWindow {
    fn default() -> Self {
        NightWindow {
            start_hour: 21,
            end_hour: 9,
        }
    }
}

impl NightWindow {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            (self.start_hour..=self.end_hour).contains(&hour)
        } else {
            hour >= self.start_hour || hour <= self.end_hour
        }
    }
}

/// Outcome of the threshold rules plus the inputs that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorDecision {
    pub energize: bool,
    pub temperature: f64,
    /// Not read when temperature alone decides
    pub humidity: Option<f64>,
    pub temperature_threshold: f64,
    pub humidity_threshold: f64,
    pub night: bool,
}

impl ActuatorDecision {
    pub fn command(&self) -> SwitchCommand {
        if self.energize {
            SwitchCommand::On
        } else {
            SwitchCommand::Off
        }
    }
}

impl fmt::Display for ActuatorDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: temperature {}°C (threshold {}°C), ",
            self.command(),
            self.temperature,
            self.temperature_threshold
        )?;
        match self.humidity {
            Some(humidity) => write!(f, "humidity {humidity}%")?,
            None => f.write_str("humidity n/a")?,
        }
        write!(
            f,
            " (threshold {}%), night={}",
            self.humidity_threshold, self.night
        )
    }
}

/// Result of one [`ActuatorController::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorOutcome {
    pub decision: ActuatorDecision,
    pub command: SwitchCommand,
    /// `false` when the relay could not be reached; the next run tries again
    pub delivered: bool,
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("no {0} data available")]
    NoData(ReadingField),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ActuatorController {
    config: Arc<SharedConfig>,
    readings: Arc<dyn ReadingStore>,
    settings: Option<Arc<dyn SettingsStore>>,
    switch: Arc<dyn Switch>,
    clock: Arc<dyn Clock>,
    night: NightWindow,
    store_timeout: Duration,
    log: Logger,
}

impl ActuatorController {
    pub fn new(
        config: Arc<SharedConfig>,
        readings: Arc<dyn ReadingStore>,
        switch: Arc<dyn Switch>,
        log: &Logger,
    ) -> Self {
        ActuatorController {
            config,
            readings,
            settings: None,
            switch,
            clock: Arc::new(SystemClock),
            night: NightWindow::default(),
            store_timeout: Duration::from_secs(5),
            log: log.for_target("ruuvi_station::actuator"),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_night_window(mut self, night: NightWindow) -> Self {
        self.night = night;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Re-read the persisted settings at the start of every run and publish
    /// changes to the shared configuration.
    pub fn with_settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Evaluate the rules against the current configuration and latest readings.
    pub async fn decide(&self) -> Result<ActuatorDecision, ControlError> {
        let config = self.current_config().await;
        self.decide_with(&config).await
    }

    /// Decide and send the resulting command.
    ///
    /// Fails only when the decision cannot be made; a relay that cannot be
    /// reached is logged and reported as `delivered: false`.
    pub async fn run(&self) -> Result<ActuatorOutcome, ControlError> {
        let config = self.current_config().await;
        let decision = self.decide_with(&config).await?;
        let command = decision.command();
        self.log.info(format_args!("{decision}"));

        let delivered = match self.switch.send(&config.actuator_address, command).await {
            Ok(()) => {
                self.log.info(format_args!("Plug turned {command}"));
                true
            }
            Err(error) => {
                self.log.error(format_args!(
                    "Failed to turn {command} plug at {}: {error}",
                    config.actuator_address
                ));
                false
            }
        };

        Ok(ActuatorOutcome {
            decision,
            command,
            delivered,
        })
    }

    async fn decide_with(
        &self,
        config: &ActuatorConfig,
    ) -> Result<ActuatorDecision, ControlError> {
        let temperature = self
            .latest(ReadingField::Temperature)
            .await?
            .ok_or(ControlError::NoData(ReadingField::Temperature))?;
        let night = self.night.contains(self.clock.local_hour());

        // Humidity is only read when temperature alone does not decide.
        let (energize, humidity) = if temperature > config.temperature_threshold {
            (true, None)
        } else {
            let humidity = self
                .latest(ReadingField::Humidity)
                .await?
                .ok_or(ControlError::NoData(ReadingField::Humidity))?;
            (humidity > config.humidity_threshold && !night, Some(humidity))
        };

        Ok(ActuatorDecision {
            energize,
            temperature,
            humidity,
            temperature_threshold: config.temperature_threshold,
            humidity_threshold: config.humidity_threshold,
            night,
        })
    }

    /// Snapshot of the shared configuration after applying any edit to the
    /// persisted settings. A settings row that cannot be read or fails
    /// validation is logged and the previous configuration kept.
    async fn current_config(&self) -> ActuatorConfig {
        let Some(settings) = &self.settings else {
            return self.config.snapshot();
        };

        let stored = tokio::time::timeout(self.store_timeout, settings.load_settings())
            .await
            .unwrap_or(Err(StoreError::Timeout(self.store_timeout)));
        match stored {
            Ok(Some(stored)) if stored != self.config.snapshot() => {
                let description = format!("{stored:?}");
                match self.config.update(stored) {
                    Ok(()) => self.log.info(format_args!("settings changed: {description}")),
                    Err(error) => self
                        .log
                        .warn(format_args!("ignoring stored settings: {error}")),
                }
            }
            Ok(_) => {}
            Err(error) => self.log.warn(format_args!(
                "could not read settings, keeping current ones: {error}"
            )),
        }
        self.config.snapshot()
    }

    async fn latest(&self, field: ReadingField) -> Result<Option<f64>, StoreError> {
        tokio::time::timeout(self.store_timeout, self.readings.latest_value(field))
            .await
            .unwrap_or(Err(StoreError::Timeout(self.store_timeout)))
    }
}

impl Job for ActuatorController {
    fn run(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(error) = ActuatorController::run(self).await {
                self.log.error(format_args!(
                    "actuator cycle failed, will retry next cycle: {error}"
                ));
            }
        })
    }
}
