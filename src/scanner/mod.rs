//! Discovery scanner: a power-driven start/stop state machine over a radio.
//!
//! The radio facility (BlueZ in production, a fake in tests) is reached only
//! through the [`Radio`] trait and a channel of [`RadioEvent`]s. The scanner
//! turns power changes into start/stop commands and fans advertisements out to
//! the registered observers, one event at a time, in registration order.

#[cfg(feature = "bluer")]
pub mod bluer;

use crate::logger::Logger;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

/// Channel buffer size for radio events.
pub const EVENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// One broadcast as seen by the radio, before any filtering or decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAdvertisement {
    /// Transport-level identifier (advertised local name)
    pub device_name: String,
    /// Signal strength in dBm
    pub rssi: i16,
    /// Manufacturer data including the company identifier
    pub payload: Vec<u8>,
}

/// Radio power as reported by the facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Powered,
    NotPowered,
}

impl From<bool> for PowerState {
    fn from(powered: bool) -> Self {
        if powered {
            PowerState::Powered
        } else {
            PowerState::NotPowered
        }
    }
}

/// Events delivered serially by the radio facility.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    Power(PowerState),
    Advertisement(RawAdvertisement),
}

/// The radio facility failed to carry out a command.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("radio error: {0}")]
pub struct RadioError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioAction {
    Start,
    Stop,
}

impl fmt::Display for RadioAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioAction::Start => f.write_str("start"),
            RadioAction::Stop => f.write_str("stop"),
        }
    }
}

/// Error type for scanner operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Starting or stopping discovery failed; the scanner keeps its last known state.
    #[error("failed to {action} discovery: {source}")]
    RadioState {
        action: RadioAction,
        #[source]
        source: RadioError,
    },
    /// Could not open the radio facility at all
    #[error("failed to open radio: {0}")]
    Open(#[from] RadioError),
    /// Backend not available (not compiled in)
    #[error("radio backend '{0}' not available (not compiled in)")]
    BackendNotAvailable(String),
}

/// Discovery commands understood by a radio facility.
pub trait Radio: Send + Sync {
    fn start_discovery(&self) -> BoxFuture<'_, Result<(), RadioError>>;
    fn stop_discovery(&self) -> BoxFuture<'_, Result<(), RadioError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
}

/// Observer invoked once per advertisement.
pub type DiscoveryHandler =
    Arc<dyn Fn(Arc<RawAdvertisement>) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct Scanner {
    radio: Arc<dyn Radio>,
    state: AsyncMutex<ScanState>,
    handlers: Mutex<Vec<DiscoveryHandler>>,
    log: Logger,
}

impl Scanner {
    pub fn new(radio: Arc<dyn Radio>, log: &Logger) -> Self {
        Scanner {
            radio,
            state: AsyncMutex::new(ScanState::Idle),
            handlers: Mutex::new(Vec::new()),
            log: log.for_target("ruuvi_station::scanner"),
        }
    }

    /// Register an observer. Observers run in registration order.
    pub fn on_discovery<F>(&self, handler: F)
    where
        F: Fn(Arc<RawAdvertisement>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.push(Arc::new(handler));
        }
    }

    pub async fn state(&self) -> ScanState {
        *self.state.lock().await
    }

    /// Issue a start-discovery command unless already scanning.
    ///
    /// On failure the scanner stays `Idle` so the next power signal retries.
    pub async fn start(&self) -> Result<(), ScanError> {
        let mut state = self.state.lock().await;
        if *state == ScanState::Scanning {
            return Ok(());
        }

        self.radio
            .start_discovery()
            .await
            .map_err(|source| ScanError::RadioState {
                action: RadioAction::Start,
                source,
            })?;
        *state = ScanState::Scanning;
        self.log.info(format_args!("Scanning for BLE devices..."));
        Ok(())
    }

    /// Issue a stop-discovery command unless already idle.
    ///
    /// On failure the scanner stays `Scanning`.
    pub async fn stop(&self) -> Result<(), ScanError> {
        let mut state = self.state.lock().await;
        if *state == ScanState::Idle {
            return Ok(());
        }

        self.radio
            .stop_discovery()
            .await
            .map_err(|source| ScanError::RadioState {
                action: RadioAction::Stop,
                source,
            })?;
        *state = ScanState::Idle;
        self.log.info(format_args!("Stopped BLE scanning"));
        Ok(())
    }

    /// Apply a power signal: powered starts discovery, anything else stops it.
    pub async fn on_power(&self, power: PowerState) -> Result<(), ScanError> {
        match power {
            PowerState::Powered => self.start().await,
            PowerState::NotPowered => self.stop().await,
        }
    }

    /// Invoke every observer for one advertisement, in registration order.
    pub async fn dispatch(&self, advertisement: RawAdvertisement) {
        let handlers: Vec<DiscoveryHandler> = match self.handlers.lock() {
            Ok(handlers) => handlers.clone(),
            Err(_) => return,
        };
        let advertisement = Arc::new(advertisement);
        for handler in handlers {
            handler(advertisement.clone()).await;
        }
    }

    /// Consume radio events until the facility closes the channel.
    ///
    /// Radio failures are logged and never end the loop; advertisements that
    /// arrive while idle are dropped.
    pub async fn run(&self, mut events: mpsc::Receiver<RadioEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                RadioEvent::Power(power) => {
                    self.log
                        .debug(format_args!("radio power changed: {power:?}"));
                    if let Err(error) = self.on_power(power).await {
                        self.log.error(format_args!("{error}"));
                    }
                }
                RadioEvent::Advertisement(advertisement) => {
                    if self.state().await == ScanState::Scanning {
                        self.dispatch(advertisement).await;
                    } else {
                        self.log.debug(format_args!(
                            "dropping advertisement from {} while idle",
                            advertisement.device_name
                        ));
                    }
                }
            }
        }
        self.log.debug(format_args!("radio event stream closed"));
    }
}
