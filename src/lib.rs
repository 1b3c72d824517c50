//! `ruuvi-station` library.
//!
//! Records readings broadcast by one RuuviTag into SQLite and switches a relay
//! plug on or off from the latest temperature and humidity.
//!
//! The binary (`src/main.rs`) is responsible for logger setup and process exit
//! codes. Command wiring lives in [`crate::app`] where it can be tested with an
//! injected radio, store and relay.

pub mod actuator;
pub mod app;
pub mod config;
pub mod decoder;
pub mod logger;
pub mod mac_address;
pub mod pipeline;
pub mod reading;
pub mod scanner;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use actuator::{ActuatorController, ActuatorDecision, HttpSwitch, Switch, SwitchCommand};
pub use config::{ActuatorConfig, SharedConfig};
pub use decoder::{DecodeError, decode};
pub use logger::Logger;
pub use mac_address::MacAddress;
pub use pipeline::IngestionPipeline;
pub use reading::{DecodedReading, ReadingField, SensorReading};
pub use scanner::{RawAdvertisement, ScanError, Scanner};
pub use scheduler::Scheduler;
pub use store::{MemoryStore, ReadingSink, ReadingStore, SettingsStore, SqliteStore};
