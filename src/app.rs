//! Command-line surface and component wiring for `ruuvi-station`.
//!
//! Kept apart from `main` so the whole station can be driven in tests with a
//! fake radio, an in-memory store and a recording relay.

use crate::actuator::{
    ActuatorController, ActuatorOutcome, ControlError, HttpSwitch, NightWindow, Switch,
    SwitchError,
};
use crate::config::{ActuatorConfig, ConfigError, SharedConfig};
use crate::decoder::{self, DecodeError};
use crate::logger::Logger;
use crate::pipeline::IngestionPipeline;
use crate::reading::DecodedReading;
use crate::scanner::{Radio, RadioEvent, ScanError, Scanner};
use crate::scheduler::{ScheduleError, Scheduler};
use crate::store::{ReadingSink, ReadingStore, SettingsStore, SqliteStore, StoreError};
use clap::{Args, Parser, Subcommand};
use std::future::Future;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Advertised name of the tag to record; other devices are ignored.
    #[arg(long, env = "RUUVI_DEVICE_NAME", default_value = "Ruuvi C2A9")]
    pub device_name: String,

    /// SQLite database file. `:memory:` keeps readings for this run only.
    #[arg(long, env = "RUUVI_DATABASE", default_value = "ruuvi_station.db")]
    pub database: PathBuf,

    /// Address of the relay plug, e.g. 192.168.1.111 or plug.lan:8080.
    /// Like the thresholds and interval, it only seeds the stored settings.
    #[arg(long, env = "SMART_PLUG_IP", default_value = "192.168.1.111")]
    pub actuator_address: String,

    /// Energize the plug above this temperature (°C)
    #[arg(long, env = "TEMPERATURE_THRESHOLD", default_value_t = 25.0)]
    pub temperature_threshold: f64,

    /// Energize the plug above this relative humidity (%), outside night hours
    #[arg(long, env = "HUMIDITY_THRESHOLD", default_value_t = 70.0)]
    pub humidity_threshold: f64,

    /// Seconds between actuator runs
    #[arg(
        long,
        env = "SMARTPLUG_INTERVAL",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub interval: u64,

    /// Timeout for relay requests and storage calls.
    /// Accepts duration with suffix: 3s, 1m, 500ms.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub request_timeout: Duration,

    /// First hour (local time, inclusive) of the night window
    #[arg(long, default_value_t = 21, value_parser = clap::value_parser!(u32).range(0..24))]
    pub night_start: u32,

    /// Last hour (local time, inclusive) of the night window
    #[arg(long, default_value_t = 9, value_parser = clap::value_parser!(u32).range(0..24))]
    pub night_end: u32,

    /// Verbose output, log every advertisement and radio event
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Record readings and drive the relay until interrupted (default)
    Listen,
    /// Run the actuator once against the stored readings and exit
    Process,
    /// Decode one manufacturer payload given as hex and print it
    Decode {
        /// Payload including the 0x0499 company id, e.g. 990405...
        payload: String,
    },
    /// Show the stored actuator settings, applying any given changes first
    Settings(SettingsChanges),
}

/// Edits to the stored actuator settings; absent fields are kept.
#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct SettingsChanges {
    /// Address of the relay plug
    #[arg(long)]
    pub address: Option<String>,

    /// Temperature threshold (°C)
    #[arg(long)]
    pub temperature: Option<f64>,

    /// Humidity threshold (%)
    #[arg(long)]
    pub humidity: Option<f64>,

    /// Seconds between actuator runs
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub interval: Option<u64>,
}

impl SettingsChanges {
    pub fn is_empty(&self) -> bool {
        *self == SettingsChanges::default()
    }

    pub fn apply(&self, mut settings: ActuatorConfig) -> ActuatorConfig {
        if let Some(address) = &self.address {
            settings.actuator_address = address.clone();
        }
        if let Some(temperature) = self.temperature {
            settings.temperature_threshold = temperature;
        }
        if let Some(humidity) = self.humidity {
            settings.humidity_threshold = humidity;
        }
        if let Some(interval) = self.interval {
            settings.interval_seconds = interval;
        }
        settings
    }
}

impl Options {
    pub fn actuator_config(&self) -> ActuatorConfig {
        ActuatorConfig {
            actuator_address: self.actuator_address.clone(),
            temperature_threshold: self.temperature_threshold,
            humidity_threshold: self.humidity_threshold,
            interval_seconds: self.interval,
        }
    }

    pub fn night_window(&self) -> NightWindow {
        NightWindow {
            start_hour: self.night_start,
            end_hour: self.night_end,
        }
    }
}

/// Errors that end a command.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Switch(#[from] SwitchError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("invalid hex payload: {0}")]
    InvalidHex(String),
    #[error("relay at {0} did not accept the command")]
    NotDelivered(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Parse a human duration: `500ms`, `3s`, `1m`, `2h`, or bare seconds.
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    fn seconds(n: u64) -> Option<Duration> {
        Some(Duration::from_secs(n))
    }

    // "ms" must be tried before "m" and "s".
    let units: [(&str, fn(u64) -> Option<Duration>); 4] = [
        ("ms", |n| Some(Duration::from_millis(n))),
        ("h", |n| n.checked_mul(3600).map(Duration::from_secs)),
        ("m", |n| n.checked_mul(60).map(Duration::from_secs)),
        ("s", seconds),
    ];
    let (number, to_duration) = units
        .iter()
        .find_map(|&(suffix, to)| src.strip_suffix(suffix).map(|n| (n, to)))
        .unwrap_or((src, seconds as fn(u64) -> Option<Duration>));

    number
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(to_duration)
        .ok_or_else(|| format!("invalid duration: {src}"))
}

/// Parse a hex payload, tolerating `0x` and `:`/`-`/space separators.
pub fn parse_hex(src: &str) -> Result<Vec<u8>, RunError> {
    let src = src.trim();
    let src = src
        .strip_prefix("0x")
        .or_else(|| src.strip_prefix("0X"))
        .unwrap_or(src);
    let digits: Vec<u8> = src
        .bytes()
        .filter(|b| !matches!(b, b':' | b'-' | b' '))
        .collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(RunError::InvalidHex(format!(
            "expected an even number of hex digits, got {}",
            digits.len()
        )));
    }

    digits
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| RunError::InvalidHex(String::from_utf8_lossy(pair).into_owned()))
        })
        .collect()
}

fn write_reading(reading: &DecodedReading, out: &mut dyn Write) -> io::Result<()> {
    fn or_na<T: ToString>(value: Option<T>) -> String {
        value.map_or_else(|| "n/a".to_string(), |v| v.to_string())
    }

    writeln!(out, "mac: {}", reading.mac)?;
    writeln!(out, "data format: {}", reading.data_format)?;
    writeln!(out, "temperature: {} °C", reading.temperature)?;
    writeln!(out, "humidity: {} %", or_na(reading.humidity))?;
    writeln!(out, "pressure: {} Pa", or_na(reading.pressure))?;
    writeln!(
        out,
        "acceleration: x={} y={} z={} mG",
        or_na(reading.acceleration_x),
        or_na(reading.acceleration_y),
        or_na(reading.acceleration_z)
    )?;
    writeln!(out, "battery: {} mV", reading.battery_mv)?;
    writeln!(out, "tx power: {} dBm", reading.tx_power)?;
    writeln!(out, "movement counter: {}", reading.movement_counter)?;
    writeln!(out, "measurement sequence: {}", reading.measurement_sequence)
}

/// The `decode` command.
pub fn decode_command(payload: &str, out: &mut dyn Write) -> Result<DecodedReading, RunError> {
    let bytes = parse_hex(payload)?;
    decoder::ensure_v5(&bytes)?;
    let reading = decoder::decode(&bytes)?;
    write_reading(&reading, out)?;
    Ok(reading)
}

/// Storage, live configuration and the controller shared by every command.
pub struct Services {
    pub config: Arc<SharedConfig>,
    pub sink: Arc<dyn ReadingSink>,
    pub readings: Arc<dyn ReadingStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub controller: Arc<ActuatorController>,
}

impl Services {
    /// Open the SQLite database and an HTTP relay client per `options`.
    pub async fn open(options: &Options, log: &Logger) -> Result<Self, RunError> {
        let store = Arc::new(SqliteStore::open(&options.database)?);
        let switch = Arc::new(HttpSwitch::new(options.request_timeout)?);
        Self::new(options, store, switch, log).await
    }

    /// Wire the services over one store.
    ///
    /// The flags and environment only seed the settings row; once a row
    /// exists it wins, and the controller re-reads it before every run.
    pub async fn new<S>(
        options: &Options,
        store: Arc<S>,
        switch: Arc<dyn Switch>,
        log: &Logger,
    ) -> Result<Self, RunError>
    where
        S: ReadingSink + ReadingStore + SettingsStore + 'static,
    {
        let settings = store.seed_settings(options.actuator_config()).await?;
        let config = Arc::new(SharedConfig::new(settings)?);
        let controller = ActuatorController::new(config.clone(), store.clone(), switch, log)
            .with_settings(store.clone())
            .with_night_window(options.night_window())
            .with_store_timeout(options.request_timeout);

        Ok(Services {
            config,
            sink: store.clone(),
            readings: store.clone(),
            settings: store,
            controller: Arc::new(controller),
        })
    }
}

/// The `process` command: one actuator run, reported on `out`.
pub async fn process(
    services: &Services,
    out: &mut dyn Write,
) -> Result<ActuatorOutcome, RunError> {
    let outcome = services.controller.run().await?;
    writeln!(out, "{}", outcome.decision)?;
    if !outcome.delivered {
        return Err(RunError::NotDelivered(
            services.config.snapshot().actuator_address,
        ));
    }
    Ok(outcome)
}

/// The `settings` command: apply `changes` to the stored settings and print
/// the resulting record. Without changes the record is only shown.
pub async fn settings_command(
    options: &Options,
    store: &dyn SettingsStore,
    changes: &SettingsChanges,
    out: &mut dyn Write,
) -> Result<ActuatorConfig, RunError> {
    let settings = changes.apply(store.seed_settings(options.actuator_config()).await?);
    if !changes.is_empty() {
        settings.validate()?;
        store.save_settings(settings.clone()).await?;
    }

    writeln!(out, "actuator address: {}", settings.actuator_address)?;
    writeln!(out, "temperature threshold: {} °C", settings.temperature_threshold)?;
    writeln!(out, "humidity threshold: {} %", settings.humidity_threshold)?;
    writeln!(out, "interval: {}s", settings.interval_seconds)?;
    Ok(settings)
}

/// The `listen` command.
///
/// Records readings from `options.device_name` and runs the actuator on its
/// interval until the radio closes `events` or `shutdown` completes. On the
/// way out scanning is stopped and any in-flight actuator run is awaited.
pub async fn listen<F>(
    options: &Options,
    services: &Services,
    radio: Arc<dyn Radio>,
    events: mpsc::Receiver<RadioEvent>,
    shutdown: F,
    log: &Logger,
) -> Result<(), RunError>
where
    F: Future<Output = ()>,
{
    let app_log = log.for_target("ruuvi_station::app");
    match services.readings.count().await {
        Ok(count) => app_log.info(format_args!("{count} readings in storage")),
        Err(error) => app_log.warn(format_args!("could not count stored readings: {error}")),
    }

    let scanner = Scanner::new(radio, log);
    let pipeline = Arc::new(IngestionPipeline::new(
        options.device_name.clone(),
        services.sink.clone(),
        options.request_timeout,
        log,
    ));
    pipeline.attach(&scanner);

    let scheduler = Arc::new(Scheduler::new(services.controller.clone(), log));
    scheduler.start(services.config.snapshot().interval_seconds)?;
    let follower = tokio::spawn({
        let scheduler = scheduler.clone();
        let changes = services.config.subscribe();
        async move { scheduler.follow(changes).await }
    });

    app_log.info(format_args!("listening for {}", options.device_name));
    tokio::select! {
        _ = scanner.run(events) => app_log.warn(format_args!("radio event stream ended")),
        _ = shutdown => app_log.info(format_args!("shutting down")),
    }

    follower.abort();
    if let Err(error) = scanner.stop().await {
        app_log.error(format_args!("{error}"));
    }
    scheduler.shutdown().await;
    Ok(())
}

type RadioParts = (Arc<dyn Radio>, mpsc::Receiver<RadioEvent>);

#[cfg(feature = "bluer")]
async fn open_radio(log: &Logger) -> Result<RadioParts, RunError> {
    let (radio, events) = crate::scanner::bluer::BluerRadio::open(log)
        .await
        .map_err(ScanError::from)?;
    let radio: Arc<dyn Radio> = radio;
    Ok((radio, events))
}

#[cfg(not(feature = "bluer"))]
async fn open_radio(_log: &Logger) -> Result<RadioParts, RunError> {
    Err(ScanError::BackendNotAvailable("bluer".to_string()).into())
}

async fn ctrl_c(log: Logger) {
    if let Err(error) = tokio::signal::ctrl_c().await {
        log.error(format_args!("cannot listen for Ctrl+C: {error}"));
        futures::future::pending::<()>().await;
    }
}

/// Run the selected command against real hardware and storage.
pub async fn run(options: Options, out: &mut dyn Write) -> Result<(), RunError> {
    let log = Logger::global();
    match options.command.clone().unwrap_or(Command::Listen) {
        Command::Decode { payload } => decode_command(&payload, out).map(|_| ()),
        Command::Settings(changes) => {
            let store = SqliteStore::open(&options.database)?;
            settings_command(&options, &store, &changes, out)
                .await
                .map(|_| ())
        }
        Command::Process => {
            let services = Services::open(&options, &log).await?;
            process(&services, out).await.map(|_| ())
        }
        Command::Listen => {
            let services = Services::open(&options, &log).await?;
            let (radio, events) = open_radio(&log).await?;
            listen(&options, &services, radio, events, ctrl_c(log.clone()), &log).await
        }
    }
}
