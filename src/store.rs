//! Reading and settings storage.
//!
//! The core needs only two things from storage: insert a reading, and read the
//! most recent value of a field. The same database also holds the actuator
//! settings row, which can be edited while the station runs.
//! [`SqliteStore`] is the persistent implementation; [`MemoryStore`] backs
//! tests and dry runs.

use crate::config::ActuatorConfig;
use crate::mac_address::MacAddress;
use crate::reading::{DecodedReading, ReadingField, SensorReading};
use chrono::DateTime;
use futures::future::BoxFuture;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),
    #[error("storage task failed: {0}")]
    Task(String),
    #[error("storage connection poisoned")]
    Poisoned,
}

/// Write side used by the ingestion pipeline.
pub trait ReadingSink: Send + Sync {
    fn insert(&self, reading: SensorReading) -> BoxFuture<'_, Result<(), StoreError>>;
}

/// Read side used by the actuator controller.
pub trait ReadingStore: Send + Sync {
    /// The given field of the most recently received reading.
    ///
    /// `None` when there are no readings, or the latest one did not report the field.
    fn latest_value(&self, field: ReadingField)
    -> BoxFuture<'_, Result<Option<f64>, StoreError>>;

    fn latest_by_device<'a>(
        &'a self,
        device_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<SensorReading>, StoreError>>;

    /// Total number of stored readings.
    fn count(&self) -> BoxFuture<'_, Result<u64, StoreError>>;
}

/// The single persisted actuator settings record.
pub trait SettingsStore: Send + Sync {
    /// `None` until settings have been saved or seeded.
    fn load_settings(&self) -> BoxFuture<'_, Result<Option<ActuatorConfig>, StoreError>>;

    fn save_settings(&self, settings: ActuatorConfig) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Store `defaults` unless a record already exists, and return the record
    /// that is in effect afterwards.
    fn seed_settings(
        &self,
        defaults: ActuatorConfig,
    ) -> BoxFuture<'_, Result<ActuatorConfig, StoreError>>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sensor_readings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_name TEXT NOT NULL,
    mac TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    temperature REAL NOT NULL,
    humidity REAL,
    pressure INTEGER,
    acceleration_x INTEGER,
    acceleration_y INTEGER,
    acceleration_z INTEGER,
    battery INTEGER NOT NULL,
    tx_power INTEGER NOT NULL,
    movement_counter INTEGER NOT NULL,
    measurement_sequence INTEGER NOT NULL,
    data_format INTEGER NOT NULL,
    rssi INTEGER NOT NULL,
    raw_data BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS sensor_readings_timestamp ON sensor_readings (timestamp);
CREATE INDEX IF NOT EXISTS sensor_readings_device ON sensor_readings (device_name, timestamp);
CREATE TABLE IF NOT EXISTS settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    actuator_address TEXT NOT NULL,
    temperature_threshold REAL NOT NULL,
    humidity_threshold REAL NOT NULL,
    interval_seconds INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;

const COLUMNS: &str = "device_name, mac, timestamp, temperature, humidity, pressure, \
    acceleration_x, acceleration_y, acceleration_z, battery, tx_power, movement_counter, \
    measurement_sequence, data_format, rssi, raw_data";

/// SQLite-backed store. Queries run on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file and make sure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            Ok(f(&conn)?)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn insert_row(conn: &Connection, reading: &SensorReading) -> rusqlite::Result<usize> {
    let d = &reading.decoded;
    conn.execute(
        &format!(
            "INSERT INTO sensor_readings ({COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        ),
        params![
            reading.device_name,
            d.mac.to_string(),
            reading.received_at.timestamp_millis(),
            d.temperature,
            d.humidity,
            d.pressure,
            d.acceleration_x,
            d.acceleration_y,
            d.acceleration_z,
            d.battery_mv,
            d.tx_power,
            d.movement_counter,
            d.measurement_sequence,
            d.data_format,
            reading.rssi,
            reading.raw,
        ],
    )
}

fn reading_from_row(row: &Row<'_>) -> rusqlite::Result<SensorReading> {
    let mac: String = row.get(1)?;
    let mac: MacAddress = mac
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    let millis: i64 = row.get(2)?;
    let received_at = DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(2, millis))?;

    Ok(SensorReading {
        device_name: row.get(0)?,
        received_at,
        rssi: row.get(14)?,
        decoded: DecodedReading {
            temperature: row.get(3)?,
            humidity: row.get(4)?,
            pressure: row.get(5)?,
            acceleration_x: row.get(6)?,
            acceleration_y: row.get(7)?,
            acceleration_z: row.get(8)?,
            battery_mv: row.get(9)?,
            tx_power: row.get(10)?,
            movement_counter: row.get(11)?,
            measurement_sequence: row.get(12)?,
            mac,
            data_format: row.get(13)?,
        },
        raw: row.get(15)?,
    })
}

fn settings_from_row(row: &Row<'_>) -> rusqlite::Result<ActuatorConfig> {
    let interval: i64 = row.get(3)?;
    Ok(ActuatorConfig {
        actuator_address: row.get(0)?,
        temperature_threshold: row.get(1)?,
        humidity_threshold: row.get(2)?,
        interval_seconds: u64::try_from(interval)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(3, interval))?,
    })
}

fn load_settings_row(conn: &Connection) -> rusqlite::Result<Option<ActuatorConfig>> {
    conn.query_row(
        "SELECT actuator_address, temperature_threshold, humidity_threshold, interval_seconds \
         FROM settings WHERE id = 1",
        [],
        settings_from_row,
    )
    .optional()
}

fn write_settings_row(
    conn: &Connection,
    settings: &ActuatorConfig,
    replace: bool,
) -> rusqlite::Result<usize> {
    let verb = if replace { "INSERT OR REPLACE" } else { "INSERT OR IGNORE" };
    let interval = i64::try_from(settings.interval_seconds).unwrap_or(i64::MAX);
    conn.execute(
        &format!(
            "{verb} INTO settings (id, actuator_address, temperature_threshold, \
             humidity_threshold, interval_seconds, updated_at) VALUES (1, ?1, ?2, ?3, ?4, ?5)"
        ),
        params![
            settings.actuator_address,
            settings.temperature_threshold,
            settings.humidity_threshold,
            interval,
            chrono::Utc::now().timestamp_millis(),
        ],
    )
}

impl ReadingSink for SqliteStore {
    fn insert(&self, reading: SensorReading) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.with_conn(move |conn| insert_row(conn, &reading))
                .await
                .map(|_| ())
        })
    }
}

impl ReadingStore for SqliteStore {
    fn latest_value(
        &self,
        field: ReadingField,
    ) -> BoxFuture<'_, Result<Option<f64>, StoreError>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {} FROM sensor_readings ORDER BY timestamp DESC, id DESC LIMIT 1",
                field.column()
            );
            self.with_conn(move |conn| {
                conn.query_row(&sql, [], |row| row.get::<_, Option<f64>>(0))
                    .optional()
                    .map(Option::flatten)
            })
            .await
        })
    }

    fn latest_by_device<'a>(
        &'a self,
        device_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<SensorReading>, StoreError>> {
        let device_name = device_name.to_string();
        Box::pin(async move {
            self.with_conn(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {COLUMNS} FROM sensor_readings WHERE device_name = ?1 \
                         ORDER BY timestamp DESC, id DESC LIMIT 1"
                    ),
                    params![device_name],
                    reading_from_row,
                )
                .optional()
            })
            .await
        })
    }

    fn count(&self) -> BoxFuture<'_, Result<u64, StoreError>> {
        Box::pin(async move {
            self.with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM sensor_readings", [], |row| {
                    row.get::<_, i64>(0)
                })
            })
            .await
            .map(|count| count.max(0) as u64)
        })
    }
}

impl SettingsStore for SqliteStore {
    fn load_settings(&self) -> BoxFuture<'_, Result<Option<ActuatorConfig>, StoreError>> {
        Box::pin(async move { self.with_conn(load_settings_row).await })
    }

    fn save_settings(&self, settings: ActuatorConfig) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.with_conn(move |conn| write_settings_row(conn, &settings, true))
                .await
                .map(|_| ())
        })
    }

    fn seed_settings(
        &self,
        defaults: ActuatorConfig,
    ) -> BoxFuture<'_, Result<ActuatorConfig, StoreError>> {
        Box::pin(async move {
            self.with_conn(move |conn| {
                write_settings_row(conn, &defaults, false)?;
                Ok(load_settings_row(conn)?.unwrap_or(defaults))
            })
            .await
        })
    }
}

/// Readings kept in memory, newest last.
#[derive(Debug, Default)]
pub struct MemoryStore {
    readings: Mutex<Vec<SensorReading>>,
    settings: Mutex<Option<ActuatorConfig>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.readings.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn readings(&self) -> Vec<SensorReading> {
        self.readings.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn latest_matching(&self, keep: impl Fn(&SensorReading) -> bool) -> Option<SensorReading> {
        let readings = self.readings.lock().ok()?;
        // max_by_key keeps the last of equal timestamps, i.e. the newest insert
        readings
            .iter()
            .filter(|r| keep(r))
            .max_by_key(|r| r.received_at)
            .cloned()
    }
}

impl ReadingSink for MemoryStore {
    fn insert(&self, reading: SensorReading) -> BoxFuture<'_, Result<(), StoreError>> {
        let result = self
            .readings
            .lock()
            .map(|mut readings| readings.push(reading))
            .map_err(|_| StoreError::Poisoned);
        Box::pin(async move { result })
    }
}

impl ReadingStore for MemoryStore {
    fn latest_value(
        &self,
        field: ReadingField,
    ) -> BoxFuture<'_, Result<Option<f64>, StoreError>> {
        let value = self
            .latest_matching(|_| true)
            .and_then(|r| field.value_of(&r));
        Box::pin(async move { Ok(value) })
    }

    fn latest_by_device<'a>(
        &'a self,
        device_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<SensorReading>, StoreError>> {
        let latest = self.latest_matching(|r| r.device_name == device_name);
        Box::pin(async move { Ok(latest) })
    }

    fn count(&self) -> BoxFuture<'_, Result<u64, StoreError>> {
        let count = self.len() as u64;
        Box::pin(async move { Ok(count) })
    }
}

impl SettingsStore for MemoryStore {
    fn load_settings(&self) -> BoxFuture<'_, Result<Option<ActuatorConfig>, StoreError>> {
        let settings = self
            .settings
            .lock()
            .map(|s| s.clone())
            .map_err(|_| StoreError::Poisoned);
        Box::pin(async move { settings })
    }

    fn save_settings(&self, settings: ActuatorConfig) -> BoxFuture<'_, Result<(), StoreError>> {
        let result = self
            .settings
            .lock()
            .map(|mut slot| *slot = Some(settings))
            .map_err(|_| StoreError::Poisoned);
        Box::pin(async move { result })
    }

    fn seed_settings(
        &self,
        defaults: ActuatorConfig,
    ) -> BoxFuture<'_, Result<ActuatorConfig, StoreError>> {
        let result = self
            .settings
            .lock()
            .map(|mut slot| slot.get_or_insert(defaults).clone())
            .map_err(|_| StoreError::Poisoned);
        Box::pin(async move { result })
    }
}
