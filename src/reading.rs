//! Decoded RuuviTag frames and the persisted readings built from them.

use crate::mac_address::MacAddress;
use chrono::{DateTime, Utc};
use std::fmt;

/// Wire format version understood by [`crate::decoder::decode`].
pub const DATA_FORMAT_V5: u8 = 5;

/// One decoded data format 5 frame.
///
/// Units follow the wire format rather than SI:
/// - Temperature in Celsius, 0.005 °C resolution
/// - Humidity in percent (0-100)
/// - Pressure in Pascals
/// - Acceleration per axis in milli-g
/// - Battery voltage in millivolts
/// - TX power in dBm
///
/// Fields the tag marks as "not reported" are `None`, never zero.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedReading {
    pub temperature: f64,
    pub humidity: Option<f64>,
    pub pressure: Option<u32>,
    pub acceleration_x: Option<i16>,
    pub acceleration_y: Option<i16>,
    pub acceleration_z: Option<i16>,
    pub battery_mv: u16,
    pub tx_power: i8,
    /// Wraps at 255
    pub movement_counter: u8,
    /// Wraps at 65535
    pub measurement_sequence: u16,
    pub mac: MacAddress,
    pub data_format: u8,
}

/// A decoded frame plus the context it was received in.
///
/// Built once per accepted discovery event and never modified afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    /// Transport-level identifier (advertised local name)
    pub device_name: String,
    pub received_at: DateTime<Utc>,
    /// Signal strength of the advertisement in dBm
    pub rssi: i16,
    pub decoded: DecodedReading,
    /// Manufacturer payload exactly as received, for reprocessing
    pub raw: Vec<u8>,
}

/// Reading fields the actuator decision depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingField {
    Temperature,
    Humidity,
}

impl ReadingField {
    pub fn column(self) -> &'static str {
        match self {
            ReadingField::Temperature => "temperature",
            ReadingField::Humidity => "humidity",
        }
    }

    /// Value of this field in a stored reading, if the tag reported it.
    pub fn value_of(self, reading: &SensorReading) -> Option<f64> {
        match self {
            ReadingField::Temperature => Some(reading.decoded.temperature),
            ReadingField::Humidity => reading.decoded.humidity,
        }
    }
}

impl fmt::Display for ReadingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}
