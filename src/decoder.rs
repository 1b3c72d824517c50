//! Decoder for the RuuviTag data format 5 manufacturer payload.
//!
//! The payload is taken exactly as the radio delivers it, including the
//! two-byte company identifier, so field offsets start at 3:
//!
//! | Offset | Field | Encoding |
//! |---|---|---|
//! | 0-1 | company id | `0x99 0x04` (Ruuvi, little-endian) |
//! | 2 | data format | `5` |
//! | 3-4 | temperature | i16, 0.005 °C |
//! | 5-6 | humidity | u16, 0.0025 %, `0xFFFF` = not reported |
//! | 7-8 | pressure | u16, +50000 Pa, `0xFFFF` = not reported |
//! | 9-14 | acceleration x/y/z | i16 mg, `0x8000` = not reported |
//! | 15-16 | power info | 11 bits battery (+1600 mV), 5 bits tx power (2 dBm steps from -40) |
//! | 17 | movement counter | u8 |
//! | 18-19 | measurement sequence | u16 |
//! | 20-25 | MAC | 6 octets |
//!
//! See <https://github.com/ruuvi/ruuvi-sensor-protocols>.

use crate::mac_address::MacAddress;
use crate::reading::{DATA_FORMAT_V5, DecodedReading};
use thiserror::Error;

/// Shortest payload that carries every data format 5 field.
pub const MIN_PAYLOAD_LEN: usize = 26;

/// Ruuvi Innovations company identifier.
pub const RUUVI_MANUFACTURER_ID: u16 = 0x0499;

const FORMAT_OFFSET: usize = 2;
const MAC_OFFSET: usize = 20;

const ABSENT_UNSIGNED: [u8; 2] = [0xFF, 0xFF];
const ABSENT_ACCELERATION: [u8; 2] = [0x80, 0x00];

/// Error types for decoding RuuviTag data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload too short: {len} bytes, need at least {}", MIN_PAYLOAD_LEN)]
    TooShort { len: usize },
    #[error("unsupported data format {0} (only format 5 is decoded)")]
    UnsupportedFormat(u8),
}

/// Check the format byte before handing a payload to [`decode`].
///
/// [`decode`] itself assumes format 5; callers that receive arbitrary
/// manufacturer data filter other versions out here.
pub fn ensure_v5(payload: &[u8]) -> Result<(), DecodeError> {
    match payload.get(FORMAT_OFFSET) {
        None => Err(DecodeError::TooShort { len: payload.len() }),
        Some(&DATA_FORMAT_V5) => Ok(()),
        Some(&other) => Err(DecodeError::UnsupportedFormat(other)),
    }
}

/// Decode a data format 5 payload.
///
/// Pure and deterministic: the same bytes always decode to the same reading.
pub fn decode(payload: &[u8]) -> Result<DecodedReading, DecodeError> {
    if payload.len() < MIN_PAYLOAD_LEN {
        return Err(DecodeError::TooShort { len: payload.len() });
    }

    let pair = |offset: usize| [payload[offset], payload[offset + 1]];

    let (battery_mv, tx_power) = power_info(u16::from_be_bytes(pair(15)));

    Ok(DecodedReading {
        temperature: f64::from(signed(pair(3))) / 200.0,
        humidity: unsigned_or_absent(pair(5)).map(|raw| f64::from(raw) / 400.0),
        pressure: unsigned_or_absent(pair(7)).map(|raw| u32::from(raw) + 50_000),
        acceleration_x: acceleration(pair(9)),
        acceleration_y: acceleration(pair(11)),
        acceleration_z: acceleration(pair(13)),
        battery_mv,
        tx_power,
        movement_counter: payload[17],
        measurement_sequence: u16::from_be_bytes(pair(18)),
        mac: MacAddress::from_slice_at(payload, MAC_OFFSET)
            .ok_or(DecodeError::TooShort { len: payload.len() })?,
        data_format: DATA_FORMAT_V5,
    })
}

/// Big-endian two's-complement: values above 32767 wrap to negative.
fn signed(bytes: [u8; 2]) -> i16 {
    i16::from_be_bytes(bytes)
}

fn unsigned_or_absent(bytes: [u8; 2]) -> Option<u16> {
    (bytes != ABSENT_UNSIGNED).then(|| u16::from_be_bytes(bytes))
}

// Sentinel is checked before the signed conversion; 0x8000 would otherwise be -32768.
fn acceleration(bytes: [u8; 2]) -> Option<i16> {
    (bytes != ABSENT_ACCELERATION).then(|| signed(bytes))
}

fn power_info(raw: u16) -> (u16, i8) {
    let battery_mv = (raw >> 5) + 1600;
    // 5 bits, so at most 31 * 2 - 40 = 22
    let tx_power = ((raw & 0x1F) as i8) * 2 - 40;
    (battery_mv, tx_power)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{KNOWN_PAYLOAD, payload_with};

    #[test]
    fn known_vector_matches_hand_decoded_values() {
        let reading = decode(&KNOWN_PAYLOAD).unwrap();

        // 0x0DD3 = 3539 / 200
        assert_eq!(reading.temperature, 17.695);
        // 0x7071 = 28785 / 400
        assert_eq!(reading.humidity, Some(71.9625));
        // 0xC325 = 49957 + 50000
        assert_eq!(reading.pressure, Some(99_957));
        assert_eq!(reading.acceleration_x, Some(-376));
        assert_eq!(reading.acceleration_y, Some(-968));
        assert_eq!(reading.acceleration_z, Some(-144));
        // 0xAC56 = 44118: 44118 >> 5 = 1378, low bits 22
        assert_eq!(reading.battery_mv, 2978);
        assert_eq!(reading.tx_power, 4);
        assert_eq!(reading.movement_counter, 174);
        assert_eq!(reading.measurement_sequence, 2799);
        assert_eq!(reading.mac.to_string(), "F3:30:FE:2F:C2:A9");
        assert_eq!(reading.data_format, 5);
    }

    #[test]
    fn decoding_is_deterministic() {
        let first = decode(&KNOWN_PAYLOAD).unwrap();
        let second = decode(&KNOWN_PAYLOAD).unwrap();
        assert_eq!(first, second);

        let edited = payload_with(&[(3, 0x80), (4, 0x00), (9, 0x7F), (10, 0xFF)]);
        assert_eq!(decode(&edited), decode(&edited));
    }

    #[test]
    fn temperature_twos_complement_boundaries() {
        let max = decode(&payload_with(&[(3, 0x7F), (4, 0xFF)])).unwrap();
        assert_eq!(max.temperature, 163.835);

        let min = decode(&payload_with(&[(3, 0x80), (4, 0x00)])).unwrap();
        assert_eq!(min.temperature, -163.84);

        let zero = decode(&payload_with(&[(3, 0x00), (4, 0x00)])).unwrap();
        assert_eq!(zero.temperature, 0.0);
    }

    #[test]
    fn humidity_and_pressure_sentinels_are_absent_not_zero() {
        let reading = decode(&payload_with(&[(5, 0xFF), (6, 0xFF), (7, 0xFF), (8, 0xFF)])).unwrap();
        assert_eq!(reading.humidity, None);
        assert_eq!(reading.pressure, None);

        let zeros = decode(&payload_with(&[(5, 0x00), (6, 0x00), (7, 0x00), (8, 0x00)])).unwrap();
        assert_eq!(zeros.humidity, Some(0.0));
        assert_eq!(zeros.pressure, Some(50_000));
    }

    #[test]
    fn acceleration_sentinel_per_axis() {
        let x_absent = decode(&payload_with(&[(9, 0x80), (10, 0x00)])).unwrap();
        assert_eq!(x_absent.acceleration_x, None);
        assert_eq!(x_absent.acceleration_y, Some(-968));

        let y_absent = decode(&payload_with(&[(11, 0x80), (12, 0x00)])).unwrap();
        assert_eq!(y_absent.acceleration_y, None);

        let z_absent = decode(&payload_with(&[(13, 0x80), (14, 0x00)])).unwrap();
        assert_eq!(z_absent.acceleration_z, None);
        assert_eq!(z_absent.acceleration_x, Some(-376));

        // Neighbouring pattern is a real value
        let near = decode(&payload_with(&[(9, 0x80), (10, 0x01)])).unwrap();
        assert_eq!(near.acceleration_x, Some(-32767));
    }

    #[test]
    fn power_info_extremes() {
        let low = decode(&payload_with(&[(15, 0x00), (16, 0x00)])).unwrap();
        assert_eq!(low.battery_mv, 1600);
        assert_eq!(low.tx_power, -40);

        let high = decode(&payload_with(&[(15, 0xFF), (16, 0xFF)])).unwrap();
        assert_eq!(high.battery_mv, 1600 + 2047);
        assert_eq!(high.tx_power, 22);
    }

    #[test]
    fn short_payload_is_rejected() {
        assert_eq!(
            decode(&KNOWN_PAYLOAD[..25]),
            Err(DecodeError::TooShort { len: 25 })
        );
        assert_eq!(decode(&[]), Err(DecodeError::TooShort { len: 0 }));
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut long = KNOWN_PAYLOAD.to_vec();
        long.extend_from_slice(&[1, 2, 3]);
        assert_eq!(decode(&long), decode(&KNOWN_PAYLOAD));
    }

    #[test]
    fn ensure_v5_checks_format_byte() {
        assert_eq!(ensure_v5(&KNOWN_PAYLOAD), Ok(()));
        assert_eq!(
            ensure_v5(&payload_with(&[(2, 3)])),
            Err(DecodeError::UnsupportedFormat(3))
        );
        assert_eq!(ensure_v5(&[0x99, 0x04]), Err(DecodeError::TooShort { len: 2 }));
    }

    #[test]
    fn decode_error_display() {
        assert_eq!(
            DecodeError::TooShort { len: 4 }.to_string(),
            "payload too short: 4 bytes, need at least 26"
        );
        assert_eq!(
            DecodeError::UnsupportedFormat(6).to_string(),
            "unsupported data format 6 (only format 5 is decoded)"
        );
    }
}
