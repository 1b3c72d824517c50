//! MAC address carried inside a Ruuvi data format 5 frame.
//!
//! The frame embeds the tag's own MAC in its last six octets. It is kept
//! separate from the transport-level device identifier, which for BlueZ is
//! the advertised local name and may legitimately differ.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Six raw octets, rendered as uppercase colon-separated hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Copy the six octets starting at `offset`, or `None` if the slice is too short.
    pub fn from_slice_at(data: &[u8], offset: usize) -> Option<Self> {
        let octets: [u8; 6] = data.get(offset..offset + 6)?.try_into().ok()?;
        Some(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Errors returned when parsing a MAC address string.
#[derive(Error, Debug, PartialEq)]
pub enum ParseMacError {
    #[error("invalid MAC address: expected 6 octets, got {0}")]
    WrongOctetCount(usize),
    #[error("invalid MAC address: '{0}' is not a two-digit hex octet")]
    BadOctet(String),
}

impl FromStr for MacAddress {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 6 {
            return Err(ParseMacError::WrongOctetCount(parts.len()));
        }

        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(ParseMacError::BadOctet(part.to_string()));
            }
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| ParseMacError::BadOctet(part.to_string()))?;
        }

        Ok(MacAddress(octets))
    }
}
