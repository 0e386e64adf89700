//! Health Thermometer measurement data structures.
//!
//! Parses the binary layout shared by the Temperature Measurement (`2A1C`)
//! and Intermediate Temperature (`2A1E`) characteristics, the Temperature
//! Type (`2A1D`) code and the Measurement Interval (`2A21`).

use chrono::{NaiveDate, NaiveDateTime};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::float::MedicalFloat;
use crate::utils::{celsius_to_fahrenheit, fahrenheit_to_celsius, read_u16_le, read_u32_le};

const FLAG_FAHRENHEIT: u8 = 0x01;
const FLAG_TIMESTAMP: u8 = 0x02;
const FLAG_TEMPERATURE_TYPE: u8 = 0x04;

/// Unit a measurement was reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TemperatureUnit {
    /// Degrees Celsius.
    #[default]
    Celsius,
    /// Degrees Fahrenheit.
    Fahrenheit,
}

/// Body location of a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TemperatureType {
    /// Armpit.
    Armpit,
    /// Body (general).
    Body,
    /// Ear, usually earlobe.
    Ear,
    /// Finger.
    Finger,
    /// Gastro-intestinal tract.
    GastroIntestinal,
    /// Mouth.
    Mouth,
    /// Rectum.
    Rectum,
    /// Toe.
    Toe,
    /// Tympanum (ear drum).
    Tympanum,
}

impl TemperatureType {
    /// Decode the one-byte location code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::Armpit,
            2 => Self::Body,
            3 => Self::Ear,
            4 => Self::Finger,
            5 => Self::GastroIntestinal,
            6 => Self::Mouth,
            7 => Self::Rectum,
            8 => Self::Toe,
            9 => Self::Tympanum,
            _ => return None,
        })
    }

    /// The one-byte location code.
    pub fn code(&self) -> u8 {
        match self {
            Self::Armpit => 1,
            Self::Body => 2,
            Self::Ear => 3,
            Self::Finger => 4,
            Self::GastroIntestinal => 5,
            Self::Mouth => 6,
            Self::Rectum => 7,
            Self::Toe => 8,
            Self::Tympanum => 9,
        }
    }
}

impl std::fmt::Display for TemperatureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Armpit => "Armpit",
            Self::Body => "Body",
            Self::Ear => "Ear",
            Self::Finger => "Finger",
            Self::GastroIntestinal => "Gastro-intestinal",
            Self::Mouth => "Mouth",
            Self::Rectum => "Rectum",
            Self::Toe => "Toe",
            Self::Tympanum => "Tympanum",
        };
        f.write_str(name)
    }
}

/// A parsed temperature measurement.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TemperatureMeasurement {
    /// The temperature as reported, in `unit`. `None` for special values
    /// (NaN, infinity, not at resolution).
    pub value: Option<f64>,
    /// Unit of `value`.
    pub unit: TemperatureUnit,
    /// Time stamp supplied by the thermometer, if any.
    pub timestamp: Option<NaiveDateTime>,
    /// Measurement location, if supplied.
    pub temperature_type: Option<TemperatureType>,
}

impl TemperatureMeasurement {
    /// Parse a measurement payload.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let flags = *data.first().ok_or_else(|| Error::InvalidData {
            context: "empty temperature measurement".to_string(),
        })?;

        let bits = read_u32_le(data, 1).ok_or_else(|| Error::InvalidData {
            context: format!("temperature measurement too short: {} bytes", data.len()),
        })?;
        let value = MedicalFloat::from_bits(bits).value();

        let unit = if flags & FLAG_FAHRENHEIT != 0 {
            TemperatureUnit::Fahrenheit
        } else {
            TemperatureUnit::Celsius
        };

        let mut offset = 5;

        let timestamp = if flags & FLAG_TIMESTAMP != 0 {
            let timestamp = parse_date_time(data, offset)?;
            offset += 7;
            timestamp
        } else {
            None
        };

        let temperature_type = if flags & FLAG_TEMPERATURE_TYPE != 0 {
            let code = *data.get(offset).ok_or_else(|| Error::InvalidData {
                context: "temperature type flag set but byte missing".to_string(),
            })?;
            TemperatureType::from_code(code)
        } else {
            None
        };

        Ok(Self {
            value,
            unit,
            timestamp,
            temperature_type,
        })
    }

    /// The temperature in degrees Celsius.
    pub fn celsius(&self) -> Option<f64> {
        match self.unit {
            TemperatureUnit::Celsius => self.value,
            TemperatureUnit::Fahrenheit => self.value.map(fahrenheit_to_celsius),
        }
    }

    /// The temperature in degrees Fahrenheit.
    pub fn fahrenheit(&self) -> Option<f64> {
        match self.unit {
            TemperatureUnit::Celsius => self.value.map(celsius_to_fahrenheit),
            TemperatureUnit::Fahrenheit => self.value,
        }
    }
}

/// Parse the 7-byte Date Time field. Unknown (zeroed) dates yield `None`.
fn parse_date_time(data: &[u8], offset: usize) -> Result<Option<NaiveDateTime>> {
    let field = data
        .get(offset..offset + 7)
        .ok_or_else(|| Error::InvalidData {
            context: "time stamp flag set but field truncated".to_string(),
        })?;

    let year = read_u16_le(field, 0).unwrap_or(0);
    let (month, day) = (field[2], field[3]);
    if year == 0 || month == 0 || day == 0 {
        return Ok(None);
    }

    let timestamp = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
        .and_then(|date| date.and_hms_opt(field[4] as u32, field[5] as u32, field[6] as u32))
        .ok_or_else(|| Error::InvalidData {
            context: format!(
                "invalid time stamp {}-{}-{} {}:{}:{}",
                year, month, day, field[4], field[5], field[6]
            ),
        })?;

    Ok(Some(timestamp))
}

/// Parse a Measurement Interval payload (seconds, `u16` little-endian).
///
/// An interval of zero means measurements are not sent periodically.
pub fn parse_measurement_interval(data: &[u8]) -> Result<Duration> {
    read_u16_le(data, 0)
        .map(|seconds| Duration::from_secs(seconds as u64))
        .ok_or_else(|| Error::InvalidData {
            context: format!("measurement interval too short: {} bytes", data.len()),
        })
}

/// Encode a Measurement Interval payload.
pub fn encode_measurement_interval(interval: Duration) -> Result<[u8; 2]> {
    let seconds = u16::try_from(interval.as_secs()).map_err(|_| Error::InvalidParameter {
        name: "interval".to_string(),
        value: format!("{:?}", interval),
    })?;
    Ok(seconds.to_le_bytes())
}
