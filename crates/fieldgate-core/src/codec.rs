//! # Register Codec
//!
//! Turns raw 16-bit holding-register words into typed, scaled physical
//! quantities.
//!
//! ## Word Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Register Word Composition                            │
//! │                                                                         │
//! │  uint16 / int16       one word                                          │
//! │  ┌──────────┐                                                           │
//! │  │  word0   │  int16: two's complement over 16 bits                     │
//! │  └──────────┘                                                           │
//! │                                                                         │
//! │  uint32 / int32 / float32     two words, BIG-ENDIAN word order          │
//! │  ┌──────────┬──────────┐                                                │
//! │  │  word0   │  word1   │  → (word0 << 16) | word1                       │
//! │  │  (high)  │  (low)   │                                                │
//! │  └──────────┴──────────┘                                                │
//! │     int32: two's complement over 32 bits                                │
//! │     float32: IEEE-754 binary32 bit pattern                              │
//! │                                                                         │
//! │  Then: physical = decoded * scale + offset                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::types::ReadingQuality;

// =============================================================================
// Data Type
// =============================================================================

/// Wire type of a register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float32,
}

impl DataType {
    /// Number of 16-bit words this type occupies.
    pub const fn word_count(self) -> u16 {
        match self {
            DataType::Uint16 | DataType::Int16 => 1,
            DataType::Uint32 | DataType::Int32 | DataType::Float32 => 2,
        }
    }

    /// Lowercase name, as used in configuration and error messages.
    pub const fn as_str(self) -> &'static str {
        match self {
            DataType::Uint16 => "uint16",
            DataType::Int16 => "int16",
            DataType::Uint32 => "uint32",
            DataType::Int32 => "int32",
            DataType::Float32 => "float32",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Register
// =============================================================================

/// One entry of a device-type register map.
///
/// Register maps are `const` tables (see [`crate::device`]), so registers are
/// immutable for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Register {
    /// Holding register address sent on the wire.
    pub address: u16,
    /// Number of words to read.
    pub count: u16,
    pub data_type: DataType,
    pub scale: f64,
    pub offset: f64,
    /// Human-readable name; also drives unit lookup.
    pub description: &'static str,
}

impl Register {
    /// Creates an unscaled register whose word count follows its data type.
    pub const fn new(address: u16, data_type: DataType, description: &'static str) -> Self {
        Register {
            address,
            count: data_type.word_count(),
            data_type,
            scale: 1.0,
            offset: 0.0,
            description,
        }
    }

    /// Sets the multiplicative scale.
    pub const fn scaled(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Decodes `words` and applies this register's scaling.
    pub fn read_value(&self, words: &[u16]) -> Result<f64, CodecError> {
        let raw = decode(words, self.data_type)?;
        Ok(apply_scaling(raw, self.scale, self.offset))
    }

    /// Unit derived from the description.
    pub fn unit(&self) -> &'static str {
        unit_for(self.description)
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Decodes raw register words into a number.
///
/// Extra trailing words are ignored; too few words is a [`CodecError`].
///
/// ## Example
/// ```rust
/// use fieldgate_core::codec::{decode, DataType};
///
/// assert_eq!(decode(&[32768], DataType::Int16).unwrap(), -32768.0);
/// assert_eq!(decode(&[0xBFC0, 0x0000], DataType::Float32).unwrap(), -1.5);
/// ```
pub fn decode(words: &[u16], data_type: DataType) -> Result<f64, CodecError> {
    let needed = data_type.word_count() as usize;
    if words.len() < needed {
        return Err(CodecError::ShortPayload {
            data_type: data_type.as_str(),
            needed,
            got: words.len(),
        });
    }

    let value = match data_type {
        DataType::Uint16 => f64::from(words[0]),
        DataType::Int16 => f64::from(words[0] as i16),
        DataType::Uint32 => f64::from(compose(words[0], words[1])),
        DataType::Int32 => f64::from(compose(words[0], words[1]) as i32),
        DataType::Float32 => f64::from(f32::from_bits(compose(words[0], words[1]))),
    };

    Ok(value)
}

#[inline]
fn compose(high: u16, low: u16) -> u32 {
    (u32::from(high) << 16) | u32::from(low)
}

/// `decoded * scale + offset`.
#[inline]
pub fn apply_scaling(decoded: f64, scale: f64, offset: f64) -> f64 {
    decoded * scale + offset
}

/// Keyword → unit table, checked in order against the lowercased description.
const UNIT_KEYWORDS: &[(&str, &str)] = &[
    ("power", "W"),
    ("voltage", "V"),
    ("current", "A"),
    ("frequency", "Hz"),
    ("energy", "kWh"),
    ("temperature", "°C"),
    ("charge", "%"),
];

/// Returns the unit for a register description, or `""` when nothing matches.
///
/// The first keyword that appears wins, so "Power Factor" reports `W`.
pub fn unit_for(description: &str) -> &'static str {
    let lower = description.to_lowercase();
    UNIT_KEYWORDS
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, unit)| *unit)
        .unwrap_or("")
}

// =============================================================================
// Register Reading
// =============================================================================

/// One decoded register value from one device poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterReading {
    pub device_name: String,
    pub register_address: u16,
    pub description: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub quality: ReadingQuality,
}

impl RegisterReading {
    /// Builds a reading for `register` with a decoded, scaled value.
    pub fn new(device_name: &str, register: &Register, value: f64, timestamp: DateTime<Utc>) -> Self {
        RegisterReading {
            device_name: device_name.to_string(),
            register_address: register.address,
            description: register.description.to_string(),
            value,
            unit: register.unit().to_string(),
            timestamp,
            quality: ReadingQuality::Good,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
