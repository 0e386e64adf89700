//! Wire payload codec.
//!
//! Characteristic values cross the adapter boundary base64-encoded, the way
//! mobile BLE bridges hand them over. This module turns those blobs into
//! bytes and, per characteristic, into text.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;

/// A base64-encoded characteristic payload as carried by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EncodedValue(String);

impl EncodedValue {
    /// Encode raw bytes for the wire.
    pub fn encode(data: &[u8]) -> Self {
        Self(STANDARD.encode(data))
    }

    /// Wrap a payload that is already base64 text.
    pub fn from_base64(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// The base64 text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode the payload into raw bytes.
    pub fn decode(&self) -> Result<Bytes, String> {
        STANDARD
            .decode(self.0.as_bytes())
            .map(Bytes::from)
            .map_err(|e| format!("invalid base64 payload: {}", e))
    }
}

impl std::fmt::Display for EncodedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Character set used to turn a characteristic payload into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Charset {
    /// 7-bit ASCII; any byte above 0x7F is a decode failure.
    Ascii,
    /// UTF-8.
    Utf8,
}

impl Charset {
    /// Decode `data` as text in this charset.
    pub fn decode(&self, data: &[u8]) -> Result<String, String> {
        match self {
            Charset::Ascii => match data.iter().position(|b| !b.is_ascii()) {
                Some(index) => Err(format!(
                    "byte {:#04x} at offset {} is not ASCII",
                    data[index], index
                )),
                None => Ok(data.iter().map(|&b| b as char).collect()),
            },
            Charset::Utf8 => std::str::from_utf8(data)
                .map(str::to_owned)
                .map_err(|e| format!("invalid UTF-8: {}", e)),
        }
    }
}

/// How a characteristic's payload is presented to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Representation {
    /// Decoded text in the given charset.
    Text(Charset),
    /// Raw bytes only.
    Raw,
}

/// A decoded characteristic value.
///
/// The raw bytes are always kept; `text` is present when the characteristic
/// is presented as text.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicValue {
    raw: Bytes,
    text: Option<String>,
}

impl CharacteristicValue {
    /// Decode an encoded payload according to `representation`.
    pub fn decode(encoded: &EncodedValue, representation: Representation) -> Result<Self, String> {
        let raw = encoded.decode()?;
        Self::from_bytes(raw, representation)
    }

    /// Build a value from raw bytes according to `representation`.
    pub fn from_bytes(raw: Bytes, representation: Representation) -> Result<Self, String> {
        let text = match representation {
            Representation::Text(charset) => Some(charset.decode(&raw)?),
            Representation::Raw => None,
        };
        Ok(Self { raw, text })
    }

    /// The raw payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// The decoded text, for text characteristics.
    pub fn as_text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Consume the value, returning the raw bytes.
    pub fn into_bytes(self) -> Bytes {
        self.raw
    }
}

impl std::fmt::Display for CharacteristicValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.text {
            Some(text) => f.write_str(text),
            None => write!(f, "{:02X?}", &self.raw[..]),
        }
    }
}
