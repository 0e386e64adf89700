//! Protocol module for decoding characteristic payloads.
//!
//! This module contains the implementations for:
//! - base64 wire payloads and per-characteristic charset decoding
//! - IEEE-11073 FLOAT values used by temperature measurements

pub mod codec;
pub mod float;

pub use codec::{CharacteristicValue, Charset, EncodedValue, Representation};
pub use float::MedicalFloat;
