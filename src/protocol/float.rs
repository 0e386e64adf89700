//! IEEE-11073 32-bit FLOAT, as used by the Health Thermometer profile.
//!
//! The value is a 24-bit signed mantissa and an 8-bit signed base-10
//! exponent, little-endian: `value = mantissa * 10^exponent`.

use crate::utils::sign_extend;

/// Reserved mantissa: not a number.
const NAN: i32 = 0x007F_FFFF;
/// Reserved mantissa: not at this resolution.
const NRES: i32 = -0x0080_0000;
/// Reserved mantissa: positive infinity.
const POSITIVE_INFINITY: i32 = 0x007F_FFFE;
/// Reserved mantissa: negative infinity.
const NEGATIVE_INFINITY: i32 = -0x007F_FFFE;
/// Reserved for future use.
const RESERVED: i32 = -0x007F_FFFF;

/// A decoded IEEE-11073 FLOAT.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MedicalFloat {
    /// A finite value.
    Value(f64),
    /// Not a number.
    NaN,
    /// Not at this resolution.
    NotAtResolution,
    /// Positive infinity.
    PositiveInfinity,
    /// Negative infinity.
    NegativeInfinity,
    /// Reserved special value.
    Reserved,
}

impl MedicalFloat {
    /// Decode the little-endian 32-bit word.
    pub fn from_bits(bits: u32) -> Self {
        let mantissa = sign_extend(bits & 0x00FF_FFFF, 24);
        let exponent = sign_extend(bits >> 24, 8);

        match mantissa {
            NAN => Self::NaN,
            NRES => Self::NotAtResolution,
            POSITIVE_INFINITY => Self::PositiveInfinity,
            NEGATIVE_INFINITY => Self::NegativeInfinity,
            RESERVED => Self::Reserved,
            _ => Self::Value(mantissa as f64 * 10f64.powi(exponent)),
        }
    }

    /// The finite value, if any.
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Value(value) => Some(*value),
            _ => None,
        }
    }
}
