//! Utility functions shared across the crate.

/// Convert Celsius to Fahrenheit.
///
/// # Example
///
/// ```
/// use health_thermometer_ble::celsius_to_fahrenheit;
///
/// let fahrenheit = celsius_to_fahrenheit(37.0);
/// assert!((fahrenheit - 98.6).abs() < 0.001);
/// ```
#[inline]
pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

/// Convert Fahrenheit to Celsius.
///
/// # Example
///
/// ```
/// use health_thermometer_ble::fahrenheit_to_celsius;
///
/// let celsius = fahrenheit_to_celsius(98.6);
/// assert!((celsius - 37.0).abs() < 0.001);
/// ```
#[inline]
pub fn fahrenheit_to_celsius(fahrenheit: f64) -> f64 {
    (fahrenheit - 32.0) * 5.0 / 9.0
}

/// Sign-extend the low `bits` bits of `value` to an `i32`.
#[inline]
pub(crate) fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// Read a little-endian `u16` at `offset`, if the slice is long enough.
#[inline]
pub(crate) fn read_u16_le(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2)
        .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Read a little-endian `u32` at `offset`, if the slice is long enough.
#[inline]
pub(crate) fn read_u32_le(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
