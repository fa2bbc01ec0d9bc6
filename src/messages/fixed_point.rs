//! Fixed-point conversion for values carried on the wire.
//!
//! Nodes exchange thresholds, readings, velocities and currents as integers scaled
//! by 2^16. Conversion to fixed point rounds to the nearest step, so converting a
//! value that is already on the grid is exact.

/// Scale applied to every fixed-point field.
pub const FIXED_POINT_SCALE: f64 = 65536.0;

/// Smallest representable difference between two fixed-point values.
pub const QUANTIZATION_STEP: f64 = 1.0 / FIXED_POINT_SCALE;

/// Signed conversion. `None` when the value is not finite or does not fit in an `i32`.
pub fn to_fixed_point(value: f64) -> Option<i32> {
    let scaled = (value * FIXED_POINT_SCALE).round();
    if !scaled.is_finite() || scaled < i32::MIN as f64 || scaled > i32::MAX as f64 {
        return None;
    }
    Some(scaled as i32)
}

pub fn from_fixed_point(raw: i32) -> f64 {
    raw as f64 / FIXED_POINT_SCALE
}

/// Unsigned conversion, used for motor currents.
pub fn to_unsigned_fixed_point(value: f64) -> Option<u32> {
    let scaled = (value * FIXED_POINT_SCALE).round();
    if !scaled.is_finite() || scaled < 0.0 || scaled > u32::MAX as f64 {
        return None;
    }
    Some(scaled as u32)
}

pub fn from_unsigned_fixed_point(raw: u32) -> f64 {
    raw as f64 / FIXED_POINT_SCALE
}
