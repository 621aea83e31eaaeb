use crate::{DataType, NGValue};
use std::sync::Arc;

/// Protocol-agnostic value coercion utilities.
/// Centralizes scaling, rounding, clamping, and common string/boolean parsing.
pub struct ValueCodec;

macro_rules! ranged_int {
    ($v:expr, $ty:ty, $variant:ident) => {{
        // `u64::MAX as f64` is 2^64; bound-check in i128 instead.
        <$ty>::try_from($v.round() as i128).ok().map(NGValue::$variant)
    }};
}

impl ValueCodec {
    #[inline]
    pub fn apply_scale(value: f64, scale: Option<f64>) -> f64 {
        match scale {
            Some(s) => value * s,
            None => value,
        }
    }

    /// Apply scaling to a numeric source and return an `NGValue` in the expected `DataType`.
    ///
    /// Integer targets are rounded and range checked; `None` means the value does
    /// not fit. Timestamp/Binary require protocol-specific parsing and are not
    /// supported here.
    #[inline]
    pub fn coerce_f64_to_value(value: f64, expected: DataType, scale: Option<f64>) -> Option<NGValue> {
        let v = Self::apply_scale(value, scale);
        if !v.is_finite() && !matches!(expected, DataType::Float32 | DataType::Float64) {
            return None;
        }
        match expected {
            DataType::Boolean => Some(NGValue::Boolean(v != 0.0)),
            DataType::Int8 => ranged_int!(v, i8, Int8),
            DataType::UInt8 => ranged_int!(v, u8, UInt8),
            DataType::Int16 => ranged_int!(v, i16, Int16),
            DataType::UInt16 => ranged_int!(v, u16, UInt16),
            DataType::Int32 => ranged_int!(v, i32, Int32),
            DataType::UInt32 => ranged_int!(v, u32, UInt32),
            DataType::Int64 => ranged_int!(v, i64, Int64),
            DataType::UInt64 => ranged_int!(v, u64, UInt64),
            DataType::Float32 => {
                if v.is_finite() && (v < f32::MIN as f64 || v > f32::MAX as f64) {
                    None
                } else {
                    Some(NGValue::Float32(v as f32))
                }
            }
            DataType::Float64 => Some(NGValue::Float64(v)),
            DataType::String => Some(NGValue::String(Arc::<str>::from(v.to_string()))),
            DataType::Binary | DataType::Timestamp => None,
        }
    }

    /// Coerce a boolean source into an expected `DataType` with optional scale.
    #[inline]
    pub fn coerce_bool_to_value(value: bool, expected: DataType, scale: Option<f64>) -> Option<NGValue> {
        match expected {
            DataType::Boolean => Some(NGValue::Boolean(value)),
            DataType::String => Some(NGValue::String(Arc::<str>::from(value.to_string()))),
            _ => Self::coerce_f64_to_value(if value { 1.0 } else { 0.0 }, expected, scale),
        }
    }

    /// Coerce 64-bit integers without going through `f64`, so large values keep
    /// full precision when no scale is applied.
    #[inline]
    pub fn coerce_i128_to_value(value: i128, expected: DataType, scale: Option<f64>) -> Option<NGValue> {
        if scale.is_some() {
            return Self::coerce_f64_to_value(value as f64, expected, scale);
        }
        match expected {
            DataType::Int64 => i64::try_from(value).ok().map(NGValue::Int64),
            DataType::UInt64 => u64::try_from(value).ok().map(NGValue::UInt64),
            DataType::String => Some(NGValue::String(Arc::<str>::from(value.to_string()))),
            _ => Self::coerce_f64_to_value(value as f64, expected, None),
        }
    }

    /// Parse a hex string such as `"0A1B"` or `"0x0a1b"` into bytes.
    pub fn hex_string_to_bytes(s: &str) -> Option<Vec<u8>> {
        let s = s.trim();
        let s = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if s.len() % 2 != 0 {
            return None;
        }
        (0..s.len())
            .step_by(2)
            .map(|i| s.get(i..i + 2).and_then(|h| u8::from_str_radix(h, 16).ok()))
            .collect()
    }
}
