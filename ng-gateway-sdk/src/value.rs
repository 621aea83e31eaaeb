use crate::DataType;
use base64::Engine;
use bytes::Bytes;
use std::{fmt, sync::Arc};

/// Error returned when converting an `NGValue` into a concrete Rust primitive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NGValueCastError {
    /// Value is not a number (int/float).
    #[error("expected numeric value, got {actual:?}")]
    NotNumeric { actual: DataType },
    /// Numeric value is NaN/Inf and cannot be represented in target type.
    #[error("numeric value is not finite")]
    NotFinite,
    /// Numeric value is out of the representable range of the target type.
    #[error("numeric value out of range for {target}")]
    OutOfRange { target: &'static str },
    /// Strict type mismatch for non-numeric conversions.
    #[error("type mismatch: expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        expected: DataType,
        actual: DataType,
    },
    /// String value cannot be parsed into the target type.
    #[error("failed to parse {target} from string: {value}")]
    ParseError { target: &'static str, value: String },
}

/// Strongly typed channel value.
///
/// `Timestamp(i64)` is Unix time in milliseconds.
#[derive(Clone, Debug, PartialEq)]
pub enum NGValue {
    Boolean(bool),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    String(Arc<str>),
    Binary(Bytes),
    Timestamp(i64),
}

impl NGValue {
    /// Return the corresponding SDK `DataType` for this value.
    #[inline]
    pub fn data_type(&self) -> DataType {
        match self {
            NGValue::Boolean(_) => DataType::Boolean,
            NGValue::Int8(_) => DataType::Int8,
            NGValue::UInt8(_) => DataType::UInt8,
            NGValue::Int16(_) => DataType::Int16,
            NGValue::UInt16(_) => DataType::UInt16,
            NGValue::Int32(_) => DataType::Int32,
            NGValue::UInt32(_) => DataType::UInt32,
            NGValue::Int64(_) => DataType::Int64,
            NGValue::UInt64(_) => DataType::UInt64,
            NGValue::Float32(_) => DataType::Float32,
            NGValue::Float64(_) => DataType::Float64,
            NGValue::String(_) => DataType::String,
            NGValue::Binary(_) => DataType::Binary,
            NGValue::Timestamp(_) => DataType::Timestamp,
        }
    }

    /// Lossy view of a numeric value as `f64`, used by the integer casts below.
    #[inline]
    fn as_f64(&self) -> Result<f64, NGValueCastError> {
        match self {
            NGValue::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
            NGValue::Int8(v) => Ok(*v as f64),
            NGValue::UInt8(v) => Ok(*v as f64),
            NGValue::Int16(v) => Ok(*v as f64),
            NGValue::UInt16(v) => Ok(*v as f64),
            NGValue::Int32(v) => Ok(*v as f64),
            NGValue::UInt32(v) => Ok(*v as f64),
            NGValue::Int64(v) | NGValue::Timestamp(v) => Ok(*v as f64),
            NGValue::UInt64(v) => Ok(*v as f64),
            NGValue::Float32(v) => Ok(*v as f64),
            NGValue::Float64(v) => Ok(*v),
            NGValue::String(s) => s.trim().parse::<f64>().map_err(|_| NGValueCastError::ParseError {
                target: "f64",
                value: s.to_string(),
            }),
            NGValue::Binary(_) => Err(NGValueCastError::NotNumeric {
                actual: DataType::Binary,
            }),
        }
    }

    /// Exact integer view when the source is an integer, so 64-bit values keep
    /// full precision.
    #[inline]
    fn as_i128(&self) -> Option<i128> {
        match self {
            NGValue::Boolean(b) => Some(*b as i128),
            NGValue::Int8(v) => Some(*v as i128),
            NGValue::UInt8(v) => Some(*v as i128),
            NGValue::Int16(v) => Some(*v as i128),
            NGValue::UInt16(v) => Some(*v as i128),
            NGValue::Int32(v) => Some(*v as i128),
            NGValue::UInt32(v) => Some(*v as i128),
            NGValue::Int64(v) | NGValue::Timestamp(v) => Some(*v as i128),
            NGValue::UInt64(v) => Some(*v as i128),
            NGValue::String(s) => s.trim().parse::<i128>().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for NGValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NGValue::Boolean(v) => write!(f, "{v}"),
            NGValue::Int8(v) => write!(f, "{v}"),
            NGValue::UInt8(v) => write!(f, "{v}"),
            NGValue::Int16(v) => write!(f, "{v}"),
            NGValue::UInt16(v) => write!(f, "{v}"),
            NGValue::Int32(v) => write!(f, "{v}"),
            NGValue::UInt32(v) => write!(f, "{v}"),
            NGValue::Int64(v) | NGValue::Timestamp(v) => write!(f, "{v}"),
            NGValue::UInt64(v) => write!(f, "{v}"),
            NGValue::Float32(v) => write!(f, "{v}"),
            NGValue::Float64(v) => write!(f, "{v}"),
            NGValue::String(v) => f.write_str(v),
            NGValue::Binary(v) => {
                f.write_str(&base64::engine::general_purpose::STANDARD.encode(v.as_ref()))
            }
        }
    }
}

// Integer targets accept integer/float/string inputs; floats are rounded.
macro_rules! impl_integer_cast {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(
            impl TryFrom<&NGValue> for $ty {
                type Error = NGValueCastError;

                #[inline]
                fn try_from(v: &NGValue) -> Result<Self, Self::Error> {
                    let wide = match v.as_i128() {
                        Some(exact) => exact,
                        None => {
                            let f = v.as_f64()?.round();
                            if !f.is_finite() {
                                return Err(NGValueCastError::NotFinite);
                            }
                            f as i128
                        }
                    };
                    <$ty>::try_from(wide).map_err(|_| NGValueCastError::OutOfRange { target: $name })
                }
            }
        )*
    };
}

impl_integer_cast!(
    i8 => "i8",
    u8 => "u8",
    i16 => "i16",
    u16 => "u16",
    i32 => "i32",
    u32 => "u32",
    i64 => "i64",
    u64 => "u64",
);

impl TryFrom<&NGValue> for bool {
    type Error = NGValueCastError;

    #[inline]
    fn try_from(v: &NGValue) -> Result<Self, Self::Error> {
        match v {
            NGValue::Boolean(b) => Ok(*b),
            NGValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "on" | "yes" => Ok(true),
                "false" | "0" | "off" | "no" => Ok(false),
                _ => Err(NGValueCastError::ParseError {
                    target: "bool",
                    value: s.to_string(),
                }),
            },
            other => Err(NGValueCastError::TypeMismatch {
                expected: DataType::Boolean,
                actual: other.data_type(),
            }),
        }
    }
}

impl TryFrom<&NGValue> for f64 {
    type Error = NGValueCastError;

    #[inline]
    fn try_from(v: &NGValue) -> Result<Self, Self::Error> {
        v.as_f64()
    }
}

impl TryFrom<&NGValue> for f32 {
    type Error = NGValueCastError;

    #[inline]
    fn try_from(v: &NGValue) -> Result<Self, Self::Error> {
        let f = v.as_f64()?;
        if f.is_finite() && (f < f32::MIN as f64 || f > f32::MAX as f64) {
            return Err(NGValueCastError::OutOfRange { target: "f32" });
        }
        Ok(f as f32)
    }
}

impl TryFrom<&NGValue> for String {
    type Error = NGValueCastError;

    #[inline]
    fn try_from(v: &NGValue) -> Result<Self, Self::Error> {
        Ok(v.to_string())
    }
}

impl TryFrom<&NGValue> for Vec<u8> {
    type Error = NGValueCastError;

    #[inline]
    fn try_from(v: &NGValue) -> Result<Self, Self::Error> {
        match v {
            NGValue::Binary(b) => Ok(b.to_vec()),
            NGValue::String(s) => Ok(s.as_bytes().to_vec()),
            other => Err(NGValueCastError::TypeMismatch {
                expected: DataType::Binary,
                actual: other.data_type(),
            }),
        }
    }
}
