use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(i16)]
pub enum DataType {
    Boolean = 0,
    Int8 = 1,
    UInt8 = 2,
    Int16 = 3,
    UInt16 = 4,
    Int32 = 5,
    UInt32 = 6,
    Int64 = 7,
    UInt64 = 8,
    Float32 = 9,
    Float64 = 10,
    String = 11,
    Binary = 12,
    Timestamp = 13,
}

/// Parses both the SDK names (`int32`, `float64`) and the legacy channel
/// descriptor names (`INTEGER`, `DOUBLE`, `BYTE_ARRAY`), case-insensitively.
impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', '-'], "");
        let dt = match normalized.as_str() {
            "boolean" | "bool" => DataType::Boolean,
            "int8" | "sbyte" => DataType::Int8,
            "uint8" | "byte" => DataType::UInt8,
            "int16" | "short" => DataType::Int16,
            "uint16" => DataType::UInt16,
            "int32" | "integer" | "int" => DataType::Int32,
            "uint32" => DataType::UInt32,
            "int64" | "long" => DataType::Int64,
            "uint64" => DataType::UInt64,
            "float32" | "float" => DataType::Float32,
            "float64" | "double" => DataType::Float64,
            "string" => DataType::String,
            "binary" | "bytearray" => DataType::Binary,
            "timestamp" | "datetime" => DataType::Timestamp,
            _ => return Err(format!("unknown data type: {s}")),
        };
        Ok(dt)
    }
}

/// Health status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Channel connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SouthwardConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Failed with a human-readable reason string
    Failed(String),
}

impl serde::Serialize for SouthwardConnectionState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let s = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Reconnecting => "Reconnecting",
            Self::Failed(_) => "Failed",
        };
        serializer.serialize_str(s)
    }
}

impl Display for SouthwardConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SouthwardConnectionState::Failed(reason) => write!(f, "Failed({})", reason),
            other => write!(f, "{:?}", other),
        }
    }
}
