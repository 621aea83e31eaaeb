use bytes::Bytes;
use chrono::Utc;
use ng_gateway_sdk::{
    ChannelRecord, ChannelStatus, DataType, DriverError, DriverResult, NGValue, ValueCodec,
};
use opcua::types::{ByteString, DataValue, UAString, Variant};
use std::sync::Arc;

/// Converts between UA `Variant`s and typed channel values.
pub struct OpcUaCodec;

impl OpcUaCodec {
    #[inline]
    fn numeric_as_f64(value: &Variant) -> Option<f64> {
        match value {
            Variant::SByte(n) => Some(*n as f64),
            Variant::Byte(n) => Some(*n as f64),
            Variant::Int16(n) => Some(*n as f64),
            Variant::UInt16(n) => Some(*n as f64),
            Variant::Int32(n) => Some(*n as f64),
            Variant::UInt32(n) => Some(*n as f64),
            Variant::Float(f) => Some(*f as f64),
            Variant::Double(f) => Some(*f),
            Variant::StatusCode(s) => Some(s.bits() as f64),
            _ => None,
        }
    }

    #[inline]
    fn coerce_text(text: &str, expected: DataType) -> Option<NGValue> {
        match expected {
            DataType::String => Some(NGValue::String(Arc::<str>::from(text))),
            DataType::Timestamp => chrono::DateTime::parse_from_rfc3339(text.trim())
                .ok()
                .map(|dt| NGValue::Timestamp(dt.timestamp_millis())),
            DataType::Binary => ValueCodec::hex_string_to_bytes(text)
                .map(Bytes::from)
                .map(NGValue::Binary),
            DataType::Boolean => match text.trim().to_ascii_lowercase().as_str() {
                "true" => Some(NGValue::Boolean(true)),
                "false" => Some(NGValue::Boolean(false)),
                other => other
                    .parse::<f64>()
                    .ok()
                    .map(|n| NGValue::Boolean(n != 0.0)),
            },
            _ => text
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|n| ValueCodec::coerce_f64_to_value(n, expected, None)),
        }
    }

    /// Convert a UA `Variant` to an `NGValue` of the expected type.
    ///
    /// Arrays and structured values are not representable and return `None`.
    pub fn coerce_variant_value(value: &Variant, expected: DataType) -> Option<NGValue> {
        match value {
            Variant::Empty | Variant::Array(_) => None,
            Variant::Boolean(b) => ValueCodec::coerce_bool_to_value(*b, expected, None),
            Variant::Int64(n) => ValueCodec::coerce_i128_to_value(*n as i128, expected, None),
            Variant::UInt64(n) => ValueCodec::coerce_i128_to_value(*n as i128, expected, None),
            Variant::String(s) => Self::coerce_text(s.as_ref(), expected),
            Variant::LocalizedText(t) => Self::coerce_text(t.text.as_ref(), expected),
            Variant::QualifiedName(q) => Self::coerce_text(q.name.as_ref(), expected),
            Variant::NodeId(id) => match expected {
                DataType::String => Some(NGValue::String(Arc::<str>::from(id.to_string()))),
                _ => None,
            },
            Variant::ByteString(b) => match expected {
                DataType::Binary => Some(NGValue::Binary(Bytes::copy_from_slice(b.as_ref()))),
                _ => None,
            },
            Variant::DateTime(dt) => match expected {
                DataType::Timestamp => Some(NGValue::Timestamp(dt.as_chrono().timestamp_millis())),
                DataType::Int64 => Some(NGValue::Int64(dt.as_chrono().timestamp_millis())),
                DataType::String => Some(NGValue::String(Arc::<str>::from(
                    dt.as_chrono().to_rfc3339(),
                ))),
                _ => None,
            },
            _ => Self::numeric_as_f64(value).and_then(|n| match expected {
                DataType::String => Some(NGValue::String(Arc::<str>::from(n.to_string()))),
                _ => ValueCodec::coerce_f64_to_value(n, expected, None),
            }),
        }
    }

    /// Convert a typed value into the `Variant` written for the declared type.
    pub fn value_to_variant(v: &NGValue, dt: DataType) -> Option<Variant> {
        match dt {
            DataType::Boolean => bool::try_from(v).ok().map(Variant::Boolean),
            DataType::Int8 => i8::try_from(v).ok().map(Variant::SByte),
            DataType::UInt8 => u8::try_from(v).ok().map(Variant::Byte),
            DataType::Int16 => i16::try_from(v).ok().map(Variant::Int16),
            DataType::UInt16 => u16::try_from(v).ok().map(Variant::UInt16),
            DataType::Int32 => i32::try_from(v).ok().map(Variant::Int32),
            DataType::UInt32 => u32::try_from(v).ok().map(Variant::UInt32),
            DataType::Int64 => i64::try_from(v).ok().map(Variant::Int64),
            DataType::UInt64 => u64::try_from(v).ok().map(Variant::UInt64),
            DataType::Float32 => f32::try_from(v).ok().map(Variant::Float),
            DataType::Float64 => f64::try_from(v).ok().map(Variant::Double),
            DataType::String => String::try_from(v)
                .ok()
                .map(|s| Variant::String(UAString::from(s))),
            DataType::Binary => v
                .try_into()
                .ok()
                .map(|b: Vec<u8>| Variant::ByteString(ByteString::from(b))),
            DataType::Timestamp => i64::try_from(v).ok().and_then(|ms| {
                chrono::DateTime::<Utc>::from_timestamp_millis(ms)
                    .map(|dt| Variant::DateTime(Box::new(opcua::types::DateTime::from(dt))))
            }),
        }
    }

    /// Variant to send for a write record.
    pub fn variant_for_write(record: &ChannelRecord) -> DriverResult<Variant> {
        let value = record.value.as_ref().ok_or_else(|| {
            DriverError::CodecError(format!("no value to write for {}", record.channel_name))
        })?;
        Self::value_to_variant(value, record.value_type).ok_or_else(|| {
            DriverError::CodecError(format!(
                "cannot convert {:?} to {:?} for {}",
                value.data_type(),
                record.value_type,
                record.channel_name
            ))
        })
    }

    /// Fill status, value and timestamp of `record` from a read result or a
    /// data change notification.
    pub fn fill_value(record: &mut ChannelRecord, dv: &DataValue) {
        match dv.status.filter(|s| s.is_bad()) {
            Some(status) => record.fail(format!("bad status: {status}")),
            None => match dv
                .value
                .as_ref()
                .and_then(|v| Self::coerce_variant_value(v, record.value_type))
            {
                Some(value) => {
                    record.value = Some(value);
                    record.status = ChannelStatus::success();
                }
                None => record.fail(format!(
                    "value {:?} cannot be converted to {:?}",
                    dv.value, record.value_type
                )),
            },
        }
        record.timestamp = dv
            .source_timestamp
            .as_ref()
            .or(dv.server_timestamp.as_ref())
            .map(|t| t.as_chrono().timestamp_millis())
            .unwrap_or_else(now_millis);
    }

    /// Fill `record` from event fields selected as `[Time, Message]`.
    pub fn fill_event(record: &mut ChannelRecord, fields: &[Variant]) {
        match fields
            .get(1)
            .and_then(|message| Self::coerce_variant_value(message, record.value_type))
        {
            Some(value) => {
                record.value = Some(value);
                record.status = ChannelStatus::success();
            }
            None => record.fail("event message missing or not convertible"),
        }
        record.timestamp = match fields.first() {
            Some(Variant::DateTime(dt)) => dt.as_chrono().timestamp_millis(),
            _ => now_millis(),
        };
    }
}

#[inline]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
