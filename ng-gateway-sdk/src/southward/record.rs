use crate::{DataType, DriverError, NGValue};
use std::{fmt, sync::Arc};

/// Per-channel driver configuration as a flat JSON object of dotted keys.
pub type ChannelConfig = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelFlag {
    Success,
    Failure,
}

/// Outcome of the last operation on a record.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStatus {
    pub flag: ChannelFlag,
    pub message: Option<String>,
}

impl ChannelStatus {
    #[inline]
    pub fn success() -> Self {
        Self {
            flag: ChannelFlag::Success,
            message: None,
        }
    }

    #[inline]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            flag: ChannelFlag::Failure,
            message: Some(message.into()),
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.flag == ChannelFlag::Success
    }
}

impl From<&DriverError> for ChannelStatus {
    fn from(e: &DriverError) -> Self {
        ChannelStatus::failure(e.to_string())
    }
}

/// Input and output of a read, write or listen operation on one channel.
///
/// For reads the driver fills `value`, `status` and `timestamp`; for writes
/// `value` is the input and `status`/`timestamp` are filled on completion.
#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub channel_name: Arc<str>,
    pub value_type: DataType,
    pub value: Option<NGValue>,
    pub status: ChannelStatus,
    /// Unix time in milliseconds
    pub timestamp: i64,
    pub channel_config: Arc<ChannelConfig>,
}

impl ChannelRecord {
    pub fn new(channel_name: impl Into<Arc<str>>, value_type: DataType, config: ChannelConfig) -> Self {
        Self::from_shared(channel_name, value_type, Arc::new(config))
    }

    /// Build a record that shares an already parsed channel configuration.
    pub fn from_shared(
        channel_name: impl Into<Arc<str>>,
        value_type: DataType,
        channel_config: Arc<ChannelConfig>,
    ) -> Self {
        Self {
            channel_name: channel_name.into(),
            value_type,
            value: None,
            status: ChannelStatus::success(),
            timestamp: 0,
            channel_config,
        }
    }

    pub fn with_value(mut self, value: NGValue) -> Self {
        self.value = Some(value);
        self
    }

    #[inline]
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = ChannelStatus::failure(message);
    }
}

/// A sample delivered to a channel listener.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub record: ChannelRecord,
}

/// Caller supplied sink for monitored values and events.
pub trait ChannelListener: Send + Sync {
    fn on_channel_event(&self, event: ChannelEvent);
}

/// Identity of a listener instance; two `Arc`s to the same listener compare equal.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerKey(usize);

impl ListenerKey {
    #[inline]
    pub fn of(listener: &Arc<dyn ChannelListener>) -> Self {
        ListenerKey(Arc::as_ptr(listener) as *const () as usize)
    }
}

impl fmt::Debug for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerKey({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl ChannelListener for Nop {
        fn on_channel_event(&self, _event: ChannelEvent) {}
    }

    #[test]
    fn test_listener_key_tracks_instance() {
        let a: Arc<dyn ChannelListener> = Arc::new(Nop);
        let b: Arc<dyn ChannelListener> = Arc::new(Nop);
        assert_eq!(ListenerKey::of(&a), ListenerKey::of(&Arc::clone(&a)));
        assert_ne!(ListenerKey::of(&a), ListenerKey::of(&b));
    }

    #[test]
    fn test_record_fail_sets_message() {
        let mut record = ChannelRecord::new("ch", DataType::Int32, ChannelConfig::new());
        assert!(record.status.is_success());
        record.fail("bad");
        assert_eq!(record.status, ChannelStatus::failure("bad"));
    }
}
