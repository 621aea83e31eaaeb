mod error;
mod retry;
mod southward;
mod value;

pub type DriverResult<T> = Result<T, DriverError>;

pub use error::DriverError;
pub use retry::{build_exponential_backoff, RetryPolicy};
pub use southward::{
    codec::ValueCodec,
    model::DriverHealth,
    record::{
        ChannelConfig, ChannelEvent, ChannelFlag, ChannelListener, ChannelRecord, ChannelStatus,
        ListenerKey,
    },
    types::{DataType, HealthStatus, SouthwardConnectionState},
    Driver, DriverFactory,
};
pub use value::{NGValue, NGValueCastError};
