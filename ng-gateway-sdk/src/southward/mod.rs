pub mod codec;
pub mod model;
pub mod record;
pub mod types;

use crate::DriverResult;
use async_trait::async_trait;
use model::DriverHealth;
use record::{ChannelConfig, ChannelListener, ChannelRecord};
use std::sync::Arc;
use tokio::sync::watch;
use types::SouthwardConnectionState;

/// Southward driver surface consumed by the gateway host.
///
/// Every operation reports failures through [`crate::DriverError`]; the caller
/// decides on retries. Per-record outcomes are written into each record's status.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Establish the device session. Idempotent when already connected.
    async fn connect(&self) -> DriverResult<()>;

    /// Close the session. Registered listeners are kept for the next connect.
    async fn disconnect(&self) -> DriverResult<()>;

    /// Read every record, filling value, status and timestamp in place.
    async fn read(&self, records: &mut [ChannelRecord]) -> DriverResult<()>;

    /// Write every record's value, filling status and timestamp in place.
    async fn write(&self, records: &mut [ChannelRecord]) -> DriverResult<()>;

    async fn register_channel_listener(
        &self,
        config: &ChannelConfig,
        listener: Arc<dyn ChannelListener>,
    ) -> DriverResult<()>;

    /// Remove every registration held by `listener`.
    async fn unregister_channel_listener(&self, listener: &Arc<dyn ChannelListener>) -> DriverResult<()>;

    fn subscribe_connection_state(&self) -> watch::Receiver<SouthwardConnectionState>;

    async fn health_check(&self) -> DriverResult<DriverHealth>;
}

/// Builds drivers from their JSON driver configuration.
pub trait DriverFactory: Send + Sync {
    fn create_driver(&self, driver_config: serde_json::Value) -> DriverResult<Box<dyn Driver>>;
}
