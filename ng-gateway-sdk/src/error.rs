use std::time::Duration;
use thiserror::Error;

/// Driver specific errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// Discovery, endpoint filtering or every connection attempt failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
    /// A single batched request exceeded its deadline.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// The server rejected a whole service call with a bad status.
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    /// A task running on a serial task queue failed.
    #[error("Task failure: {0}")]
    TaskFailure(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Invalid state error: {0}")]
    InvalidStateError(String),
    #[error("Codec error: {0}")]
    CodecError(String),
    #[error("Session error: {0}")]
    SessionError(String),
    #[error("Subscription error: {0}")]
    SubscriptionError(String),
    #[error("Browse error: {0}")]
    BrowseError(String),
}
