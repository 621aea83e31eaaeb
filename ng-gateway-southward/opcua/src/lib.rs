pub mod browse;
pub mod certificate;
pub mod client;
pub mod codec;
pub mod connection;
pub mod driver;
pub mod endpoint;
pub mod factory;
pub mod queue;
pub mod registry;
pub mod request;
pub mod session;
pub mod subscribe;
pub mod subtree;
pub mod types;

pub use browse::{TreeVisit, VisitOutcome};
pub use certificate::{CertificateManager, ClientCertificate, FileCertificates, NoCertificates};
pub use client::{OpcUaConnector, OpcUaSession};
pub use codec::OpcUaCodec;
pub use connection::{ConnectionContext, ConnectionManager};
pub use driver::OpcUaDriver;
pub use factory::OpcUaDriverFactory;
pub use queue::{FailureHandler, SerialTaskQueue};
pub use registry::{Dispatcher, ListenRegistration, ListenerRegistry, RegistryObserver};
pub use request::{ListenParams, NodeListenParams, ReadParams, Request, SubtreeListenParams, WriteParams};
pub use session::{UaConnector, UaSession};
pub use subscribe::{SubscriptionManager, SubscriptionSettings};
pub use subtree::SubtreeSubscriptionManager;
pub use types::{OpcUaAuth, OpcUaChannelDescriptor, OpcUaOptions, SecurityPolicy};
