use crate::{
    certificate::{CertificateManager, FileCertificates, NoCertificates},
    client::OpcUaConnector,
    driver::OpcUaDriver,
    types::OpcUaOptions,
};
use ng_gateway_sdk::{Driver, DriverError, DriverFactory, DriverResult};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct OpcUaDriverFactory;

impl OpcUaDriverFactory {
    /// Parse driver options from their JSON form.
    pub fn parse_options(driver_config: serde_json::Value) -> DriverResult<OpcUaOptions> {
        let options: OpcUaOptions = serde_json::from_value(driver_config).map_err(|e| {
            DriverError::ConfigurationError(format!("Failed to deserialize OpcUaOptions: {e}"))
        })?;
        if options.endpoint_ip.trim().is_empty() {
            return Err(DriverError::ConfigurationError(
                "endpointIp must not be empty".to_string(),
            ));
        }
        Ok(options)
    }
}

impl DriverFactory for OpcUaDriverFactory {
    fn create_driver(&self, driver_config: serde_json::Value) -> DriverResult<Box<dyn Driver>> {
        let options = Self::parse_options(driver_config)?;
        info!(url = %options.discovery_url(), "Creating OPC UA driver");
        let certificates: Arc<dyn CertificateManager> = match &options.certificate {
            Some(certificate) => Arc::new(FileCertificates::new(certificate)),
            None => Arc::new(NoCertificates),
        };
        Ok(Box::new(OpcUaDriver::new(
            options,
            Arc::new(OpcUaConnector),
            certificates,
        )))
    }
}
