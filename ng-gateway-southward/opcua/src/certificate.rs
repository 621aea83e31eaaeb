use crate::types::CertificateOptions;
use ng_gateway_sdk::{DriverError, DriverResult};
use std::path::PathBuf;

/// Client application instance certificate on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    pub certificate_path: PathBuf,
    pub private_key_path: PathBuf,
}

/// Supplies the client certificate and the server trust decision for new sessions.
pub trait CertificateManager: Send + Sync {
    fn client_certificate(&self) -> DriverResult<Option<ClientCertificate>>;

    fn trust_server_certificates(&self) -> bool;
}

/// No client certificate; unknown server certificates are rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCertificates;

impl CertificateManager for NoCertificates {
    fn client_certificate(&self) -> DriverResult<Option<ClientCertificate>> {
        Ok(None)
    }

    fn trust_server_certificates(&self) -> bool {
        false
    }
}

/// Certificate and key loaded from configured file paths.
#[derive(Debug, Clone)]
pub struct FileCertificates {
    certificate: ClientCertificate,
    trust_server: bool,
}

impl FileCertificates {
    pub fn new(options: &CertificateOptions) -> Self {
        Self {
            certificate: ClientCertificate {
                certificate_path: PathBuf::from(&options.certificate_path),
                private_key_path: PathBuf::from(&options.private_key_path),
            },
            trust_server: options.trust_server_certs,
        }
    }
}

impl CertificateManager for FileCertificates {
    fn client_certificate(&self) -> DriverResult<Option<ClientCertificate>> {
        for path in [
            &self.certificate.certificate_path,
            &self.certificate.private_key_path,
        ] {
            if !path.is_file() {
                return Err(DriverError::ConfigurationError(format!(
                    "certificate file not found: {}",
                    path.display()
                )));
            }
        }
        Ok(Some(self.certificate.clone()))
    }

    fn trust_server_certificates(&self) -> bool {
        self.trust_server
    }
}
