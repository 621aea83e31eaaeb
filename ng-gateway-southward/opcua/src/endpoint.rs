use crate::{
    session::{Endpoint, SessionConfig, UaConnector, UaSession},
    types::OpcUaOptions,
};
use ng_gateway_sdk::{DriverError, DriverResult};
use std::sync::Arc;
use url::Url;

/// Fetch the endpoint list advertised at the configured discovery URL.
pub async fn discover(connector: &dyn UaConnector, options: &OpcUaOptions) -> DriverResult<Vec<Endpoint>> {
    let discovery_url = options.discovery_url();
    Url::parse(&discovery_url).map_err(|e| {
        DriverError::ConfigurationError(format!("invalid discovery URL {discovery_url}: {e}"))
    })?;
    let endpoints = connector
        .get_endpoints(&discovery_url)
        .await
        .map_err(|e| DriverError::ConnectionError(format!("get endpoints from {discovery_url}: {e}")))?;
    for ep in &endpoints {
        tracing::debug!(
            endpoint_url = %ep.url,
            security_policy_uri = %ep.security_policy_uri,
            security_mode = ?ep.security_mode,
            "OPC UA discovered endpoint"
        );
    }
    Ok(endpoints)
}

/// Keep endpoints matching the configured security policy and add the
/// variant reached through the locally built URL.
///
/// With `force_endpoint_url` the forced variant is the only candidate;
/// otherwise it is appended as a fallback after the advertised endpoints.
pub fn select_candidates(endpoints: Vec<Endpoint>, options: &OpcUaOptions) -> DriverResult<Vec<Endpoint>> {
    let policy_uri = options.security_policy.uri();
    let mut candidates: Vec<Endpoint> = endpoints
        .into_iter()
        .filter(|ep| ep.security_policy_uri == policy_uri)
        .collect();
    let Some(first) = candidates.first() else {
        return Err(DriverError::ConnectionError(format!(
            "no endpoint matches security policy {policy_uri}"
        )));
    };
    let forced = first.with_url(options.discovery_url());
    if options.force_endpoint_url {
        candidates = vec![forced];
    } else if candidates.iter().all(|ep| ep.url != forced.url) {
        candidates.push(forced);
    }
    Ok(candidates)
}

/// Try candidates in order and keep the first session that opens.
pub async fn connect_first<F>(
    connector: &dyn UaConnector,
    candidates: Vec<Endpoint>,
    mut config_for: F,
) -> DriverResult<Arc<dyn UaSession>>
where
    F: FnMut(Endpoint) -> SessionConfig,
{
    let mut last_error: Option<DriverError> = None;
    for endpoint in candidates {
        let url = endpoint.url.clone();
        match connector.connect(config_for(endpoint)).await {
            Ok(session) => {
                tracing::info!(endpoint_url = %url, "OPC UA session opened");
                return Ok(session);
            }
            Err(e) => {
                tracing::warn!(endpoint_url = %url, error = %e, "OPC UA connection attempt failed");
                last_error = Some(e);
            }
        }
    }
    Err(DriverError::ConnectionError(match last_error {
        Some(e) => format!("every endpoint failed, last error: {e}"),
        None => "no endpoint to connect to".to_string(),
    }))
}
