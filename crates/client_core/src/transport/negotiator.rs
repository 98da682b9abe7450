use std::sync::Arc;

use shared::domain::UserId;
use tracing::{info, warn};
use url::Url;

use super::{ConnectRequest, HubConnection, HubConnector, Platform, TransportKind};
use crate::error::{ConfigurationError, TransportError};

/// Where the hub lives: a base URL, the primary hub path and fallbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubEndpoint {
    pub base_url: String,
    pub hub_path: String,
    pub alternate_paths: Vec<String>,
}

impl HubEndpoint {
    pub fn new(
        base_url: impl Into<String>,
        hub_path: impl Into<String>,
        alternate_paths: Vec<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            hub_path: hub_path.into(),
            alternate_paths,
        }
    }

    /// `<base><path>?userId=<id>`
    pub fn url_for(&self, path: &str, user_id: &UserId) -> Result<Url, ConfigurationError> {
        let raw = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let mut url = Url::parse(&raw).map_err(|err| ConfigurationError::InvalidHubUrl {
            url: raw.clone(),
            reason: err.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
            return Err(ConfigurationError::InvalidHubUrl {
                url: raw,
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        url.query_pairs_mut()
            .append_pair("userId", user_id.as_str());
        Ok(url)
    }
}

/// Primary path with the platform's preferred transport, then every
/// alternate path over long polling. Duplicates are dropped.
pub fn plan_attempts(
    endpoint: &HubEndpoint,
    platform: Platform,
    user_id: &UserId,
    access_token: &str,
) -> Result<Vec<ConnectRequest>, ConfigurationError> {
    let mut attempts = vec![ConnectRequest {
        url: endpoint.url_for(&endpoint.hub_path, user_id)?,
        access_token: access_token.to_string(),
        transport: platform.preferred_transport(),
    }];
    for path in &endpoint.alternate_paths {
        let request = ConnectRequest {
            url: endpoint.url_for(path, user_id)?,
            access_token: access_token.to_string(),
            transport: TransportKind::LongPolling,
        };
        if !attempts.contains(&request) {
            attempts.push(request);
        }
    }
    Ok(attempts)
}

/// Tries each request in order and keeps the first connection that starts.
/// A fatal error stops the walk immediately.
pub async fn negotiate(
    connector: &dyn HubConnector,
    attempts: &[ConnectRequest],
) -> Result<(Arc<dyn HubConnection>, ConnectRequest), TransportError> {
    let mut last_error = None;
    for (index, request) in attempts.iter().enumerate() {
        match connector.connect(request).await {
            Ok(connection) => {
                info!(
                    url = %request.url,
                    transport = %request.transport,
                    attempt = index + 1,
                    "hub: connection started"
                );
                return Ok((connection, request.clone()));
            }
            Err(err) if err.is_fatal() => {
                warn!(url = %request.url, "hub: fatal connect error: {err}");
                return Err(err);
            }
            Err(err) => {
                warn!(
                    url = %request.url,
                    transport = %request.transport,
                    "hub: connect attempt failed: {err}"
                );
                last_error = Some(err);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| TransportError::Unreachable {
        url: String::new(),
        reason: "no hub endpoints configured".into(),
    }))
}
