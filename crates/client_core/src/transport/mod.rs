use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use url::Url;

use crate::error::{InvokeError, TransportError};

mod channel;
mod long_polling;
pub mod negotiator;
mod websocket;

pub use negotiator::{negotiate, plan_attempts, HubEndpoint};

/// Deployment target; decides which transport is tried first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[default]
    Native,
    /// Environments where long-lived duplex connections are often blocked.
    Browser,
}

impl Platform {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "native" | "ios" | "android" | "desktop" => Some(Platform::Native),
            "browser" | "web" => Some(Platform::Browser),
            _ => None,
        }
    }

    pub fn preferred_transport(self) -> TransportKind {
        match self {
            Platform::Native => TransportKind::WebSockets,
            Platform::Browser => TransportKind::LongPolling,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    WebSockets,
    LongPolling,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::WebSockets => f.write_str("websockets"),
            TransportKind::LongPolling => f.write_str("long_polling"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: Url,
    pub access_token: String,
    pub transport: TransportKind,
}

/// A hub-to-client invocation (push event).
#[derive(Debug, Clone, PartialEq)]
pub struct InboundInvocation {
    pub target: String,
    pub arguments: Vec<Value>,
}

#[async_trait]
pub trait HubConnection: Send + Sync {
    fn transport(&self) -> TransportKind;
    async fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<Value, InvokeError>;
    fn subscribe(&self) -> broadcast::Receiver<InboundInvocation>;
    /// Resolves once the link is gone; `None` means it was closed locally.
    async fn closed(&self) -> Option<TransportError>;
    async fn close(&self);
    /// Releases the link without awaiting; used where the owner cannot await.
    fn abort(&self);
}

#[async_trait]
pub trait HubConnector: Send + Sync {
    async fn connect(
        &self,
        request: &ConnectRequest,
    ) -> Result<Arc<dyn HubConnection>, TransportError>;
}

/// Connector speaking the JSON hub protocol over WebSockets or long polling.
pub struct HubClient {
    http: Client,
    invoke_timeout: Duration,
}

impl HubClient {
    pub fn new(invoke_timeout: Duration) -> Self {
        Self {
            http: Client::new(),
            invoke_timeout,
        }
    }
}

#[async_trait]
impl HubConnector for HubClient {
    async fn connect(
        &self,
        request: &ConnectRequest,
    ) -> Result<Arc<dyn HubConnection>, TransportError> {
        let connection: Arc<dyn HubConnection> = match request.transport {
            TransportKind::WebSockets => websocket::connect(request, self.invoke_timeout).await?,
            TransportKind::LongPolling => {
                long_polling::connect(&self.http, request, self.invoke_timeout).await?
            }
        };
        Ok(connection)
    }
}

#[cfg(test)]
#[path = "../tests/transport_tests.rs"]
mod tests;
