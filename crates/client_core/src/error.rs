use std::time::Duration;

use rtc_integration::MediaError;
use thiserror::Error;

use crate::session::ConnectionState;

/// Fatal problems that retrying cannot fix.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("missing credentials: a user id and access token are required")]
    MissingCredentials,
    #[error("missing API key for {0}")]
    MissingApiKey(&'static str),
    #[error("invalid hub url '{url}': {reason}")]
    InvalidHubUrl { url: String, reason: String },
    #[error("hub rejected this client's origin (HTTP {status}); check the hub's allowed origins")]
    OriginRejected { status: u16 },
    #[error("hub ended the session and disallowed reconnecting: {reason}")]
    HubTerminated { reason: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to reach hub at {url}: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("hub returned HTTP {status} for {url}")]
    Http { status: u16, url: String },
    #[error("hub refused authorization (HTTP {status}) for {url}")]
    Unauthorized { status: u16, url: String },
    #[error("hub rejected request origin (HTTP {status}) for {url}")]
    OriginRejected { status: u16, url: String },
    #[error("hub handshake failed: {0}")]
    Handshake(String),
    #[error("hub protocol violation: {0}")]
    Protocol(String),
    #[error("hub connection closed: {0}")]
    Closed(String),
    /// Close record with `allowReconnect: false`.
    #[error("hub closed the connection for good: {0}")]
    Terminated(String),
}

impl TransportError {
    /// Classifies an HTTP status from the upgrade, negotiate or poll request.
    pub fn from_status(status: u16, url: &str) -> Self {
        match status {
            401 => TransportError::Unauthorized {
                status,
                url: url.to_string(),
            },
            403 => TransportError::OriginRejected {
                status,
                url: url.to_string(),
            },
            _ => TransportError::Http {
                status,
                url: url.to_string(),
            },
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::OriginRejected { .. } | TransportError::Terminated(_)
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("connect attempt was cancelled by disconnect")]
    Cancelled,
}

impl ConnectError {
    pub(crate) fn from_transport(err: TransportError) -> Self {
        match err {
            TransportError::OriginRejected { status, .. } => {
                ConnectError::Configuration(ConfigurationError::OriginRejected { status })
            }
            TransportError::Terminated(reason) => {
                ConnectError::Configuration(ConfigurationError::HubTerminated { reason })
            }
            other => ConnectError::Transport(other),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvokeError {
    #[error("cannot invoke {method}: hub session is {state:?}")]
    NotConnected {
        method: String,
        state: ConnectionState,
    },
    #[error("hub rejected {method}: {message}")]
    Rejected { method: String, message: String },
    #[error("{method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },
    #[error("hub connection closed before {method} completed")]
    ConnectionClosed { method: String },
    #[error("failed to encode or decode {method}: {reason}")]
    Codec { method: String, reason: String },
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("failed to send call signal: {0}")]
    Signaling(#[from] InvokeError),
    #[error("peer connection failure: {0}")]
    Peer(String),
    #[error("cannot {operation} while call is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: crate::call::CallState,
    },
}
