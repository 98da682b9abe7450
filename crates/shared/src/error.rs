use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubProtocolError {
    #[error("malformed hub record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("hub record of type {kind} is missing `{field}`")]
    MissingField { kind: u8, field: &'static str },
    #[error("hub record is missing its type")]
    MissingType,
    #[error("incomplete handshake response")]
    IncompleteHandshake,
}

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("unknown hub event `{0}`")]
    UnknownEvent(String),
    #[error("invalid arguments for hub event `{event}`: {source}")]
    InvalidArguments {
        event: String,
        source: serde_json::Error,
    },
    #[error("custom data is not a call signal")]
    NotACallSignal,
}
