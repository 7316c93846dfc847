//! Failure taxonomy of a research session and the alerts that surface it.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionFailure {
    #[error("cannot open a connection: {0}")]
    TransportConstructionFailure(String),
    #[error("connection dropped, reconnect attempt {attempt} of {max_attempts} scheduled")]
    TransientDisconnect { attempt: u32, max_attempts: u32 },
    #[error("connection lost and {attempts} reconnect attempts were exhausted")]
    ReconnectExhausted { attempts: u32 },
    #[error("malformed server message dropped: {0}")]
    MalformedMessage(String),
    #[error("server reported an error: {0}")]
    ServerReportedError(String),
    #[error("websocket error: {0}")]
    Transport(String),
    #[error("research request is invalid: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Session cannot make progress without the user.
    Blocking,
    NonBlocking,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub severity: Severity,
    pub failure: SessionFailure,
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("page url '{url}' is invalid: {source}")]
    InvalidPageUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("page url scheme '{0}' cannot be upgraded to a websocket scheme")]
    UnsupportedScheme(String),
    #[error("page url '{0}' has no host")]
    MissingHost(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connect timed out after {0:?}")]
    TimedOut(Duration),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ClipboardError {
    #[error("clipboard unavailable: {0}")]
    Unavailable(String),
    #[error("failed to write clipboard: {0}")]
    Write(String),
}
