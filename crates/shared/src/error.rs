use thiserror::Error;

/// Reasons an inbound frame is dropped as malformed.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("inbound frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("inbound frame is not a JSON object")]
    NotAnObject,
    #[error("inbound frame has no `type` field")]
    MissingType,
    #[error("inbound frame `type` is not a string")]
    NonStringType,
    #[error("`{tag}` frame has no `output` field")]
    MissingOutput { tag: &'static str },
    #[error("`{tag}` frame output is not a string")]
    NonTextOutput { tag: &'static str },
    #[error("failed to encode start command: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("required field `{field}` is empty")]
    EmptyField { field: &'static str },
    #[error("an OpenAI API key is required but none was provided")]
    MissingApiKey,
}
