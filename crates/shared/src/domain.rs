use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one transport connection within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ConnectionId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Identifies one `start()` of a session in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How an empty API key is treated when a start command is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyPolicy {
    #[default]
    Warn,
    Require,
}

impl std::str::FromStr for ApiKeyPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "warn" => Ok(Self::Warn),
            "require" => Ok(Self::Require),
            other => Err(format!("unknown api key policy '{other}' (expected warn|require)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptKind {
    AgentResponse,
    ServerError,
}

impl TranscriptKind {
    pub fn css_class(self) -> &'static str {
        match self {
            Self::AgentResponse => "agent_response",
            Self::ServerError => "server_error",
        }
    }
}
