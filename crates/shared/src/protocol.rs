use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    domain::ApiKeyPolicy,
    error::{ProtocolError, RequestError},
};

/// Literal prefix of the only frame a client ever sends.
pub const START_COMMAND_PREFIX: &str = "start ";

pub const DEFAULT_SERVER_ERROR_MESSAGE: &str = "Unknown error from the server.";

/// Raw values read from the research form at start time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormSnapshot {
    pub task: String,
    pub report_type: String,
    pub agent: String,
    pub language: String,
    pub openai_api_key: String,
}

/// Payload of the start command. Field order is the wire key order.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct SessionRequest {
    task: String,
    report_type: String,
    agent: String,
    language: String,
    openai_api_key: String,
}

impl SessionRequest {
    pub fn from_form(form: &FormSnapshot, policy: ApiKeyPolicy) -> Result<Self, RequestError> {
        for (field, value) in [
            ("task", &form.task),
            ("report_type", &form.report_type),
            ("agent", &form.agent),
        ] {
            if value.trim().is_empty() {
                return Err(RequestError::EmptyField { field });
            }
        }
        if policy == ApiKeyPolicy::Require && form.openai_api_key.trim().is_empty() {
            return Err(RequestError::MissingApiKey);
        }

        Ok(Self {
            task: form.task.clone(),
            report_type: form.report_type.clone(),
            agent: form.agent.clone(),
            language: form.language.clone(),
            openai_api_key: form.openai_api_key.clone(),
        })
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn report_type(&self) -> &str {
        &self.report_type
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn openai_api_key(&self) -> &str {
        &self.openai_api_key
    }

    pub fn has_api_key(&self) -> bool {
        !self.openai_api_key.is_empty()
    }

    /// Encodes the `start {json}` text frame.
    pub fn start_command(&self) -> Result<String, ProtocolError> {
        let body = serde_json::to_string(self).map_err(ProtocolError::Encode)?;
        Ok(format!("{START_COMMAND_PREFIX}{body}"))
    }
}

impl fmt::Debug for SessionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = if self.openai_api_key.is_empty() {
            "<empty>"
        } else {
            "<redacted>"
        };
        f.debug_struct("SessionRequest")
            .field("task", &self.task)
            .field("report_type", &self.report_type)
            .field("agent", &self.agent)
            .field("language", &self.language)
            .field("openai_api_key", &key)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Logs { text: String },
    Report { markdown_fragment: String },
    Path { download_uri: String },
    /// `None` when the server sent no usable message text.
    Error { message: Option<String> },
    Unknown { tag: String },
}

impl ServerMessage {
    /// Parses one inbound text frame of the form `{"type": ..., "output": ...}`.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw).map_err(ProtocolError::InvalidJson)?;
        let Value::Object(mut fields) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        let tag = match fields.remove("type") {
            Some(Value::String(tag)) => tag,
            Some(Value::Null) | None => return Err(ProtocolError::MissingType),
            Some(_) => return Err(ProtocolError::NonStringType),
        };

        match tag.as_str() {
            "logs" => Ok(Self::Logs {
                text: required_output(&mut fields, "logs")?,
            }),
            "report" => Ok(Self::Report {
                markdown_fragment: required_output(&mut fields, "report")?,
            }),
            "path" => Ok(Self::Path {
                download_uri: required_output(&mut fields, "path")?,
            }),
            "error" => Ok(Self::Error {
                message: match fields.remove("output") {
                    Some(Value::String(message)) if !message.is_empty() => Some(message),
                    _ => None,
                },
            }),
            _ => Ok(Self::Unknown { tag }),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            Self::Logs { .. } => "logs",
            Self::Report { .. } => "report",
            Self::Path { .. } => "path",
            Self::Error { .. } => "error",
            Self::Unknown { tag } => tag,
        }
    }
}

fn required_output(fields: &mut Map<String, Value>, tag: &'static str) -> Result<String, ProtocolError> {
    match fields.remove("output") {
        Some(Value::String(text)) => Ok(text),
        Some(Value::Null) | None => Err(ProtocolError::MissingOutput { tag }),
        Some(_) => Err(ProtocolError::NonTextOutput { tag }),
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
