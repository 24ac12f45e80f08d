use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Message recorded on a session that was cancelled through the abort API.
pub const ABORTED_BY_USER: &str = "Aborted by user";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    UpstreamUnavailable,
    UpstreamRejected,
    StreamFailed,
    Aborted,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:session-stream:error:invalid_request",
            Self::UpstreamUnavailable => "urn:session-stream:error:upstream_unavailable",
            Self::UpstreamRejected => "urn:session-stream:error:upstream_rejected",
            Self::StreamFailed => "urn:session-stream:error:stream_failed",
            Self::Aborted => "urn:session-stream:error:aborted",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::UpstreamUnavailable => "Upstream Unavailable",
            Self::UpstreamRejected => "Upstream Rejected",
            Self::StreamFailed => "Stream Failed",
            Self::Aborted => "Aborted",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::UpstreamUnavailable => 502,
            Self::UpstreamRejected => 502,
            Self::StreamFailed => 502,
            Self::Aborted => 409,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("failed to open upstream stream for session {session_id}: {message}")]
    UpstreamOpen { session_id: String, message: String },
    #[error("upstream rejected stream for session {session_id} with status {status}")]
    UpstreamStatus {
        session_id: String,
        status: u16,
        body: Option<String>,
    },
    #[error("stream failed for session {session_id}: {message}")]
    StreamFailed { session_id: String, message: String },
    #[error("Aborted by user")]
    Aborted { session_id: String },
}

impl StreamError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::UpstreamOpen { .. } => ErrorType::UpstreamUnavailable,
            Self::UpstreamStatus { .. } => ErrorType::UpstreamRejected,
            Self::StreamFailed { .. } => ErrorType::StreamFailed,
            Self::Aborted { .. } => ErrorType::Aborted,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::InvalidRequest { .. } => None,
            Self::UpstreamOpen { session_id, .. }
            | Self::UpstreamStatus { session_id, .. }
            | Self::StreamFailed { session_id, .. }
            | Self::Aborted { session_id } => Some(session_id.as_str()),
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        if let Some(session_id) = self.session_id() {
            extensions.insert("sessionId".to_string(), Value::String(session_id.to_string()));
        }
        if let Self::UpstreamStatus { status, body, .. } = self {
            let mut details = Map::new();
            details.insert(
                "upstreamStatus".to_string(),
                Value::Number(serde_json::Number::from(*status)),
            );
            if let Some(body) = body {
                details.insert("body".to_string(), Value::String(body.clone()));
            }
            extensions.insert("details".to_string(), Value::Object(details));
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<&StreamError> for ProblemDetails {
    fn from(value: &StreamError) -> Self {
        value.to_problem_details()
    }
}
