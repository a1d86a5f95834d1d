use serde_json::Value;
use thiserror::Error;

/// Body of a non-2xx response, kept for display.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiBody {
    Json(Value),
    Text(String),
}

/// Failure of a single run fetch, as seen by the poller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// The request never produced a response.
    #[error("network error while calling {path}: {message}")]
    Network { path: String, message: String },
    /// The server answered with a non-2xx status.
    #[error("request failed ({status}) {path}: {message}")]
    Api {
        path: String,
        status: u16,
        message: String,
        body: ApiBody,
    },
}

impl FetchError {
    /// HTTP status, when a response was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Api { status, .. } => Some(*status),
            FetchError::Network { .. } => None,
        }
    }

    /// `detail` (or `message`) from a JSON error body.
    pub fn detail(&self) -> Option<&str> {
        match self {
            FetchError::Api {
                body: ApiBody::Json(v),
                ..
            } => ["detail", "message"]
                .iter()
                .find_map(|k| v.get(*k).and_then(Value::as_str)),
            _ => None,
        }
    }

    pub fn api(path: &str, status: u16, reason: &str, body: ApiBody) -> Self {
        let message = match &body {
            ApiBody::Text(t) if !t.is_empty() => t.clone(),
            _ => reason.to_string(),
        };
        FetchError::Api {
            path: path.to_string(),
            status,
            message,
            body,
        }
    }
}
