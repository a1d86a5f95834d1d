use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Field names that may carry the run identifier, in preference order.
pub const RUN_ID_FIELDS: &[&str] = &["run_id", "runId", "id"];
/// Field names that may carry a signed (time-limited) download link.
pub const SIGNED_URL_FIELDS: &[&str] = &["signed_url", "signedUrl"];
/// Field names that may carry a plain download link.
pub const PLAIN_URL_FIELDS: &[&str] = &["url"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub base_url: String,
    pub user_agent: String,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub force_demo: bool,
    pub api_key_override: Option<String>,
    pub settings_path: Option<PathBuf>,
}

/// Which backend a run is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Precomputed, read-only, unauthenticated.
    Demo,
    /// Real backend, requires an API key.
    Live,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Demo => "demo",
            Mode::Live => "live",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    /// Anything the backend sends that we do not recognize, including a missing status.
    Unknown(Option<String>),
}

impl RunStatus {
    /// Case-insensitive parse; unrecognized values keep their raw text.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" => RunStatus::Queued,
            "running" => RunStatus::Running,
            "succeeded" => RunStatus::Succeeded,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Unknown(Some(raw.to_string())),
        }
    }

    /// Label used for display and for the history status cache.
    pub fn label(&self) -> &str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Unknown(Some(raw)) => raw.as_str(),
            RunStatus::Unknown(None) => "unknown",
        }
    }

    /// Label worth caching; `None` when the backend sent no status at all.
    pub fn reported_label(&self) -> Option<&str> {
        match self {
            RunStatus::Unknown(None) => None,
            other => Some(other.label()),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Queued | RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for RunStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

/// One output file as described by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ArtifactRecord {
    pub signed_url: Option<String>,
    pub url: Option<String>,
    pub name: Option<String>,
    pub gcs_uri: Option<String>,
    pub content_type: Option<String>,
    pub size_bytes: Option<u64>,
    pub sha256: Option<String>,
}

impl ArtifactRecord {
    /// Build a record from whatever object the backend sent. Non-objects yield an empty record.
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };
        Self {
            signed_url: first_str(obj, SIGNED_URL_FIELDS),
            url: first_str(obj, PLAIN_URL_FIELDS),
            name: first_str(obj, &["name"]),
            gcs_uri: first_str(obj, &["gcs_uri"]),
            content_type: first_str(obj, &["content_type"]),
            size_bytes: obj.get("size_bytes").and_then(Value::as_u64),
            sha256: first_str(obj, &["sha256"]),
        }
    }

    /// The link a user can download from. The signed URL wins over the plain one;
    /// blank strings count as missing.
    pub fn download_url(&self) -> Option<&str> {
        non_blank(self.signed_url.as_deref()).or_else(|| non_blank(self.url.as_deref()))
    }
}

/// An artifact as keyed in the run record, in document order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactEntry {
    pub key: String,
    pub record: ArtifactRecord,
}

/// A run as returned by either backend, resolved from a loosely-typed JSON body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Run {
    pub run_id: String,
    pub status: RunStatus,
    pub stage: Option<String>,
    pub progress: Option<f64>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub error: Option<String>,
    pub artifacts: Vec<ArtifactEntry>,
}

impl Run {
    /// A run we know nothing about yet, e.g. from an unusable 2xx body.
    pub fn unrecognized(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            status: RunStatus::Unknown(None),
            stage: None,
            progress: None,
            created_at: None,
            updated_at: None,
            error: None,
            artifacts: Vec::new(),
        }
    }

    /// Resolve a run from a response body. `requested_id` is used when the body names no id.
    /// Never fails: unusable shapes degrade to an unrecognized run.
    pub fn from_value(requested_id: &str, value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::unrecognized(requested_id);
        };

        let status = match obj.get("status") {
            Some(Value::String(s)) => RunStatus::parse(s),
            Some(Value::Null) | None => RunStatus::Unknown(None),
            Some(other) => RunStatus::Unknown(Some(other.to_string())),
        };

        let artifacts = obj
            .get("artifacts")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter(|(_, v)| is_truthy(v))
                    .map(|(k, v)| ArtifactEntry {
                        key: k.clone(),
                        record: ArtifactRecord::from_value(v),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            run_id: first_str(obj, RUN_ID_FIELDS).unwrap_or_else(|| requested_id.to_string()),
            status,
            stage: first_str(obj, &["stage"]),
            progress: obj
                .get("progress")
                .and_then(Value::as_f64)
                .filter(|p| p.is_finite())
                .map(|p| p.clamp(0.0, 1.0)),
            created_at: first_str(obj, &["created_at", "createdAt"]),
            updated_at: first_str(obj, &["updated_at", "updatedAt"]),
            error: first_str(obj, &["error"]),
            artifacts,
        }
    }

    /// Failure detail, only meaningful for failed runs.
    pub fn failure_detail(&self) -> Option<&str> {
        match self.status {
            RunStatus::Failed => self.error.as_deref(),
            _ => None,
        }
    }
}

/// Resolve the run id announced by a create-run response.
pub fn run_id_from_create_response(body: &Value) -> Option<String> {
    match body {
        Value::String(s) => non_blank(Some(s.trim())).map(str::to_string),
        Value::Object(obj) => first_str(obj, RUN_ID_FIELDS),
        _ => None,
    }
}

/// First non-blank string among `fields`, in order.
pub(crate) fn first_str(obj: &Map<String, Value>, fields: &[&str]) -> Option<String> {
    fields
        .iter()
        .filter_map(|f| obj.get(*f).and_then(Value::as_str))
        .find(|s| !s.trim().is_empty())
        .map(str::to_string)
}

/// `null`, `false`, `0` and `""` describe no artifact at all.
fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.filter(|v| !v.trim().is_empty())
}
