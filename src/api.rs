//! HTTP transport for the CityLens API.
//!
//! The poller never talks to this module directly; it sees runs through [`RunSource`],
//! with one implementation per [`Mode`].

use crate::credentials::Credentials;
use crate::error::{ApiBody, FetchError};
use crate::model::{run_id_from_create_response, ClientConfig, Mode, Run};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const API_KEY_HEADER: &str = "x-api-key";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Capability to read one run. Supplied per mode.
#[async_trait]
pub trait RunSource: Send + Sync {
    async fn fetch_run(&self, run_id: &str) -> Result<Run, FetchError>;
}

/// The two run sources the poller chooses between.
#[derive(Clone)]
pub struct Sources {
    pub demo: Arc<dyn RunSource>,
    pub live: Arc<dyn RunSource>,
}

impl Sources {
    pub fn for_mode(&self, mode: Mode) -> Arc<dyn RunSource> {
        match mode {
            Mode::Demo => self.demo.clone(),
            Mode::Live => self.live.clone(),
        }
    }
}

/// Whether a request carries the stored API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Auth {
    IfConfigured,
    Never,
}

pub struct CitylensClient {
    http: reqwest::Client,
    base_url: Url,
    credentials: Arc<Credentials>,
}

/// Body of an artifact fetched for display.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactBody {
    Json(Value),
    Text(String),
}

impl CitylensClient {
    pub fn new(cfg: &ClientConfig, credentials: Arc<Credentials>) -> Result<Self> {
        let base_url = Url::parse(&format!("{}/", cfg.base_url.trim_end_matches('/')))
            .with_context(|| format!("invalid base url: {}", cfg.base_url))?;
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            base_url,
            credentials,
        })
    }

    /// Build `{base}/{segments...}`; each segment is percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn request_json(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&Value>,
        auth: Auth,
    ) -> Result<Value, FetchError> {
        let url = self.endpoint(segments);
        let path = url.path().to_string();

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if auth == Auth::IfConfigured {
            if let Some(key) = self.credentials.api_key() {
                match HeaderValue::from_str(&key) {
                    Ok(v) => {
                        headers.insert(API_KEY_HEADER, v);
                    }
                    Err(_) => warn!("stored API key is not a valid header value; sending without it"),
                }
            }
        }

        let mut req = self.http.request(method, url).headers(headers);
        if let Some(b) = body {
            req = req.json(b);
        }

        debug!(%path, "calling api");
        let res = req.send().await.map_err(|e| FetchError::Network {
            path: path.clone(),
            message: e.to_string(),
        })?;

        let status = res.status();
        let is_json = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("application/json"));
        let text = res.text().await.map_err(|e| FetchError::Network {
            path: path.clone(),
            message: e.to_string(),
        })?;

        if !status.is_success() {
            let body = if is_json {
                ApiBody::Json(serde_json::from_str(&text).unwrap_or(Value::Null))
            } else {
                ApiBody::Text(text)
            };
            return Err(FetchError::api(
                &path,
                status.as_u16(),
                status.canonical_reason().unwrap_or(""),
                body,
            ));
        }

        if is_json {
            match serde_json::from_str(&text) {
                Ok(v) => Ok(v),
                Err(e) => {
                    warn!(%path, "unusable json body: {e}");
                    Ok(Value::Null)
                }
            }
        } else {
            Ok(Value::String(text))
        }
    }

    pub async fn health(&self) -> Result<Value, FetchError> {
        self.request_json(Method::GET, &["v1", "health"], None, Auth::IfConfigured)
            .await
    }

    /// Submit a prepared run payload and return the id the backend assigned.
    pub async fn create_run(&self, payload: &Value) -> Result<(String, Value)> {
        let raw = self
            .request_json(Method::POST, &["v1", "runs"], Some(payload), Auth::IfConfigured)
            .await?;
        let run_id = run_id_from_create_response(&raw)
            .context("create run response did not include a run id (expected run_id)")?;
        Ok((run_id, raw))
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run, FetchError> {
        let body = self
            .request_json(Method::GET, &["v1", "runs", run_id], None, Auth::IfConfigured)
            .await?;
        Ok(Run::from_value(run_id, &body))
    }

    pub async fn get_demo_run(&self, run_id: &str) -> Result<Run, FetchError> {
        let body = self
            .request_json(Method::GET, &["v1", "demo", "runs", run_id], None, Auth::Never)
            .await?;
        Ok(Run::from_value(run_id, &body))
    }

    /// Dereference an artifact link. Signed URLs are pre-authorized, so no key is attached.
    pub async fn fetch_artifact(&self, url: &str) -> Result<ArtifactBody> {
        let res = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("fetch artifact {url}"))?;
        let status = res.status();
        if !status.is_success() {
            anyhow::bail!("artifact fetch failed ({})", status.as_u16());
        }
        let is_json = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));
        let text = res.text().await.context("read artifact body")?;
        if is_json {
            let v = serde_json::from_str(&text).context("parse artifact json")?;
            Ok(ArtifactBody::Json(v))
        } else {
            Ok(ArtifactBody::Text(text))
        }
    }

    /// Fetch a GeoJSON artifact; the body must be JSON whatever the content type says.
    pub async fn fetch_geojson(&self, url: &str) -> Result<Value> {
        match self.fetch_artifact(url).await? {
            ArtifactBody::Json(v) => Ok(v),
            ArtifactBody::Text(t) => serde_json::from_str(&t).context("parse geojson"),
        }
    }
}

/// Reads runs from the precomputed demo endpoint.
pub struct DemoRuns(pub Arc<CitylensClient>);

/// Reads runs from the authenticated backend.
pub struct LiveRuns(pub Arc<CitylensClient>);

#[async_trait]
impl RunSource for DemoRuns {
    async fn fetch_run(&self, run_id: &str) -> Result<Run, FetchError> {
        self.0.get_demo_run(run_id).await
    }
}

#[async_trait]
impl RunSource for LiveRuns {
    async fn fetch_run(&self, run_id: &str) -> Result<Run, FetchError> {
        self.0.get_run(run_id).await
    }
}

impl Sources {
    pub fn http(client: Arc<CitylensClient>) -> Self {
        Self {
            demo: Arc::new(DemoRuns(client.clone())),
            live: Arc::new(LiveRuns(client)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    fn client(base: &str) -> CitylensClient {
        let cfg = ClientConfig {
            base_url: base.to_string(),
            user_agent: "citylens-test".into(),
            poll_interval: Duration::from_millis(2500),
            force_demo: false,
            api_key_override: None,
            settings_path: None,
        };
        let creds = Arc::new(Credentials::in_memory(None, EventBus::new()));
        CitylensClient::new(&cfg, creds).unwrap()
    }

    #[test]
    fn endpoint_trims_trailing_slashes() {
        let c = client("http://localhost:8000///");
        assert_eq!(
            c.endpoint(&["v1", "runs", "abc"]).as_str(),
            "http://localhost:8000/v1/runs/abc"
        );
    }

    #[test]
    fn endpoint_keeps_base_path_and_encodes_ids() {
        let c = client("https://api.example.com/citylens/");
        assert_eq!(
            c.endpoint(&["v1", "runs", "a b/c"]).as_str(),
            "https://api.example.com/citylens/v1/runs/a%20b%2Fc"
        );
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let cfg = ClientConfig {
            base_url: "not a url".into(),
            user_agent: "t".into(),
            poll_interval: Duration::from_millis(1),
            force_demo: false,
            api_key_override: None,
            settings_path: None,
        };
        let creds = Arc::new(Credentials::in_memory(None, EventBus::new()));
        assert!(CitylensClient::new(&cfg, creds).is_err());
    }
}
