use crate::error::SyncError;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("scanlog/", env!("CARGO_PKG_VERSION"));

/// Raw answer from the remote API
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: String,
}

impl RemoteResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 200 or 201, the statuses the remote uses for an accepted write
    pub fn is_accepted(&self) -> bool {
        self.status == 200 || self.status == 201
    }

    /// Body parsed as JSON, if it is JSON
    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }

    /// The remote's `message` field, falling back to the status code
    pub fn message(&self) -> String {
        self.json()
            .and_then(|body| body.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| format!("Status {}", self.status))
    }

    pub(crate) fn rejection(&self) -> SyncError {
        SyncError::RemoteRejection {
            status: self.status,
            message: self.message(),
        }
    }
}

/// Authenticated request/response channel to the remote attendance API.
///
/// Paths are relative to the configured API base URL. A returned `Err` means
/// the request never produced an HTTP status.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, path: &str, timeout: Duration) -> Result<RemoteResponse, SyncError>;

    async fn post(
        &self,
        path: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<RemoteResponse, SyncError>;
}

/// [`Transport`] over HTTP using reqwest
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    device_id: String,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| SyncError::Client {
                details: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            device_id: device_id.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<RemoteResponse, SyncError> {
        let response = request
            .bearer_auth(&self.api_key)
            .header("X-Device-Id", &self.device_id)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_reqwest_error)?;
        Ok(RemoteResponse { status, body })
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn get(&self, path: &str, timeout: Duration) -> Result<RemoteResponse, SyncError> {
        let url = self.url(path);
        debug!("GET {}", url);
        self.execute(self.client.get(url).timeout(timeout)).await
    }

    async fn post(
        &self,
        path: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<RemoteResponse, SyncError> {
        let url = self.url(path);
        debug!("POST {}", url);
        self.execute(self.client.post(url).json(body).timeout(timeout))
            .await
    }
}

fn map_reqwest_error(error: reqwest::Error) -> SyncError {
    if error.is_builder() {
        SyncError::Client {
            details: error.to_string(),
        }
    } else {
        SyncError::Connectivity {
            details: error.to_string(),
        }
    }
}
