//! Transports carrying sync requests to a Reconciler.

use crate::{config::ConfigError, error::TransportError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tally_engine::{
    ChangesResponse, RecordStore, Reconciler, SyncRequest, SyncResult, Timestamp,
};

#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// `POST /sync`
    async fn sync(&self, request: &SyncRequest) -> Result<SyncResult, TransportError>;

    /// `GET /sync/changes?since=`
    async fn changes(&self, since: Timestamp) -> Result<ChangesResponse, TransportError>;
}

/// HTTP transport to a Tally server.
#[derive(Clone)]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    auth_token: Option<String>,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TransportBuildError> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::InvalidServerUrl(base_url).into());
        }

        Ok(Self {
            base_url,
            client: reqwest::Client::builder().timeout(timeout).build()?,
            auth_token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Server {
                status: status.as_u16(),
                message: parse_api_error(status, &body),
            });
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| TransportError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn sync(&self, request: &SyncRequest) -> Result<SyncResult, TransportError> {
        let response = self
            .authorize(self.client.post(format!("{}/sync", self.base_url)))
            .json(request)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn changes(&self, since: Timestamp) -> Result<ChangesResponse, TransportError> {
        let response = self
            .authorize(
                self.client
                    .get(format!("{}/sync/changes?since={}", self.base_url, since)),
            )
            .send()
            .await?;
        Self::decode(response).await
    }
}

/// Failure to build an [`HttpTransport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportBuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    details: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ErrorBody>(body) {
        match (payload.error, payload.details) {
            (Some(error), Some(details)) => return format!("{} ({})", error.trim(), details.trim()),
            (Some(error), None) => return error.trim().to_string(),
            _ => {}
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        trimmed.to_string()
    }
}

/// Loopback transport calling a Reconciler directly.
///
/// Reachability can be switched off to simulate a dead network, and a
/// response delay lets tests lose responses after the server has committed.
pub struct InProcessTransport {
    reconciler: Reconciler<dyn RecordStore>,
    reachable: AtomicBool,
    response_delay: Mutex<Option<Duration>>,
}

impl InProcessTransport {
    /// A transport with its own Reconciler over `store`.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self::with_reconciler(Reconciler::new(store))
    }

    /// A transport into a shared Reconciler; devices sharing one behave as
    /// clients of one server.
    pub fn with_reconciler(reconciler: Reconciler<dyn RecordStore>) -> Self {
        Self {
            reconciler,
            reachable: AtomicBool::new(true),
            response_delay: Mutex::new(None),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delay every response after the Reconciler has answered.
    pub fn set_response_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.response_delay.lock() {
            *slot = delay;
        }
    }

    fn check_reachable(&self) -> Result<(), TransportError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Unreachable)
        }
    }

    async fn respond<T>(&self, value: T) -> T {
        let delay = self.response_delay.lock().ok().and_then(|slot| *slot);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        value
    }
}

fn server_error(err: tally_engine::StoreError) -> TransportError {
    TransportError::Server {
        status: 500,
        message: err.to_string(),
    }
}

#[async_trait]
impl SyncTransport for InProcessTransport {
    async fn sync(&self, request: &SyncRequest) -> Result<SyncResult, TransportError> {
        self.check_reachable()?;
        let result = self
            .reconciler
            .sync(request.clone())
            .await
            .map_err(server_error)?;
        Ok(self.respond(result).await)
    }

    async fn changes(&self, since: Timestamp) -> Result<ChangesResponse, TransportError> {
        self.check_reachable()?;
        let changes = self
            .reconciler
            .changes_since(since)
            .await
            .map_err(server_error)?;
        Ok(self.respond(changes).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_engine::MemoryRecordStore;

    #[test]
    fn http_transport_normalizes_base_url() {
        let transport =
            HttpTransport::new("https://sync.example.com/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(transport.base_url(), "https://sync.example.com");
    }

    #[test]
    fn http_transport_rejects_missing_scheme() {
        let result = HttpTransport::new("sync.example.com", None, Duration::from_secs(1));
        assert!(matches!(result, Err(TransportBuildError::Config(_))));
    }

    #[test]
    fn parse_api_error_prefers_json_body() {
        let message = parse_api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"error":"Internal server error","details":"pool timed out"}"#,
        );
        assert_eq!(message, "Internal server error (pool timed out)");
        assert_eq!(parse_api_error(StatusCode::BAD_GATEWAY, ""), "HTTP 502");
    }

    #[tokio::test]
    async fn in_process_unreachable() {
        let transport = InProcessTransport::new(Arc::new(MemoryRecordStore::new()));
        transport.set_reachable(false);

        let result = transport.sync(&SyncRequest::new("d", 0, [])).await;
        assert!(matches!(result, Err(TransportError::Unreachable)));

        transport.set_reachable(true);
        assert!(transport.changes(0).await.is_ok());
    }
}
