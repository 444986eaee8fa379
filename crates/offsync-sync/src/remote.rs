//! Remote sync API: batch push, change pull, reachability probe.
//!
//! Implementations must map failures onto the sync error taxonomy:
//! transport errors, timeouts and 5xx → `Network`; 401/403 → `Auth`;
//! 400/422 → `Validation`.

use async_trait::async_trait;
use offsync_core::{ClientInfo, OfsResult};

use crate::protocol::{BatchRequest, BatchResponse, ChangesResponse};
use crate::realtime::Credentials;

#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn send_batch(&self, request: &BatchRequest) -> OfsResult<BatchResponse>;

    /// Mutations recorded by the server after `since` (server time, unix ms).
    async fn fetch_changes(&self, since: u64, client_info: &ClientInfo) -> OfsResult<ChangesResponse>;

    async fn ping(&self) -> OfsResult<()>;

    /// Swap in refreshed credentials after re-authentication.
    fn update_credentials(&self, _credentials: &Credentials) {}
}

#[cfg(feature = "http")]
pub use http::HttpRemote;

#[cfg(feature = "http")]
mod http {
    use std::sync::{PoisonError, RwLock};
    use std::time::Duration;

    use async_trait::async_trait;
    use offsync_core::{ClientInfo, OfsResult, SyncError, TenantId};
    use reqwest::StatusCode;
    use secrecy::{ExposeSecret, SecretString};
    use tracing::debug;

    use super::RemoteApi;
    use crate::protocol::{BatchRequest, BatchResponse, ChangesResponse};
    use crate::realtime::Credentials;

    /// JSON-over-HTTPS client for the sync endpoints.
    pub struct HttpRemote {
        client: reqwest::Client,
        base_url: String,
        tenant: TenantId,
        token: RwLock<SecretString>,
    }

    impl HttpRemote {
        pub fn new(base_url: &str, credentials: &Credentials, timeout: Duration) -> OfsResult<Self> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .user_agent(concat!("offsync/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| SyncError::Config(format!("building HTTP client: {e}")))?;
            Ok(Self {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
                tenant: credentials.tenant_id.clone(),
                token: RwLock::new(credentials.token.clone()),
            })
        }

        fn url(&self, path: &str) -> String {
            format!("{}/v1/tenants/{}/{path}", self.base_url, self.tenant)
        }

        fn bearer(&self) -> String {
            self.token
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .expose_secret()
                .to_string()
        }

        async fn check(response: reqwest::Response) -> OfsResult<reqwest::Response> {
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            let body = response.text().await.unwrap_or_default();
            Err(map_status(status, body))
        }
    }

    fn map_status(status: StatusCode, body: String) -> SyncError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                SyncError::Auth(format!("{status}: {body}"))
            }
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                SyncError::Validation(format!("{status}: {body}"))
            }
            _ => SyncError::Network(format!("{status}: {body}")),
        }
    }

    fn transport(e: reqwest::Error) -> SyncError {
        SyncError::Network(e.to_string())
    }

    #[async_trait]
    impl RemoteApi for HttpRemote {
        async fn send_batch(&self, request: &BatchRequest) -> OfsResult<BatchResponse> {
            debug!(
                entity_type = %request.entity_type,
                items = request.items.len(),
                "POST sync/batch"
            );
            let response = self
                .client
                .post(self.url("sync/batch"))
                .bearer_auth(self.bearer())
                .json(request)
                .send()
                .await
                .map_err(transport)?;
            Self::check(response)
                .await?
                .json()
                .await
                .map_err(|e| SyncError::Validation(format!("decoding batch response: {e}")))
        }

        async fn fetch_changes(&self, since: u64, client_info: &ClientInfo) -> OfsResult<ChangesResponse> {
            let response = self
                .client
                .get(self.url("sync/changes"))
                .bearer_auth(self.bearer())
                .query(&[
                    ("since", since.to_string()),
                    ("device_id", client_info.device_id.clone()),
                ])
                .send()
                .await
                .map_err(transport)?;
            Self::check(response)
                .await?
                .json()
                .await
                .map_err(|e| SyncError::Validation(format!("decoding changes response: {e}")))
        }

        async fn ping(&self) -> OfsResult<()> {
            let response = self
                .client
                .get(format!("{}/health", self.base_url))
                .send()
                .await
                .map_err(transport)?;
            Self::check(response).await.map(|_| ())
        }

        fn update_credentials(&self, credentials: &Credentials) {
            *self.token.write().unwrap_or_else(PoisonError::into_inner) = credentials.token.clone();
        }
    }

}
