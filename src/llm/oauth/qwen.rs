//! Qwen-Code OAuth credential manager.
//!
//! Reads pre-existing Qwen CLI credentials from a well-known path, refreshes
//! them via DashScope's refresh-token endpoint, and discovers the API base
//! URL from the credentials themselves when the provider config doesn't
//! pin one (spec §4.7).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::llm::error::{BackendError, ErrorContext};
use crate::llm::oauth::{atomic_write_json, now_epoch_secs, read_credentials, REFRESH_BACKOFF, REFRESH_SKEW_SECS};

/// Fixed DashScope refresh endpoint and default base URL, used when neither
/// the stored credentials nor the provider config supply one.
pub const QWEN_TOKEN_REFRESH_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/token";
pub const QWEN_DEFAULT_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
const QWEN_CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QwenCredentials {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    pub resource_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
    resource_url: Option<String>,
}

/// Result of a successful `ensure_authenticated` call.
pub struct AuthInfo {
    pub access_token: String,
    pub resource_url: Option<String>,
}

/// Coalesces concurrent `ensure_authenticated` calls behind one mutex: the
/// lock guards the check-expiry-then-maybe-refresh critical section, so
/// whichever caller acquires it first performs the one network refresh and
/// everyone queued behind it observes the refreshed token without issuing a
/// second request (spec testable property 4).
pub struct QwenOAuthManager {
    path: PathBuf,
    refresh_url: String,
    http: reqwest::Client,
    state: Mutex<Option<QwenCredentials>>,
}

impl QwenOAuthManager {
    pub fn new(path: PathBuf) -> Result<Self, BackendError> {
        Self::with_refresh_url(path, QWEN_TOKEN_REFRESH_URL.to_string())
    }

    fn with_refresh_url(path: PathBuf, refresh_url: String) -> Result<Self, BackendError> {
        let http = crate::llm::http::build_client(Duration::from_secs(30))
            .map_err(|e| BackendError::config(format!("failed to build OAuth client: {}", e)))?;
        Ok(Self {
            path,
            refresh_url,
            http,
            state: Mutex::new(None),
        })
    }

    /// Test-only hook so the coalescing/retry properties (spec testable
    /// properties 4/7) can be exercised against a local mock server instead
    /// of the real DashScope endpoint.
    #[cfg(test)]
    pub(crate) fn new_with_refresh_url(path: PathBuf, refresh_url: String) -> Result<Self, BackendError> {
        Self::with_refresh_url(path, refresh_url)
    }

    /// Releases the owned HTTP client; a no-op beyond that, since the
    /// credentials file is never touched outside an actual refresh (spec
    /// §4.3 supplement — scoped lifecycle).
    pub async fn shutdown(&self) {}

    pub async fn ensure_authenticated(&self, force_refresh: bool) -> Result<AuthInfo, BackendError> {
        let mut guard = self.state.lock().await;
        if guard.is_none() {
            *guard = Some(read_credentials(&self.path, "qwen").await?);
        }
        let creds = guard.as_ref().expect("populated above");

        let needs_refresh = force_refresh || now_epoch_secs() + REFRESH_SKEW_SECS > creds.expires_at;
        if !needs_refresh {
            return Ok(AuthInfo {
                access_token: creds.access_token.clone(),
                resource_url: creds.resource_url.clone(),
            });
        }

        let refresh_token = creds.refresh_token.clone();
        let refreshed = self.refresh_with_backoff(&refresh_token).await?;
        atomic_write_json(&self.path, &refreshed).await.map_err(|e| {
            BackendError::payload(
                ErrorContext {
                    provider: "qwen".into(),
                    endpoint: self.path.display().to_string(),
                    model: String::new(),
                    status: None,
                    body_excerpt: None,
                },
                format!("failed to persist refreshed credentials: {}", e),
            )
        })?;

        let info = AuthInfo {
            access_token: refreshed.access_token.clone(),
            resource_url: refreshed.resource_url.clone(),
        };
        *guard = Some(refreshed);
        Ok(info)
    }

    async fn refresh_with_backoff(&self, refresh_token: &str) -> Result<QwenCredentials, BackendError> {
        for (attempt, delay) in REFRESH_BACKOFF.iter().enumerate() {
            match self.refresh_once(refresh_token).await {
                Ok(creds) => return Ok(creds),
                Err(e @ BackendError::AuthError { reauth_required: true, .. }) => return Err(e),
                Err(e) => {
                    let is_last = attempt + 1 == REFRESH_BACKOFF.len();
                    if is_last {
                        if log::log_enabled!(log::Level::Error) {
                            log::error!(target: "llm::oauth::qwen", "refresh exhausted retries: {}", e);
                        }
                        return Err(e);
                    }
                    if log::log_enabled!(log::Level::Warn) {
                        log::warn!(target: "llm::oauth::qwen", "refresh attempt {} failed: {}", attempt + 1, e);
                    }
                    tokio::time::sleep(*delay).await;
                }
            }
        }
        unreachable!("REFRESH_BACKOFF is non-empty")
    }

    async fn refresh_once(&self, refresh_token: &str) -> Result<QwenCredentials, BackendError> {
        let ctx = || ErrorContext {
            provider: "qwen".into(),
            endpoint: self.refresh_url.clone(),
            model: String::new(),
            status: None,
            body_excerpt: None,
        };

        let response = self
            .http
            .post(&self.refresh_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", QWEN_CLIENT_ID),
            ])
            .send()
            .await
            .map_err(|e| BackendError::transport(ctx(), e))?;

        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            if body.contains("invalid_grant") {
                return Err(BackendError::AuthError {
                    ctx: {
                        let mut c = ctx();
                        c.status = Some(400);
                        c.body_excerpt = Some(body);
                        c
                    },
                    reauth_required: true,
                });
            }
            return Err(BackendError::from_status(400, ctx(), Some(body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), ctx(), Some(body)));
        }

        let parsed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| BackendError::transport(ctx(), e))?;

        Ok(QwenCredentials {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token.unwrap_or_else(|| refresh_token.to_string()),
            expires_at: now_epoch_secs() + parsed.expires_in,
            resource_url: parsed.resource_url,
        })
    }
}

/// Resolves the Qwen base URL per spec §4.7: `resource_url` from
/// credentials, else the provider's configured `api_base`, else the
/// built-in DashScope default.
pub fn resolve_base_url(resource_url: Option<&str>, provider_api_base: Option<&str>) -> String {
    resource_url
        .or(provider_api_base)
        .unwrap_or(QWEN_DEFAULT_BASE_URL)
        .trim_end_matches('/')
        .to_string()
}
