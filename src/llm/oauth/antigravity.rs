//! Antigravity OAuth credential manager: PKCE loopback flow against Google,
//! bearer-token + project-id refresh (spec §4.3).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::llm::error::{BackendError, ErrorContext};
use crate::llm::oauth::{atomic_write_json, now_epoch_secs, read_credentials, REFRESH_BACKOFF, REFRESH_SKEW_SECS};

pub const ANTIGRAVITY_TOKEN_REFRESH_URL: &str = "https://oauth2.googleapis.com/token";
const ANTIGRAVITY_CLIENT_ID: &str = "antigravity-cli";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntigravityCredentials {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    pub project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
}

pub struct AuthInfo {
    pub access_token: String,
    pub project_id: Option<String>,
}

/// Same single-flight discipline as [`super::qwen::QwenOAuthManager`]: one
/// mutex guards check-then-refresh, so the lock itself is the coalescing
/// primitive (spec §9: a mutex + cached result + expiry per manager, not
/// shared across providers).
pub struct AntigravityOAuthManager {
    path: PathBuf,
    default_project_id: Option<String>,
    refresh_url: String,
    http: reqwest::Client,
    state: Mutex<Option<AntigravityCredentials>>,
}

impl AntigravityOAuthManager {
    pub fn new(path: PathBuf, default_project_id: Option<String>) -> Result<Self, BackendError> {
        Self::with_refresh_url(path, default_project_id, ANTIGRAVITY_TOKEN_REFRESH_URL.to_string())
    }

    fn with_refresh_url(
        path: PathBuf,
        default_project_id: Option<String>,
        refresh_url: String,
    ) -> Result<Self, BackendError> {
        let http = crate::llm::http::build_client(Duration::from_secs(30))
            .map_err(|e| BackendError::config(format!("failed to build OAuth client: {}", e)))?;
        Ok(Self {
            path,
            default_project_id,
            refresh_url,
            http,
            state: Mutex::new(None),
        })
    }

    /// Test-only hook mirroring [`super::qwen::QwenOAuthManager::new_with_refresh_url`]
    /// so the adapter-level auth-retry tests (spec testable property 7,
    /// scenario S5) can run against a local mock server.
    #[cfg(test)]
    pub(crate) fn new_with_refresh_url(
        path: PathBuf,
        default_project_id: Option<String>,
        refresh_url: String,
    ) -> Result<Self, BackendError> {
        Self::with_refresh_url(path, default_project_id, refresh_url)
    }

    /// Releases the owned HTTP client; a no-op beyond that, since the
    /// credentials file is never touched outside an actual refresh (spec
    /// §4.3 supplement — scoped lifecycle).
    pub async fn shutdown(&self) {}

    pub async fn ensure_authenticated(&self, force_refresh: bool) -> Result<AuthInfo, BackendError> {
        let mut guard = self.state.lock().await;
        if guard.is_none() {
            *guard = Some(read_credentials(&self.path, "antigravity").await?);
        }
        let creds = guard.as_ref().expect("populated above");

        let needs_refresh = force_refresh || now_epoch_secs() + REFRESH_SKEW_SECS > creds.expires_at;
        if !needs_refresh {
            return Ok(AuthInfo {
                access_token: creds.access_token.clone(),
                // Never inferred from the access token (spec §4.3); falls
                // back to the configured default only when absent.
                project_id: creds.project_id.clone().or_else(|| self.default_project_id.clone()),
            });
        }

        let refresh_token = creds.refresh_token.clone();
        let project_id = creds.project_id.clone();
        let mut refreshed = self.refresh_with_backoff(&refresh_token).await?;
        refreshed.project_id = project_id;
        atomic_write_json(&self.path, &refreshed).await.map_err(|e| {
            BackendError::payload(
                ErrorContext {
                    provider: "antigravity".into(),
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
            project_id: refreshed.project_id.clone().or_else(|| self.default_project_id.clone()),
        };
        *guard = Some(refreshed);
        Ok(info)
    }

    /// Caches a project id discovered from an onboarding probe, so future
    /// `ensure_authenticated` calls surface it without re-probing.
    pub async fn cache_project_id(&self, project_id: String) -> Result<(), BackendError> {
        let mut guard = self.state.lock().await;
        if let Some(creds) = guard.as_mut() {
            creds.project_id = Some(project_id);
            atomic_write_json(&self.path, creds).await.map_err(|e| {
                BackendError::payload(
                    ErrorContext {
                        provider: "antigravity".into(),
                        endpoint: self.path.display().to_string(),
                        model: String::new(),
                        status: None,
                        body_excerpt: None,
                    },
                    format!("failed to persist project id: {}", e),
                )
            })?;
        }
        Ok(())
    }

    async fn refresh_with_backoff(&self, refresh_token: &str) -> Result<AntigravityCredentials, BackendError> {
        for (attempt, delay) in REFRESH_BACKOFF.iter().enumerate() {
            match self.refresh_once(refresh_token).await {
                Ok(creds) => return Ok(creds),
                Err(e @ BackendError::AuthError { reauth_required: true, .. }) => return Err(e),
                Err(e) => {
                    let is_last = attempt + 1 == REFRESH_BACKOFF.len();
                    if is_last {
                        if log::log_enabled!(log::Level::Error) {
                            log::error!(target: "llm::oauth::antigravity", "refresh exhausted retries: {}", e);
                        }
                        return Err(e);
                    }
                    if log::log_enabled!(log::Level::Warn) {
                        log::warn!(target: "llm::oauth::antigravity", "refresh attempt {} failed: {}", attempt + 1, e);
                    }
                    tokio::time::sleep(*delay).await;
                }
            }
        }
        unreachable!("REFRESH_BACKOFF is non-empty")
    }

    async fn refresh_once(&self, refresh_token: &str) -> Result<AntigravityCredentials, BackendError> {
        let ctx = || ErrorContext {
            provider: "antigravity".into(),
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
                ("client_id", ANTIGRAVITY_CLIENT_ID),
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

        Ok(AntigravityCredentials {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token.unwrap_or_else(|| refresh_token.to_string()),
            expires_at: now_epoch_secs() + parsed.expires_in,
            project_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_credentials_require_reauth() {
        let dir = tempfile::tempdir().unwrap();
        let manager = AntigravityOAuthManager::new(dir.path().join("missing.json"), None).unwrap();
        let err = manager.ensure_authenticated(false).await.unwrap_err();
        match err {
            BackendError::AuthError { reauth_required, .. } => assert!(reauth_required),
            other => panic!("expected AuthError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn fresh_token_skips_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        let creds = AntigravityCredentials {
            access_token: "still-good".into(),
            refresh_token: "r".into(),
            expires_at: now_epoch_secs() + 3600,
            project_id: Some("proj-1".into()),
        };
        atomic_write_json(&path, &creds).await.unwrap();

        let manager = AntigravityOAuthManager::new(path, None).unwrap();
        let info = manager.ensure_authenticated(false).await.unwrap();
        assert_eq!(info.access_token, "still-good");
        assert_eq!(info.project_id.as_deref(), Some("proj-1"));
    }

    #[tokio::test]
    async fn absent_project_id_falls_back_to_default_not_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        let creds = AntigravityCredentials {
            access_token: "tok".into(),
            refresh_token: "r".into(),
            expires_at: now_epoch_secs() + 3600,
            project_id: None,
        };
        atomic_write_json(&path, &creds).await.unwrap();

        let manager = AntigravityOAuthManager::new(path, Some("default-proj".into())).unwrap();
        let info = manager.ensure_authenticated(false).await.unwrap();
        assert_eq!(info.project_id.as_deref(), Some("default-proj"));
    }
}
