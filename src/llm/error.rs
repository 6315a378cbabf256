//! Structured backend failures, built from HTTP responses.
//!
//! Every adapter returns [`BackendError`] rather than a loosely-typed boxed
//! error, so callers can branch on the failure kind (auth vs. rate-limit vs.
//! transport) without string-matching a message.

use std::fmt;

/// Everything an error carries beyond its kind: enough to diagnose a
/// failure without leaking secrets.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub provider: String,
    pub endpoint: String,
    pub model: String,
    pub status: Option<u16>,
    pub body_excerpt: Option<String>,
}

impl fmt::Display for ErrorContext {
    /// Redacted rendering: no API key, no OAuth token, no full message
    /// bodies — only sizes/excerpts and the fields above.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "provider={} endpoint={} model={}",
            self.provider, self.endpoint, self.model
        )?;
        if let Some(status) = self.status {
            write!(f, " status={}", status)?;
        }
        if let Some(excerpt) = &self.body_excerpt {
            let truncated: String = excerpt.chars().take(200).collect();
            write!(f, " body_excerpt={:?}", truncated)?;
        }
        Ok(())
    }
}

/// The backend failure taxonomy (spec §4.2). Transport- and format-specific
/// causes are carried as the source error rather than collapsed into a
/// string, so `?` composition keeps working for callers that only care
/// about `std::error::Error`.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Credentials invalid, expired, or missing. `reauth_required` is set
    /// when a refresh failed with an explicit invalid-grant response, or the
    /// credentials file was missing, signalling the caller should send the
    /// user through onboarding again rather than simply retrying later.
    #[error("auth error ({ctx}), reauth_required={reauth_required}")]
    AuthError {
        ctx: ErrorContext,
        reauth_required: bool,
    },

    #[error("rate limited ({ctx}), retry_after_secs={retry_after_secs:?}")]
    RateLimitError {
        ctx: ErrorContext,
        retry_after_secs: Option<u64>,
    },

    #[error("bad request ({ctx})")]
    BadRequestError { ctx: ErrorContext },

    #[error("server error ({ctx})")]
    ServerError { ctx: ErrorContext },

    #[error("transport error ({ctx}): {source}")]
    TransportError {
        ctx: ErrorContext,
        #[source]
        source: reqwest::Error,
    },

    #[error("malformed response body ({ctx}): {message}")]
    PayloadError { ctx: ErrorContext, message: String },

    #[error("configuration error: {message}")]
    ConfigError { message: String },
}

impl BackendError {
    /// Maps an HTTP status code plus response context to the appropriate
    /// kind (spec §4.2: 401/403 → auth, 429 → rate limit, other 4xx → bad
    /// request, 5xx → server).
    pub fn from_status(status: u16, mut ctx: ErrorContext, body_excerpt: Option<String>) -> Self {
        ctx.status = Some(status);
        ctx.body_excerpt = body_excerpt;
        match status {
            401 | 403 => BackendError::AuthError {
                ctx,
                reauth_required: false,
            },
            429 => BackendError::RateLimitError {
                ctx,
                retry_after_secs: None,
            },
            400..=499 => BackendError::BadRequestError { ctx },
            500..=599 => BackendError::ServerError { ctx },
            _ => BackendError::PayloadError {
                ctx,
                message: format!("unexpected status {}", status),
            },
        }
    }

    pub fn transport(ctx: ErrorContext, source: reqwest::Error) -> Self {
        BackendError::TransportError { ctx, source }
    }

    pub fn payload(ctx: ErrorContext, message: impl Into<String>) -> Self {
        BackendError::PayloadError {
            ctx,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        BackendError::ConfigError {
            message: message.into(),
        }
    }

    /// True for the two statuses that trigger a forced-refresh-and-retry at
    /// the adapter level (401 always; 403 for Antigravity, whose gateway
    /// returns it for expired scopes too).
    pub fn is_auth_retryable(&self, retry_on_403: bool) -> bool {
        match self {
            BackendError::AuthError { ctx, .. } => match ctx.status {
                Some(401) => true,
                Some(403) => retry_on_403,
                _ => true,
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ErrorContext {
        ErrorContext {
            provider: "openai".into(),
            endpoint: "https://api.openai.com/v1/chat/completions".into(),
            model: "gpt-test".into(),
            status: None,
            body_excerpt: None,
        }
    }

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert!(matches!(
            BackendError::from_status(401, ctx(), None),
            BackendError::AuthError { .. }
        ));
        assert!(matches!(
            BackendError::from_status(403, ctx(), None),
            BackendError::AuthError { .. }
        ));
        assert!(matches!(
            BackendError::from_status(429, ctx(), None),
            BackendError::RateLimitError { .. }
        ));
        assert!(matches!(
            BackendError::from_status(404, ctx(), None),
            BackendError::BadRequestError { .. }
        ));
        assert!(matches!(
            BackendError::from_status(500, ctx(), None),
            BackendError::ServerError { .. }
        ));
    }

    #[test]
    fn display_never_includes_full_body() {
        let long_body = "x".repeat(10_000);
        let err = BackendError::from_status(500, ctx(), Some(long_body));
        let rendered = err.to_string();
        assert!(rendered.len() < 1000);
    }

    #[test]
    fn auth_retry_respects_403_flag() {
        let mut c = ctx();
        c.status = Some(403);
        let err = BackendError::AuthError {
            ctx: c,
            reauth_required: false,
        };
        assert!(err.is_auth_retryable(true));
        assert!(!err.is_auth_retryable(false));
    }
}
