//! OAuth2 credential managers (C3): Qwen-Code's refresh-token flow and
//! Antigravity's PKCE loopback flow, both built on the same coalescing and
//! atomic-write primitives defined here.
//!
//! Grounded on the host crate's `lazy_static!`/mutex idioms generalized into
//! an explicit async single-flight primitive (spec §9: "use a single-flight
//! primitive — mutex + cached result + expiry — per manager; do not share
//! primitives across providers"), and on
//! `other_examples/tombelieber-claude-view`'s `CredentialsFile`/
//! `OAuthCredential` struct shape for the on-disk JSON schema.

pub mod antigravity;
pub mod pkce;
pub mod qwen;

use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::AsyncWriteExt;

use crate::llm::error::{BackendError, ErrorContext};

/// Clock skew subtracted from `expires_at` before deciding a token needs
/// refreshing (spec §4.3).
pub const REFRESH_SKEW_SECS: i64 = 60;

/// Backoff schedule for refresh transport failures (spec §4.3): 0.5s, 1s,
/// 2s, then give up.
pub const REFRESH_BACKOFF: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
];

/// Seconds since the Unix epoch, used for `expires_at` comparisons.
pub fn now_epoch_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Writes `value` to `path` atomically (write-temp-then-rename) with mode
/// 0600, so a crash mid-write never corrupts the previous, still-valid
/// credentials file (spec testable property 5).
pub async fn atomic_write_json<T: Serialize + Sync>(path: &Path, value: &T) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir).await?;
    let tmp_path = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("oauth"),
        uuid::Uuid::new_v4()
    ));

    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&body).await?;
        file.flush().await?;
    }
    set_owner_only_permissions(&tmp_path).await?;

    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(unix)]
async fn set_owner_only_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn set_owner_only_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Reads and parses a credentials file, mapping a missing file to the
/// `reauth_required` `AuthError` spec §4.3 mandates.
pub async fn read_credentials<T: DeserializeOwned>(
    path: &Path,
    provider: &str,
) -> Result<T, BackendError> {
    let bytes = tokio::fs::read(path).await.map_err(|_| BackendError::AuthError {
        ctx: ErrorContext {
            provider: provider.to_string(),
            endpoint: path.display().to_string(),
            model: String::new(),
            status: None,
            body_excerpt: None,
        },
        reauth_required: true,
    })?;
    serde_json::from_slice(&bytes).map_err(|e| {
        BackendError::payload(
            ErrorContext {
                provider: provider.to_string(),
                endpoint: path.display().to_string(),
                model: String::new(),
                status: None,
                body_excerpt: None,
            },
            format!("corrupt credentials file: {}", e),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Dummy {
        access_token: String,
        expires_at: i64,
    }

    #[tokio::test]
    async fn atomic_write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        let value = Dummy {
            access_token: "tok".into(),
            expires_at: 123,
        };
        atomic_write_json(&path, &value).await.unwrap();
        let read_back: Dummy = read_credentials(&path, "test").await.unwrap();
        assert_eq!(read_back, value);
    }

    // Property 5: a crash mid-refresh (temp write succeeds, rename
    // skipped) leaves the prior, still-parseable file untouched.
    #[tokio::test]
    async fn crash_mid_refresh_keeps_prior_file_parseable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        let original = Dummy {
            access_token: "original".into(),
            expires_at: 100,
        };
        atomic_write_json(&path, &original).await.unwrap();

        // Simulate a refresh that writes the temp file but "crashes" before
        // renaming: write a sibling temp file and never move it into place.
        let tmp_path = dir.path().join(".creds.json.tmp-simulated-crash");
        let body = serde_json::to_vec_pretty(&Dummy {
            access_token: "new".into(),
            expires_at: 200,
        })
        .unwrap();
        tokio::fs::write(&tmp_path, body).await.unwrap();

        let read_back: Dummy = read_credentials(&path, "test").await.unwrap();
        assert_eq!(read_back, original);
    }

    #[tokio::test]
    async fn missing_credentials_surface_reauth_required() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let err = read_credentials::<Dummy>(&path, "test").await.unwrap_err();
        match err {
            BackendError::AuthError { reauth_required, .. } => assert!(reauth_required),
            other => panic!("expected AuthError, got {:?}", other),
        }
    }
}
