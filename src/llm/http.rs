//! Per-adapter-instance HTTP client construction.
//!
//! Spec §5 requires HTTP clients to be owned by the adapter instance that
//! uses them, not shared process-wide — a deliberate departure from the
//! host crate's own `SHARED_HTTP_CLIENT` `lazy_static!` singleton. Each
//! adapter calls [`build_client`] once at construction and holds the result;
//! ordinary `Drop` releases pooled connections on every exit path (success,
//! error, or the adapter simply going out of scope), so no explicit
//! "release" step is needed.

use std::time::Duration;

/// Provider request timeout (spec §6): long, because reasoning models
/// stream slowly.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(720);

/// Builds a `reqwest::Client` scoped to one adapter instance, with the
/// connection limits spec §5 mandates (≤5 keep-alive, ≤10 total).
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::ClientBuilder::new()
        .pool_max_idle_per_host(5)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .connect_timeout(Duration::from_secs(30))
        .timeout(timeout)
        .build()
}

/// Short-timeout client for auxiliary probes that must not block on the
/// adapter's main request timeout (e.g. Ollama's native `/api/tags` probe,
/// spec §4.5 supplement).
pub fn build_probe_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::ClientBuilder::new().timeout(timeout).build()
}
