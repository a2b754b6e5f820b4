use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;

use toolgate_runtime::RateLimitMode;

pub(crate) const DEFAULT_MAX_BODY_BYTES: usize = 1_000_000;
pub(crate) const MAX_SESSIONS: usize = 10_000;
pub(crate) const SESSION_TTL: Duration = Duration::from_secs(30 * 60);
pub(crate) const SESSION_GRACE: Duration = Duration::from_secs(60);
pub(crate) const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub version: String,
    pub instructions: Option<String>,
    /// `None` disables the body-size check entirely.
    pub max_body_bytes: Option<usize>,
    pub max_sessions: usize,
    pub session_ttl: Duration,
    pub session_grace: Duration,
    pub session_cleanup_interval: Duration,
    /// Budget for `initialize` per client IP.
    pub initialize_max_per_window: usize,
    pub initialize_window: Duration,
    /// Advertise the `resources` capability even before any resource exists.
    pub expect_resources: bool,
    /// Content-Security-Policy injected into HTML resource reads.
    pub resource_csp: Option<String>,
    pub cors: Option<CorsConfig>,
    /// Per-request timeout for server-initiated sampling requests.
    pub sampling_timeout: Duration,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            instructions: None,
            max_body_bytes: Some(DEFAULT_MAX_BODY_BYTES),
            max_sessions: MAX_SESSIONS,
            session_ttl: SESSION_TTL,
            session_grace: SESSION_GRACE,
            session_cleanup_interval: SESSION_CLEANUP_INTERVAL,
            initialize_max_per_window: 10,
            initialize_window: Duration::from_secs(60),
            expect_resources: false,
            resource_csp: None,
            cors: None,
            sampling_timeout: Duration::from_secs(60),
        }
    }
}

/// Reflected-origin CORS. `origins: None` means wildcard, which is allowed
/// but logged loudly.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub origins: Option<Vec<String>>,
}

/// Request attributes offered to a custom IP rate-limit key extractor.
pub struct IpRequestInfo<'a> {
    pub ip: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub session_id: Option<&'a str>,
}

/// The transport-level rate limit, independent of the per-tool limiter inside
/// the pipeline.
#[derive(Clone)]
pub struct IpRateLimitConfig {
    pub max_requests: usize,
    pub window: Duration,
    pub mode: RateLimitMode,
    /// How long `Wait` mode blocks before shape-returning 429.
    pub wait_timeout: Duration,
    pub key_extractor: Option<Arc<dyn Fn(&IpRequestInfo<'_>) -> String + Send + Sync>>,
}

impl IpRateLimitConfig {
    pub fn reject(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            mode: RateLimitMode::Reject,
            wait_timeout: Duration::from_secs(10),
            key_extractor: None,
        }
    }
}
