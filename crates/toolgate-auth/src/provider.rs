use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// Identity attached to a verified request.
///
/// Once the auth middleware stores this on the invocation context it is
/// shared as `Arc<AuthInfo>` and never mutated; downstream middlewares only
/// read it.
#[derive(Debug, Clone, Serialize)]
pub struct AuthInfo {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub scopes: Vec<String>,
    /// Full token payload for user middlewares.
    pub claims: Value,
    /// `exp` claim, seconds since the epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl AuthInfo {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// RFC 9728 protected-resource metadata advertised at
/// `/.well-known/oauth-protected-resource`.
#[derive(Debug, Clone)]
pub struct ResourceMetadata {
    pub resource: String,
    pub authorization_servers: Vec<String>,
    pub scopes_supported: Vec<String>,
}

impl ResourceMetadata {
    pub fn to_value(&self) -> Value {
        let mut doc = serde_json::json!({
            "resource": self.resource,
            "authorization_servers": self.authorization_servers,
            "bearer_methods_supported": ["header"],
        });
        if !self.scopes_supported.is_empty() {
            doc["scopes_supported"] = serde_json::json!(self.scopes_supported);
        }
        doc
    }

    /// Where clients can fetch this document: the resource with a trailing
    /// slash trimmed, plus the well-known suffix.
    pub fn metadata_url(&self) -> String {
        format!(
            "{}/.well-known/oauth-protected-resource",
            self.resource.trim_end_matches('/')
        )
    }
}

/// Verification backend behind the auth middleware.
///
/// `verify_token` returns `Ok(None)` for any token that does not verify; the
/// reason is intentionally not surfaced to callers.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn verify_token(&self, token: &str) -> anyhow::Result<Option<AuthInfo>>;

    fn resource_metadata(&self) -> ResourceMetadata;
}

/// Observability hook for verify/reject/cache-hit events. The server installs
/// a sink backed by its metrics; the default discards everything.
pub trait AuthEventSink: Send + Sync {
    fn on_verify(&self) {}
    fn on_reject(&self) {}
    fn on_cache_hit(&self) {}
}

pub struct NoopEvents;

impl AuthEventSink for NoopEvents {}
