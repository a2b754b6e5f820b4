use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use toolgate_auth::{AuthError, AuthProvider, extract_bearer};

use crate::context::InvocationContext;
use crate::error::PipelineError;
use crate::queue::RequestQueue;
use crate::ratelimit::RateLimiter;
use crate::registry::{ToolHandler, ToolOutput, ToolRegistry};
use crate::schema::SchemaValidator;

/// One layer of the onion. A middleware may short-circuit by not calling
/// `next`, enrich the context for downstream layers, or wrap `next` in
/// pre/post logic.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        ctx: &mut InvocationContext,
        next: Next<'_>,
    ) -> Result<ToolOutput, PipelineError>;
}

/// Continuation into the rest of the chain; the final hop invokes the
/// registered handler.
///
/// `run` consumes the continuation, so invoking the rest of the pipeline
/// twice from one middleware is a compile error rather than a runtime guard.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    handler: &'a Arc<dyn ToolHandler>,
}

impl Next<'_> {
    pub async fn run(self, ctx: &mut InvocationContext) -> Result<ToolOutput, PipelineError> {
        match self.chain.split_first() {
            Some((mw, rest)) => {
                mw.handle(
                    ctx,
                    Next {
                        chain: rest,
                        handler: self.handler,
                    },
                )
                .await
            }
            None => {
                let args = ctx.args.clone();
                self.handler
                    .call(args, ctx)
                    .await
                    .map_err(PipelineError::Handler)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitMode {
    /// Fail with a retry hint.
    Reject,
    /// Back off until a slot opens.
    Wait,
}

#[derive(Clone)]
pub struct RateLimitSettings {
    pub limiter: Arc<RateLimiter>,
    pub mode: RateLimitMode,
    /// Derives the limiter key from the invocation; `"default"` when unset.
    pub key_extractor: Option<Arc<dyn Fn(&InvocationContext) -> String + Send + Sync>>,
}

struct RateLimitMiddleware {
    settings: RateLimitSettings,
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn handle(
        &self,
        ctx: &mut InvocationContext,
        next: Next<'_>,
    ) -> Result<ToolOutput, PipelineError> {
        let key = match &self.settings.key_extractor {
            Some(extract) => extract(ctx),
            None => "default".to_string(),
        };

        match self.settings.mode {
            RateLimitMode::Reject => {
                if !self.settings.limiter.check_limit(&key) {
                    let wait = self.settings.limiter.time_until_slot(&key);
                    return Err(PipelineError::RateLimited {
                        retry_after_secs: wait.as_secs().max(1),
                    });
                }
            }
            RateLimitMode::Wait => {
                self.settings.limiter.wait_for_slot(&key).await;
            }
        }
        next.run(ctx).await
    }
}

struct AuthMiddleware {
    provider: Arc<dyn AuthProvider>,
    metadata_url: String,
}

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn handle(
        &self,
        ctx: &mut InvocationContext,
        next: Next<'_>,
    ) -> Result<ToolOutput, PipelineError> {
        // No HTTP request means the stdio transport; bearer auth does not
        // apply there.
        let token = match &ctx.request {
            None => return next.run(ctx).await,
            Some(req) => req
                .headers
                .get(http::header::AUTHORIZATION)
                .and_then(|h| h.to_str().ok())
                .and_then(extract_bearer)
                .map(str::to_string),
        };

        let Some(token) = token else {
            return Err(AuthError::MissingToken {
                resource_metadata_url: Some(self.metadata_url.clone()),
            }
            .into());
        };

        match self.provider.verify_token(&token).await {
            Ok(Some(info)) => {
                ctx.set_auth_info(Arc::new(info))?;
                ctx.resource_metadata_url = Some(self.metadata_url.clone());
                next.run(ctx).await
            }
            // Provider transport failures collapse to the same rejection as
            // a bad token; details are not leaked to the caller.
            Ok(None) | Err(_) => Err(AuthError::InvalidToken {
                resource_metadata_url: Some(self.metadata_url.clone()),
            }
            .into()),
        }
    }
}

struct ScopeCheckMiddleware {
    required: HashMap<String, Vec<String>>,
}

#[async_trait]
impl Middleware for ScopeCheckMiddleware {
    async fn handle(
        &self,
        ctx: &mut InvocationContext,
        next: Next<'_>,
    ) -> Result<ToolOutput, PipelineError> {
        let required = match self.required.get(&ctx.tool_name) {
            Some(required) if !required.is_empty() => required,
            _ => return next.run(ctx).await,
        };

        let auth = ctx.auth_info().cloned();
        match auth {
            None if ctx.request.is_none() => next.run(ctx).await,
            None => Err(PipelineError::Misconfigured(format!(
                "scope check for tool {} reached an HTTP request with no auth info",
                ctx.tool_name
            ))),
            Some(info) => {
                let missing: Vec<String> = required
                    .iter()
                    .filter(|scope| !info.has_scope(scope))
                    .cloned()
                    .collect();
                if missing.is_empty() {
                    next.run(ctx).await
                } else {
                    Err(AuthError::InsufficientScope {
                        missing,
                        resource_metadata_url: ctx.resource_metadata_url.clone(),
                    }
                    .into())
                }
            }
        }
    }
}

struct ValidationMiddleware {
    validator: Arc<SchemaValidator>,
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    async fn handle(
        &self,
        ctx: &mut InvocationContext,
        next: Next<'_>,
    ) -> Result<ToolOutput, PipelineError> {
        self.validator
            .validate_or_reject(&ctx.tool_name, &ctx.args)
            .map_err(PipelineError::Validation)?;
        next.run(ctx).await
    }
}

struct BackpressureMiddleware {
    queue: RequestQueue,
}

#[async_trait]
impl Middleware for BackpressureMiddleware {
    async fn handle(
        &self,
        ctx: &mut InvocationContext,
        next: Next<'_>,
    ) -> Result<ToolOutput, PipelineError> {
        // The guard releases the slot on every exit path, including handler
        // errors and cancellation.
        let _slot = self.queue.acquire().await?;
        next.run(ctx).await
    }
}

/// Assembles the fixed middleware order:
/// rate-limit → auth → user middlewares → scope check → validation →
/// backpressure → handler. Changing this order is a breaking change.
pub struct PipelineBuilder {
    registry: Arc<ToolRegistry>,
    queue: RequestQueue,
    rate_limit: Option<RateLimitSettings>,
    auth: Option<Arc<dyn AuthProvider>>,
    user: Vec<Arc<dyn Middleware>>,
    validator: Option<Arc<SchemaValidator>>,
}

impl PipelineBuilder {
    pub fn new(registry: Arc<ToolRegistry>, queue: RequestQueue) -> Self {
        Self {
            registry,
            queue,
            rate_limit: None,
            auth: None,
            user: Vec::new(),
            validator: None,
        }
    }

    pub fn rate_limit(mut self, settings: RateLimitSettings) -> Self {
        self.rate_limit = Some(settings);
        self
    }

    pub fn auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(provider);
        self
    }

    pub fn middleware(mut self, mw: Arc<dyn Middleware>) -> Self {
        self.user.push(mw);
        self
    }

    pub fn validator(mut self, validator: Arc<SchemaValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn build(self) -> Pipeline {
        let mut chain: Vec<Arc<dyn Middleware>> = Vec::new();

        if let Some(settings) = self.rate_limit {
            chain.push(Arc::new(RateLimitMiddleware { settings }));
        }
        if let Some(provider) = self.auth {
            let metadata_url = provider.resource_metadata().metadata_url();
            chain.push(Arc::new(AuthMiddleware {
                provider,
                metadata_url,
            }));
        }
        chain.extend(self.user);

        let required = self.registry.required_scopes_map();
        if !required.is_empty() {
            chain.push(Arc::new(ScopeCheckMiddleware { required }));
        }
        if let Some(validator) = self.validator {
            chain.push(Arc::new(ValidationMiddleware { validator }));
        }
        chain.push(Arc::new(BackpressureMiddleware { queue: self.queue }));

        debug!(layers = chain.len(), "pipeline built");
        Pipeline {
            middlewares: chain,
            registry: self.registry,
        }
    }
}

pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
    registry: Arc<ToolRegistry>,
}

impl Pipeline {
    pub async fn run(&self, ctx: &mut InvocationContext) -> Result<ToolOutput, PipelineError> {
        let tool = self
            .registry
            .get(&ctx.tool_name)
            .ok_or_else(|| PipelineError::UnknownTool(ctx.tool_name.clone()))?;
        let next = Next {
            chain: &self.middlewares,
            handler: &tool.handler,
        };
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::Value;

    use toolgate_auth::{AuthInfo, ResourceMetadata};

    use crate::context::HttpRequestInfo;
    use crate::queue::{AdmissionStrategy, QueueOptions};
    use crate::ratelimit::RateLimiterOptions;
    use crate::registry::{ToolRegistration, tool_fn};

    struct MockAuthProvider {
        scopes: Vec<String>,
    }

    #[async_trait]
    impl AuthProvider for MockAuthProvider {
        async fn verify_token(&self, token: &str) -> anyhow::Result<Option<AuthInfo>> {
            if token == "good" {
                Ok(Some(AuthInfo {
                    subject: "alice".to_string(),
                    client_id: None,
                    scopes: self.scopes.clone(),
                    claims: serde_json::json!({}),
                    expires_at: None,
                }))
            } else {
                Ok(None)
            }
        }

        fn resource_metadata(&self) -> ResourceMetadata {
            ResourceMetadata {
                resource: "https://mcp.example.com".to_string(),
                authorization_servers: vec!["https://issuer.example.com".to_string()],
                scopes_supported: vec![],
            }
        }
    }

    struct TraceMiddleware {
        label: &'static str,
    }

    #[async_trait]
    impl Middleware for TraceMiddleware {
        async fn handle(
            &self,
            ctx: &mut InvocationContext,
            next: Next<'_>,
        ) -> Result<ToolOutput, PipelineError> {
            let order = ctx
                .extensions
                .entry("order".to_string())
                .or_insert_with(|| Value::Array(vec![]));
            if let Value::Array(items) = order {
                items.push(Value::from(self.label));
            }
            next.run(ctx).await
        }
    }

    fn queue(max: usize) -> RequestQueue {
        RequestQueue::new(QueueOptions {
            max_concurrent: max,
            strategy: AdmissionStrategy::Reject,
            sleep_interval: Duration::from_millis(5),
        })
    }

    fn registry_with_echo() -> Arc<ToolRegistry> {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(ToolRegistration::new(
                "echo",
                "Echo arguments",
                serde_json::json!({"type": "object"}),
                tool_fn(|args| async move { Ok(ToolOutput::Value(args)) }),
            ))
            .expect("register echo");
        registry
    }

    fn http_request(authorization: Option<&str>) -> HttpRequestInfo {
        let mut headers = http::HeaderMap::new();
        if let Some(value) = authorization {
            headers.insert(
                http::header::AUTHORIZATION,
                value.parse().expect("header value"),
            );
        }
        HttpRequestInfo {
            headers,
            client_ip: "203.0.113.7".to_string(),
            method: "POST".to_string(),
            path: "/mcp".to_string(),
        }
    }

    #[tokio::test]
    async fn user_middlewares_run_in_registration_order() {
        let registry = registry_with_echo();
        let pipeline = PipelineBuilder::new(registry, queue(4))
            .middleware(Arc::new(TraceMiddleware { label: "first" }))
            .middleware(Arc::new(TraceMiddleware { label: "second" }))
            .build();

        let mut ctx = InvocationContext::new("echo", serde_json::json!({"x": 1}));
        pipeline.run(&mut ctx).await.expect("pipeline runs");
        assert_eq!(
            ctx.extensions["order"],
            serde_json::json!(["first", "second"])
        );
    }

    #[tokio::test]
    async fn unknown_tool_fails_before_any_middleware() {
        let registry = registry_with_echo();
        let pipeline = PipelineBuilder::new(registry, queue(4)).build();

        let mut ctx = InvocationContext::new("nope", serde_json::json!({}));
        let err = pipeline.run(&mut ctx).await.expect_err("unknown tool");
        assert!(matches!(err, PipelineError::UnknownTool(name) if name == "nope"));
    }

    #[tokio::test]
    async fn backpressure_releases_slot_when_handler_fails() {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(ToolRegistration::new(
                "boom",
                "Always fails",
                serde_json::json!({}),
                tool_fn(|_| async move { anyhow::bail!("handler exploded") }),
            ))
            .expect("register");
        let q = queue(1);
        let pipeline = PipelineBuilder::new(registry, q.clone()).build();

        let mut ctx = InvocationContext::new("boom", serde_json::json!({}));
        let err = pipeline.run(&mut ctx).await.expect_err("handler error");
        assert!(matches!(err, PipelineError::Handler(_)));
        assert_eq!(q.in_flight(), 0, "slot must be released on the error path");

        // A second call still gets the slot.
        let mut ctx = InvocationContext::new("boom", serde_json::json!({}));
        pipeline.run(&mut ctx).await.expect_err("handler error");
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test]
    async fn auth_is_skipped_for_stdio_but_enforced_for_http() {
        let registry = registry_with_echo();
        let pipeline = PipelineBuilder::new(registry, queue(4))
            .auth_provider(Arc::new(MockAuthProvider { scopes: vec![] }))
            .build();

        // Stdio: no request, no auth.
        let mut ctx = InvocationContext::new("echo", serde_json::json!({}));
        pipeline.run(&mut ctx).await.expect("stdio passes");

        // HTTP without a token fails with a structured error.
        let mut ctx = InvocationContext::new("echo", serde_json::json!({}))
            .with_request(http_request(None));
        let err = pipeline.run(&mut ctx).await.expect_err("missing token");
        match err {
            PipelineError::Auth(AuthError::MissingToken {
                resource_metadata_url,
            }) => {
                assert_eq!(
                    resource_metadata_url.as_deref(),
                    Some("https://mcp.example.com/.well-known/oauth-protected-resource")
                );
            }
            other => panic!("expected missing token, got {other:?}"),
        }

        // HTTP with a bad token is invalid_token.
        let mut ctx = InvocationContext::new("echo", serde_json::json!({}))
            .with_request(http_request(Some("Bearer bad")));
        let err = pipeline.run(&mut ctx).await.expect_err("invalid token");
        assert!(matches!(
            err,
            PipelineError::Auth(AuthError::InvalidToken { .. })
        ));
    }

    #[tokio::test]
    async fn scope_check_reports_missing_scopes() {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(
                ToolRegistration::new(
                    "admin_action",
                    "Needs admin",
                    serde_json::json!({}),
                    tool_fn(|_| async move { Ok(ToolOutput::Value(Value::Null)) }),
                )
                .with_scopes(["admin", "read"]),
            )
            .expect("register");
        let pipeline = PipelineBuilder::new(registry, queue(4))
            .auth_provider(Arc::new(MockAuthProvider {
                scopes: vec!["read".to_string()],
            }))
            .build();

        let mut ctx = InvocationContext::new("admin_action", serde_json::json!({}))
            .with_request(http_request(Some("Bearer good")));
        let err = pipeline.run(&mut ctx).await.expect_err("missing scope");
        match err {
            PipelineError::Auth(AuthError::InsufficientScope { missing, .. }) => {
                assert_eq!(missing, vec!["admin"]);
            }
            other => panic!("expected insufficient scope, got {other:?}"),
        }

        // Stdio invocations of the same tool pass: local transport.
        let mut ctx = InvocationContext::new("admin_action", serde_json::json!({}));
        pipeline.run(&mut ctx).await.expect("stdio passes");
    }

    #[tokio::test]
    async fn validation_rejects_before_handler() {
        let registry = registry_with_echo();
        let validator = Arc::new(SchemaValidator::new());
        validator
            .register(
                "echo",
                &serde_json::json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"],
                }),
            )
            .expect("compile");
        let pipeline = PipelineBuilder::new(registry, queue(4))
            .validator(validator)
            .build();

        let mut ctx = InvocationContext::new("echo", serde_json::json!({}));
        let err = pipeline.run(&mut ctx).await.expect_err("invalid args");
        match err {
            PipelineError::Validation(msg) => {
                assert!(msg.contains("Missing required property: text"))
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn per_tool_rate_limit_rejects_with_retry_hint() {
        let registry = registry_with_echo();
        let limiter = Arc::new(RateLimiter::new(RateLimiterOptions {
            max_requests: 1,
            window: Duration::from_secs(60),
        }));
        let pipeline = PipelineBuilder::new(registry, queue(4))
            .rate_limit(RateLimitSettings {
                limiter,
                mode: RateLimitMode::Reject,
                key_extractor: Some(Arc::new(|ctx: &InvocationContext| {
                    ctx.tool_name.clone()
                })),
            })
            .build();

        let mut ctx = InvocationContext::new("echo", serde_json::json!({}));
        pipeline.run(&mut ctx).await.expect("first call");

        let mut ctx = InvocationContext::new("echo", serde_json::json!({}));
        let err = pipeline.run(&mut ctx).await.expect_err("limited");
        let msg = err.to_string();
        assert!(msg.starts_with("Rate limit"), "got: {msg}");
        assert!(msg.contains("Retry after"), "got: {msg}");
    }
}
