use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use axum::Router;
use axum::routing::{MethodRouter, get, post};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use toolgate_auth::{AuthEventSink, AuthProvider};
use toolgate_otel::{OtelBridge, ServerMetrics};
use toolgate_runtime::{
    Middleware, Pipeline, PipelineBuilder, QueueOptions, RateLimitSettings, RateLimiter,
    RateLimiterOptions, RequestQueue, ResourceRegistration, ResourceRegistry, SchemaValidator,
    ToolRegistration, ToolRegistry,
};

use crate::config::{IpRateLimitConfig, ServerConfig};
use crate::http;
use crate::sampling::PendingSamplings;
use crate::session::SessionManager;
use crate::sse::SseHub;

pub(crate) struct IpLimit {
    pub limiter: RateLimiter,
    pub cfg: IpRateLimitConfig,
}

/// Everything the transports share. Handlers receive this as axum state; the
/// stdio loop borrows it directly.
pub(crate) struct ServerCore {
    pub cfg: ServerConfig,
    pub registry: Arc<ToolRegistry>,
    pub resources: Arc<ResourceRegistry>,
    pub pipeline: Pipeline,
    pub auth: Option<Arc<dyn AuthProvider>>,
    pub sessions: SessionManager,
    pub sse: Arc<SseHub>,
    pub samplings: PendingSamplings,
    pub queue: RequestQueue,
    pub ip_limit: Option<IpLimit>,
    pub init_limiter: RateLimiter,
    pub metrics: Arc<ServerMetrics>,
    pub otel: OtelBridge,
}

/// Feeds auth verify/reject/cache-hit events into the server's metrics and
/// the OTEL bridge. Obtain one from [`McpServerBuilder::auth_event_sink`] and
/// install it on the JWT provider.
struct MetricsAuthSink {
    metrics: Arc<ServerMetrics>,
    otel: OtelBridge,
}

impl AuthEventSink for MetricsAuthSink {
    fn on_verify(&self) {
        self.metrics.incr_auth_verify();
        self.otel.record_auth_verify();
    }

    fn on_reject(&self) {
        self.metrics.incr_auth_reject();
        self.otel.record_auth_reject();
    }

    fn on_cache_hit(&self) {
        self.metrics.incr_auth_cache_hit();
        self.otel.record_auth_cache_hit();
    }
}

pub struct McpServerBuilder {
    cfg: ServerConfig,
    registry: Arc<ToolRegistry>,
    resources: Arc<ResourceRegistry>,
    validator: Arc<SchemaValidator>,
    metrics: Arc<ServerMetrics>,
    otel: OtelBridge,
    queue_opts: QueueOptions,
    tool_rate_limit: Option<RateLimitSettings>,
    ip_rate_limit: Option<IpRateLimitConfig>,
    auth: Option<Arc<dyn AuthProvider>>,
    middlewares: Vec<Arc<dyn Middleware>>,
    custom_routes: Router,
}

impl McpServerBuilder {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        let cfg = ServerConfig::new(name, version);
        let otel = OtelBridge::new(&cfg.name);
        Self {
            cfg,
            registry: Arc::new(ToolRegistry::new()),
            resources: Arc::new(ResourceRegistry::new()),
            validator: Arc::new(SchemaValidator::new()),
            metrics: Arc::new(ServerMetrics::new()),
            otel,
            queue_opts: QueueOptions::default(),
            tool_rate_limit: None,
            ip_rate_limit: None,
            auth: None,
            middlewares: Vec::new(),
            custom_routes: Router::new(),
        }
    }

    /// Register a tool and compile its input schema. Duplicate names fail
    /// fast; after `build`, use [`McpServer::live_register_tool`] instead.
    pub fn tool(self, reg: ToolRegistration) -> anyhow::Result<Self> {
        self.validator
            .register(&reg.name, &reg.input_schema)
            .with_context(|| format!("register tool {}", reg.name))?;
        self.registry.register(reg)?;
        Ok(self)
    }

    /// Register a batch of resources atomically.
    pub fn resources(self, batch: Vec<ResourceRegistration>) -> anyhow::Result<Self> {
        self.resources.register_batch(batch)?;
        Ok(self)
    }

    /// Advertise the `resources` capability before any resource exists, so
    /// late-bound resources become visible without renegotiation.
    pub fn expect_resources(mut self) -> Self {
        self.cfg.expect_resources = true;
        self
    }

    pub fn middleware(mut self, mw: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(mw);
        self
    }

    pub fn auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(provider);
        self
    }

    /// Sink to install on the auth provider so verify/reject/cache-hit events
    /// land in this server's metrics.
    pub fn auth_event_sink(&self) -> Arc<dyn AuthEventSink> {
        Arc::new(MetricsAuthSink {
            metrics: self.metrics.clone(),
            otel: self.otel.clone(),
        })
    }

    pub fn backpressure(mut self, opts: QueueOptions) -> Self {
        self.queue_opts = opts;
        self
    }

    pub fn tool_rate_limit(mut self, settings: RateLimitSettings) -> Self {
        self.tool_rate_limit = Some(settings);
        self
    }

    pub fn ip_rate_limit(mut self, cfg: IpRateLimitConfig) -> Self {
        self.ip_rate_limit = Some(cfg);
        self
    }

    pub fn max_body_bytes(mut self, limit: Option<usize>) -> Self {
        self.cfg.max_body_bytes = limit;
        self
    }

    pub fn cors(mut self, cors: crate::config::CorsConfig) -> Self {
        self.cfg.cors = Some(cors);
        self
    }

    pub fn resource_csp(mut self, policy: impl Into<String>) -> Self {
        self.cfg.resource_csp = Some(policy.into());
        self
    }

    pub fn instructions(mut self, text: impl Into<String>) -> Self {
        self.cfg.instructions = Some(text.into());
        self
    }

    pub fn session_limits(
        mut self,
        max_sessions: usize,
        ttl: std::time::Duration,
        grace: std::time::Duration,
    ) -> Self {
        self.cfg.max_sessions = max_sessions;
        self.cfg.session_ttl = ttl;
        self.cfg.session_grace = grace;
        self
    }

    pub fn initialize_rate(mut self, max_per_window: usize, window: std::time::Duration) -> Self {
        self.cfg.initialize_max_per_window = max_per_window;
        self.cfg.initialize_window = window;
        self
    }

    /// Operator-supplied route, registered ahead of the MCP endpoints. Paths
    /// must not collide with `/mcp`, `/`, `/health`, `/metrics`, or the
    /// well-known metadata path.
    pub fn route(mut self, path: &str, method_router: MethodRouter) -> Self {
        self.custom_routes = self.custom_routes.route(path, method_router);
        self
    }

    pub fn build(self) -> McpServer {
        let queue = RequestQueue::new(self.queue_opts.clone());

        let mut pipeline = PipelineBuilder::new(self.registry.clone(), queue.clone());
        if let Some(settings) = self.tool_rate_limit {
            pipeline = pipeline.rate_limit(settings);
        }
        if let Some(provider) = &self.auth {
            pipeline = pipeline.auth_provider(provider.clone());
        }
        for mw in self.middlewares {
            pipeline = pipeline.middleware(mw);
        }
        let pipeline = pipeline.validator(self.validator.clone()).build();

        let sessions = SessionManager::new(
            self.cfg.max_sessions,
            self.cfg.session_ttl,
            self.cfg.session_grace,
        );
        let init_limiter = RateLimiter::new(RateLimiterOptions {
            max_requests: self.cfg.initialize_max_per_window,
            window: self.cfg.initialize_window,
        });
        let ip_limit = self.ip_rate_limit.map(|cfg| IpLimit {
            limiter: RateLimiter::new(RateLimiterOptions {
                max_requests: cfg.max_requests,
                window: cfg.window,
            }),
            cfg,
        });
        let samplings = PendingSamplings::new(self.cfg.sampling_timeout);

        let core = Arc::new(ServerCore {
            sessions,
            sse: Arc::new(SseHub::new()),
            samplings,
            queue,
            ip_limit,
            init_limiter,
            metrics: self.metrics,
            otel: self.otel,
            registry: self.registry,
            resources: self.resources,
            pipeline,
            auth: self.auth,
            cfg: self.cfg,
        });

        McpServer {
            core,
            validator: self.validator,
            custom_routes: self.custom_routes,
            reaper: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
        }
    }
}

pub struct McpServer {
    core: Arc<ServerCore>,
    validator: Arc<SchemaValidator>,
    custom_routes: Router,
    reaper: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl McpServer {
    pub fn builder(name: impl Into<String>, version: impl Into<String>) -> McpServerBuilder {
        McpServerBuilder::new(name, version)
    }

    /// Replace-or-insert a tool while the server is running. In-flight calls
    /// complete with the handler they already resolved.
    pub fn live_register_tool(&self, reg: ToolRegistration) -> anyhow::Result<()> {
        self.validator
            .register(&reg.name, &reg.input_schema)
            .with_context(|| format!("register tool {}", reg.name))?;
        self.core.registry.live_register(reg);
        Ok(())
    }

    pub fn unregister_tool(&self, name: &str) -> bool {
        self.validator.unregister(name);
        self.core.registry.unregister(name)
    }

    /// Late-bound resource registration; visible immediately when the
    /// `resources` capability was pre-advertised via `expect_resources`.
    pub fn register_resources(&self, batch: Vec<ResourceRegistration>) -> anyhow::Result<()> {
        self.core.resources.register_batch(batch)?;
        Ok(())
    }

    /// Push a JSON-RPC notification to every SSE client of a session.
    /// Returns how many clients accepted it.
    pub fn notify_session(&self, session_id: &str, method: &str, params: Value) -> usize {
        let msg = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.core.sse.broadcast(session_id, &msg)
    }

    /// Server-initiated `sampling/createMessage` over the session's SSE
    /// stream; resolves when the client POSTs the JSON-RPC response back.
    pub async fn create_message(&self, session_id: &str, params: Value) -> anyhow::Result<Value> {
        self.core
            .samplings
            .request(&self.core.sse, session_id, "sampling/createMessage", params)
            .await
    }

    fn build_router(&self) -> Router {
        let mcp_methods = || {
            post(http::handle_post)
                .get(http::handle_get)
                .delete(http::handle_delete)
        };

        let core_routes = Router::new()
            .route("/mcp", mcp_methods())
            .route("/", mcp_methods())
            .route("/health", get(http::handle_health))
            .route("/metrics", get(http::handle_metrics))
            .route(
                "/.well-known/oauth-protected-resource",
                get(http::handle_protected_resource),
            )
            .with_state(self.core.clone());

        // Operator routes first; collisions with the core endpoints fail at
        // startup rather than shadowing them.
        let mut app = self.custom_routes.clone().merge(core_routes);
        app = app.layer(TraceLayer::new_for_http());
        if let Some(cors) = &self.core.cfg.cors {
            app = app.layer(cors_layer(cors));
        }
        app
    }

    fn spawn_reaper(&self) {
        let core = self.core.clone();
        let interval = core.cfg.session_cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaped = core.sessions.reap_expired();
                if reaped.is_empty() {
                    continue;
                }
                for id in &reaped {
                    core.sse.close_session(id);
                }
                core.metrics.add_sessions_expired(reaped.len() as u64);
                core.otel.record_sessions_expired(reaped.len() as u64);
                info!(count = reaped.len(), "sessions expired");
            }
        });
        *self.reaper.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub async fn serve(&self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        self.serve_on(listener).await
    }

    pub async fn serve_on(&self, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr().context("listener local_addr")?;
        info!(addr = %addr, server = %self.core.cfg.name, "mcp http server listening");

        self.spawn_reaper();

        let (tx, rx) = oneshot::channel::<()>();
        *self.shutdown_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await
            .context("serve http")?;
        Ok(())
    }

    /// Run the line-oriented stdio transport until EOF.
    pub async fn run_stdio(&self) -> anyhow::Result<()> {
        crate::stdio::run(self.core.clone()).await
    }

    /// Start the stdio transport in the background, returning a handle for
    /// server-initiated notifications and the transport task.
    pub fn start_stdio(
        &self,
    ) -> (
        crate::stdio::StdioHandle,
        JoinHandle<anyhow::Result<()>>,
    ) {
        crate::stdio::start(self.core.clone())
    }

    /// Ordered shutdown: stop the session reaper, reject pending sampling
    /// requests, close every SSE stream (in-flight streams would prevent the
    /// listener from draining), then stop the HTTP listener.
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .reaper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        self.core.samplings.cancel_all();
        self.core.sse.close_all();
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = tx.send(());
        }
    }

    pub fn session_count(&self) -> usize {
        self.core.sessions.len()
    }

    pub fn sse_client_count(&self) -> usize {
        self.core.sse.client_count()
    }
}

fn cors_layer(cfg: &crate::config::CorsConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderName::from_static("mcp-session-id"),
            axum::http::HeaderName::from_static("mcp-protocol-version"),
            axum::http::HeaderName::from_static("last-event-id"),
        ])
        .expose_headers([axum::http::HeaderName::from_static("mcp-session-id")]);

    match &cfg.origins {
        Some(origins) => {
            let values: Vec<axum::http::HeaderValue> = origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            layer.allow_origin(AllowOrigin::list(values))
        }
        None => {
            warn!("CORS enabled with wildcard origin; restrict origins in production");
            layer.allow_origin(Any)
        }
    }
}
