use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::{error, warn};

use toolgate_auth::{AuthError, AuthInfo, extract_bearer};
use toolgate_mcp::{
    CallToolParams, InitializeParams, InitializeResult, JsonRpcError, JsonRpcId, JsonRpcMessage,
    JsonRpcRequest, JsonRpcResponse, ListResourcesResult, ListToolsResult, McpServerInfo,
    PROTOCOL_VERSION_2025_06_18, PROTOCOL_VERSION_LATEST, ReadResourceParams, ReadResourceResult,
    error_codes,
};
use toolgate_runtime::{HttpRequestInfo, InvocationContext, PipelineError, RateLimitMode};

use crate::config::IpRequestInfo;
use crate::ip::client_ip;
use crate::server::ServerCore;
use crate::sse::ANONYMOUS_SESSION;

const SESSION_HEADER: &str = "mcp-session-id";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

fn json_body(resp: &JsonRpcResponse) -> Body {
    Body::from(serde_json::to_string(resp).unwrap_or_else(|_| "{}".to_string()))
}

fn rpc_response(
    status: StatusCode,
    resp: JsonRpcResponse,
    session_id: Option<&str>,
    extra_headers: &[(header::HeaderName, HeaderValue)],
) -> Response {
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json");

    if let Some(sid) = session_id
        && let Ok(v) = HeaderValue::from_str(sid)
    {
        builder = builder.header(SESSION_HEADER, v);
    }
    for (name, value) in extra_headers {
        builder = builder.header(name.clone(), value.clone());
    }

    builder
        .body(json_body(&resp))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn rpc_ok(id: JsonRpcId, result: Value, session_id: Option<&str>) -> Response {
    rpc_response(
        StatusCode::OK,
        JsonRpcResponse::ok(id, result),
        session_id,
        &[],
    )
}

fn rpc_error(status: StatusCode, id: JsonRpcId, code: i64, message: impl Into<String>) -> Response {
    rpc_response(
        status,
        JsonRpcResponse::err(id, JsonRpcError::new(code, message)),
        None,
        &[],
    )
}

/// Escape a value for a quoted-string parameter in `WWW-Authenticate`.
fn escape_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn www_authenticate(err: &AuthError) -> String {
    let mut parts = Vec::new();
    if let Some(url) = err.resource_metadata_url() {
        parts.push(format!("resource_metadata=\"{}\"", escape_quoted(url)));
    }
    if let Some(code) = err.bearer_error_code() {
        parts.push(format!("error=\"{code}\""));
        parts.push(format!(
            "error_description=\"{}\"",
            escape_quoted(&err.to_string())
        ));
    }
    if parts.is_empty() {
        "Bearer".to_string()
    } else {
        format!("Bearer {}", parts.join(", "))
    }
}

fn auth_error_response(id: JsonRpcId, err: AuthError) -> Response {
    match &err {
        AuthError::MissingToken { .. } | AuthError::InvalidToken { .. } => {
            let challenge = www_authenticate(&err);
            let value = HeaderValue::from_str(&challenge)
                .unwrap_or_else(|_| HeaderValue::from_static("Bearer"));
            rpc_response(
                StatusCode::UNAUTHORIZED,
                JsonRpcResponse::err(
                    id,
                    JsonRpcError::new(error_codes::SESSION_NOT_FOUND, "Unauthorized"),
                ),
                None,
                &[(header::WWW_AUTHENTICATE, value)],
            )
        }
        AuthError::InsufficientScope { missing, .. } => rpc_response(
            StatusCode::FORBIDDEN,
            JsonRpcResponse::err(
                id,
                JsonRpcError::with_data(
                    error_codes::SESSION_NOT_FOUND,
                    err.to_string(),
                    serde_json::json!({ "missing_scopes": missing }),
                ),
            ),
            None,
            &[],
        ),
    }
}

fn retry_after_secs(wait: Duration) -> u64 {
    (wait.as_millis() as u64).div_ceil(1000).max(1)
}

fn too_many_requests(wait: Duration, message: &str) -> Response {
    let secs = retry_after_secs(wait);
    let value = HeaderValue::from_str(&secs.to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("1"));
    rpc_response(
        StatusCode::TOO_MANY_REQUESTS,
        JsonRpcResponse::err(
            JsonRpcId::Null,
            JsonRpcError::new(error_codes::SERVER_OVERLOADED, message),
        ),
        None,
        &[(header::RETRY_AFTER, value)],
    )
}

fn payload_too_large(core: &ServerCore) -> Response {
    core.metrics.incr_payloads_rejected();
    rpc_error(
        StatusCode::PAYLOAD_TOO_LARGE,
        JsonRpcId::Null,
        error_codes::SERVER_OVERLOADED,
        "Payload too large",
    )
}

/// Transport-level IP rate limit, applied before anything else.
async fn check_ip_limit(
    core: &ServerCore,
    headers: &HeaderMap,
    method: &str,
    path: &str,
    ip: &str,
) -> Option<Response> {
    let limit = core.ip_limit.as_ref()?;
    let key = match &limit.cfg.key_extractor {
        Some(extract) => extract(&IpRequestInfo {
            ip,
            method,
            path,
            headers,
            session_id: header_str(headers, SESSION_HEADER),
        }),
        None => ip.to_string(),
    };

    match limit.cfg.mode {
        RateLimitMode::Reject => {
            if limit.limiter.check_limit(&key) {
                None
            } else {
                core.metrics.incr_rate_limited();
                Some(too_many_requests(
                    limit.limiter.time_until_slot(&key),
                    "Rate limit exceeded",
                ))
            }
        }
        RateLimitMode::Wait => {
            match tokio::time::timeout(limit.cfg.wait_timeout, limit.limiter.wait_for_slot(&key))
                .await
            {
                Ok(()) => None,
                Err(_) => {
                    core.metrics.incr_rate_limited();
                    Some(too_many_requests(
                        limit.limiter.time_until_slot(&key),
                        "Rate limit exceeded",
                    ))
                }
            }
        }
    }
}

/// Bearer gate used by the methods that are auth-checked outside the
/// pipeline (`tools/list`, `resources/*`, SSE). No provider → no gate.
async fn authorize(core: &ServerCore, headers: &HeaderMap) -> Result<Option<AuthInfo>, AuthError> {
    let Some(provider) = &core.auth else {
        return Ok(None);
    };
    let metadata_url = provider.resource_metadata().metadata_url();

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(extract_bearer);
    let Some(token) = token else {
        return Err(AuthError::MissingToken {
            resource_metadata_url: Some(metadata_url),
        });
    };

    match provider.verify_token(token).await {
        Ok(Some(info)) => Ok(Some(info)),
        _ => Err(AuthError::InvalidToken {
            resource_metadata_url: Some(metadata_url),
        }),
    }
}

/// Enforce the body limit twice: a `Content-Length` precheck that refuses
/// without reading, then a streaming cap while accumulating.
async fn read_body(
    core: &ServerCore,
    headers: &HeaderMap,
    body: Body,
) -> Result<axum::body::Bytes, Response> {
    let limit = core.cfg.max_body_bytes;

    if let Some(limit) = limit
        && let Some(len) = header_str(headers, "content-length").and_then(|v| v.parse::<usize>().ok())
        && len > limit
    {
        return Err(payload_too_large(core));
    }

    let cap = limit.unwrap_or(usize::MAX);
    axum::body::to_bytes(body, cap)
        .await
        .map_err(|_| payload_too_large(core))
}

fn negotiate_protocol(requested: Option<&str>) -> String {
    match requested {
        Some(v) if v == PROTOCOL_VERSION_LATEST || v == PROTOCOL_VERSION_2025_06_18 => {
            v.to_string()
        }
        _ => PROTOCOL_VERSION_LATEST.to_string(),
    }
}

fn capabilities(core: &ServerCore) -> Value {
    let mut caps = serde_json::json!({ "tools": {} });
    if !core.resources.is_empty() || core.cfg.expect_resources {
        caps["resources"] = serde_json::json!({});
    }
    caps
}

fn handle_initialize(core: &ServerCore, req: JsonRpcRequest, ip: &str) -> Response {
    if !core.init_limiter.check_limit(ip) {
        core.metrics.incr_rate_limited();
        let wait = core.init_limiter.time_until_slot(ip);
        let secs = retry_after_secs(wait);
        let value = HeaderValue::from_str(&secs.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("1"));
        return rpc_response(
            StatusCode::TOO_MANY_REQUESTS,
            JsonRpcResponse::err(
                req.id,
                JsonRpcError::new(
                    error_codes::SERVER_OVERLOADED,
                    "Too many initialize requests",
                ),
            ),
            None,
            &[(header::RETRY_AFTER, value)],
        );
    }

    let session_id = match core.sessions.create() {
        Ok(id) => id,
        Err(_) => {
            warn!(sessions = core.sessions.len(), "session cap reached");
            return rpc_error(
                StatusCode::SERVICE_UNAVAILABLE,
                req.id,
                error_codes::SERVER_OVERLOADED,
                "Too many active sessions",
            );
        }
    };

    let params: Option<InitializeParams> = req
        .params
        .and_then(|v| serde_json::from_value(v).ok());
    let negotiated = negotiate_protocol(params.as_ref().map(|p| p.protocol_version.as_str()));

    let result = InitializeResult {
        protocol_version: negotiated,
        capabilities: capabilities(core),
        server_info: McpServerInfo {
            name: core.cfg.name.clone(),
            version: core.cfg.version.clone(),
        },
        instructions: core.cfg.instructions.clone(),
    };

    rpc_ok(
        req.id,
        serde_json::to_value(result).unwrap_or(Value::Null),
        Some(&session_id),
    )
}

fn pipeline_error_response(
    core: &ServerCore,
    id: JsonRpcId,
    tool: &str,
    err: PipelineError,
) -> Response {
    match err {
        PipelineError::Auth(auth) => auth_error_response(id, auth),
        PipelineError::UnknownTool(_) => {
            rpc_error(StatusCode::OK, id, error_codes::INVALID_PARAMS, err.to_string())
        }
        PipelineError::Validation(message) => {
            rpc_error(StatusCode::OK, id, error_codes::INVALID_PARAMS, message)
        }
        PipelineError::RateLimited { .. } => {
            core.metrics.incr_rate_limited();
            rpc_error(
                StatusCode::OK,
                id,
                error_codes::SERVER_OVERLOADED,
                err.to_string(),
            )
        }
        PipelineError::CapacityExceeded { .. } => rpc_error(
            StatusCode::OK,
            id,
            error_codes::SERVER_OVERLOADED,
            err.to_string(),
        ),
        PipelineError::Misconfigured(message) => {
            error!(tool, message, "pipeline misconfiguration");
            rpc_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                id,
                error_codes::INTERNAL_ERROR,
                "Internal error",
            )
        }
        PipelineError::Handler(e) => {
            error!(tool, error = %e, "tool handler failed");
            rpc_error(
                StatusCode::OK,
                id,
                error_codes::INTERNAL_ERROR,
                e.to_string(),
            )
        }
    }
}

async fn dispatch_tools_call(
    core: &ServerCore,
    headers: &HeaderMap,
    path: &str,
    req: JsonRpcRequest,
    session_id: Option<&str>,
    ip: String,
) -> Response {
    let Some(params) = req.params else {
        return rpc_error(
            StatusCode::OK,
            req.id,
            error_codes::INVALID_PARAMS,
            "missing params",
        );
    };
    let params: CallToolParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => {
            return rpc_error(StatusCode::OK, req.id, error_codes::INVALID_PARAMS, e.to_string());
        }
    };

    core.metrics.incr_tool_calls();
    core.otel.record_tool_call(&params.name);

    let mut ctx = InvocationContext::new(
        params.name.clone(),
        params.arguments.unwrap_or_else(|| serde_json::json!({})),
    )
    .with_request(HttpRequestInfo {
        headers: headers.clone(),
        client_ip: ip,
        method: "POST".to_string(),
        path: path.to_string(),
    });
    if let Some(sid) = session_id {
        ctx = ctx.with_session(sid);
    }

    let started = Instant::now();
    match core.pipeline.run(&mut ctx).await {
        Ok(output) => {
            core.metrics.observe_call_duration(started.elapsed());
            let result = serde_json::to_value(output.into_call_result()).unwrap_or(Value::Null);
            rpc_ok(req.id, result, session_id)
        }
        Err(err) => {
            core.metrics.incr_tool_errors();
            pipeline_error_response(core, req.id, &params.name, err)
        }
    }
}

async fn dispatch_resources_read(
    core: &ServerCore,
    req: JsonRpcRequest,
    session_id: Option<&str>,
) -> Response {
    let params: ReadResourceParams = match req.params.map(serde_json::from_value).transpose() {
        Ok(Some(p)) => p,
        _ => {
            return rpc_error(
                StatusCode::OK,
                req.id,
                error_codes::INVALID_PARAMS,
                "missing params",
            );
        }
    };

    let Some(resource) = core.resources.get(&params.uri) else {
        return rpc_error(
            StatusCode::OK,
            req.id,
            error_codes::INVALID_PARAMS,
            format!("Resource not found: {}", params.uri),
        );
    };

    let parsed = match url::Url::parse(&resource.uri) {
        Ok(u) => u,
        Err(e) => {
            return rpc_error(
                StatusCode::OK,
                req.id,
                error_codes::INVALID_PARAMS,
                format!("Invalid resource uri: {e}"),
            );
        }
    };

    match resource.handler.read(&parsed).await {
        Ok(mut contents) => {
            if let Some(policy) = &core.cfg.resource_csp
                && contents
                    .mime_type
                    .as_deref()
                    .is_some_and(|m| m.starts_with("text/html"))
            {
                contents.text = inject_csp(&contents.text, policy);
            }
            let result = ReadResourceResult {
                contents: vec![contents],
            };
            rpc_ok(
                req.id,
                serde_json::to_value(result).unwrap_or(Value::Null),
                session_id,
            )
        }
        Err(e) => {
            error!(uri = %params.uri, error = %e, "resource read failed");
            rpc_error(
                StatusCode::OK,
                req.id,
                error_codes::INTERNAL_ERROR,
                e.to_string(),
            )
        }
    }
}

/// Insert a CSP `<meta>` tag right after `<head>`, or prepend one when the
/// document has no head element.
fn inject_csp(html: &str, policy: &str) -> String {
    let meta = format!(
        r#"<meta http-equiv="Content-Security-Policy" content="{}">"#,
        policy.replace('"', "&quot;")
    );
    let lower = html.to_lowercase();
    match lower.find("<head>") {
        Some(idx) => {
            let insert_at = idx + "<head>".len();
            format!("{}{}{}", &html[..insert_at], meta, &html[insert_at..])
        }
        None => format!("{meta}{html}"),
    }
}

async fn dispatch_request(
    core: &ServerCore,
    headers: &HeaderMap,
    path: &str,
    req: JsonRpcRequest,
    session_id: Option<&str>,
    ip: String,
) -> Response {
    match req.method.as_str() {
        "ping" => rpc_ok(req.id, serde_json::json!({}), session_id),
        "tools/call" => dispatch_tools_call(core, headers, path, req, session_id, ip).await,
        "tools/list" => {
            if let Err(e) = authorize(core, headers).await {
                return auth_error_response(req.id, e);
            }
            let result = ListToolsResult {
                tools: core.registry.list(),
                next_cursor: None,
            };
            rpc_ok(
                req.id,
                serde_json::to_value(result).unwrap_or(Value::Null),
                session_id,
            )
        }
        "resources/list" => {
            if let Err(e) = authorize(core, headers).await {
                return auth_error_response(req.id, e);
            }
            let result = ListResourcesResult {
                resources: core.resources.list(),
            };
            rpc_ok(
                req.id,
                serde_json::to_value(result).unwrap_or(Value::Null),
                session_id,
            )
        }
        "resources/read" => {
            if let Err(e) = authorize(core, headers).await {
                return auth_error_response(req.id, e);
            }
            dispatch_resources_read(core, req, session_id).await
        }
        other => rpc_error(
            StatusCode::OK,
            req.id,
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        ),
    }
}

pub(crate) async fn handle_post(
    State(core): State<Arc<ServerCore>>,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    core.metrics.incr_requests();
    let path = uri.path().to_string();
    let ip = client_ip(&headers);

    if let Some(resp) = check_ip_limit(&core, &headers, "POST", &path, &ip).await {
        return resp;
    }

    let bytes = match read_body(&core, &headers, body).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    let value: Value = match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(_) => {
            return rpc_error(
                StatusCode::OK,
                JsonRpcId::Null,
                error_codes::PARSE_ERROR,
                "Parse error",
            );
        }
    };

    if value.is_array() {
        return rpc_error(
            StatusCode::OK,
            JsonRpcId::Null,
            error_codes::INVALID_REQUEST,
            "batching not supported",
        );
    }

    let msg: JsonRpcMessage = match serde_json::from_value(value) {
        Ok(m) => m,
        Err(_) => {
            return rpc_error(
                StatusCode::OK,
                JsonRpcId::Null,
                error_codes::INVALID_REQUEST,
                "Invalid Request",
            );
        }
    };

    match msg {
        // A response from the client resolves a pending server-initiated
        // request (sampling).
        JsonRpcMessage::Response(resp) => {
            if let JsonRpcId::Number(id) = resp.id {
                let outcome = match (resp.result, resp.error) {
                    (Some(result), _) => Ok(result),
                    (None, Some(err)) => Err(err.message),
                    (None, None) => Err("empty response".to_string()),
                };
                core.samplings.resolve(id, outcome);
            }
            StatusCode::ACCEPTED.into_response()
        }
        JsonRpcMessage::Request(req) if req.method == "initialize" => {
            handle_initialize(&core, req, &ip)
        }
        msg => {
            // Everything after initialize requires a live session when a
            // session id is presented.
            let session_id = header_str(&headers, SESSION_HEADER).map(str::to_string);
            if let Some(sid) = &session_id
                && !core.sessions.touch(sid)
            {
                let id = match &msg {
                    JsonRpcMessage::Request(r) => r.id.clone(),
                    _ => JsonRpcId::Null,
                };
                return rpc_error(
                    StatusCode::NOT_FOUND,
                    id,
                    error_codes::SESSION_NOT_FOUND,
                    "Session not found or expired",
                );
            }

            match msg {
                JsonRpcMessage::Notification(_) => StatusCode::ACCEPTED.into_response(),
                JsonRpcMessage::Request(req) => {
                    dispatch_request(&core, &headers, &path, req, session_id.as_deref(), ip).await
                }
                JsonRpcMessage::Response(_) => StatusCode::ACCEPTED.into_response(),
            }
        }
    }
}

pub(crate) async fn handle_get(
    State(core): State<Arc<ServerCore>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    core.metrics.incr_requests();

    let accepts_sse = header_str(&headers, "accept")
        .map(|a| a.to_ascii_lowercase().contains("text/event-stream"))
        .unwrap_or(false);
    if !accepts_sse {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            "SSE requires Accept: text/event-stream",
        )
            .into_response();
    }

    let path = uri.path().to_string();
    let ip = client_ip(&headers);
    if let Some(resp) = check_ip_limit(&core, &headers, "GET", &path, &ip).await {
        return resp;
    }

    if let Err(e) = authorize(&core, &headers).await {
        return auth_error_response(JsonRpcId::Null, e);
    }

    let session_id = header_str(&headers, SESSION_HEADER).map(str::to_string);
    if let Some(sid) = &session_id
        && !core.sessions.touch(sid)
    {
        return rpc_error(
            StatusCode::NOT_FOUND,
            JsonRpcId::Null,
            error_codes::SESSION_NOT_FOUND,
            "Session not found or expired",
        );
    }

    let key = session_id.as_deref().unwrap_or(ANONYMOUS_SESSION);
    let stream = core.sse.register(key);

    let mut resp = axum::response::Sse::new(stream).into_response();
    let headers_mut = resp.headers_mut();
    headers_mut.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers_mut.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    if let Some(sid) = &session_id
        && let Ok(v) = HeaderValue::from_str(sid)
    {
        headers_mut.insert(SESSION_HEADER, v);
    }
    resp
}

pub(crate) async fn handle_delete(
    State(core): State<Arc<ServerCore>>,
    headers: HeaderMap,
) -> Response {
    let Some(sid) = header_str(&headers, SESSION_HEADER) else {
        return (StatusCode::BAD_REQUEST, "missing mcp-session-id").into_response();
    };
    core.sessions.remove(sid);
    core.sse.close_session(sid);
    StatusCode::ACCEPTED.into_response()
}

pub(crate) async fn handle_health(State(core): State<Arc<ServerCore>>) -> Response {
    axum::Json(serde_json::json!({
        "status": "ok",
        "server": core.cfg.name,
        "version": core.cfg.version,
    }))
    .into_response()
}

pub(crate) async fn handle_metrics(State(core): State<Arc<ServerCore>>) -> Response {
    let gauges = [
        toolgate_otel::GaugeSample {
            name: "toolgate_sessions_active",
            help: "Active sessions.",
            value: core.sessions.len() as u64,
        },
        toolgate_otel::GaugeSample {
            name: "toolgate_sse_clients_active",
            help: "Connected SSE clients.",
            value: core.sse.client_count() as u64,
        },
        toolgate_otel::GaugeSample {
            name: "toolgate_queue_in_flight",
            help: "Requests holding a backpressure slot.",
            value: core.queue.in_flight() as u64,
        },
        toolgate_otel::GaugeSample {
            name: "toolgate_queue_waiting",
            help: "Requests waiting for a backpressure slot.",
            value: core.queue.queued() as u64,
        },
    ];
    let body = core.metrics.render_prometheus(&core.cfg.name, &gauges);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

pub(crate) async fn handle_protected_resource(State(core): State<Arc<ServerCore>>) -> Response {
    match &core.auth {
        Some(provider) => {
            axum::Json(provider.resource_metadata().to_value()).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn www_authenticate_escapes_quotes_and_backslashes() {
        let err = AuthError::InvalidToken {
            resource_metadata_url: Some(r#"https://x/"a\b"#.to_string()),
        };
        let value = www_authenticate(&err);
        assert!(value.starts_with("Bearer resource_metadata=\""));
        assert!(value.contains(r#"\"a\\b"#), "got: {value}");
        assert!(value.contains("error=\"invalid_token\""));
        assert!(value.contains("error_description=\"Invalid bearer token\""));
    }

    #[test]
    fn www_authenticate_missing_token_has_no_error_code() {
        let err = AuthError::MissingToken {
            resource_metadata_url: Some("https://x/.well-known/oauth-protected-resource".to_string()),
        };
        let value = www_authenticate(&err);
        assert!(value.contains("resource_metadata="));
        assert!(!value.contains("error="));
    }

    #[test]
    fn csp_injected_after_head() {
        let html = "<html><head><title>t</title></head><body></body></html>";
        let out = inject_csp(html, "default-src 'self'");
        let head_pos = out.find("<head>").expect("head");
        let meta_pos = out.find("<meta http-equiv").expect("meta");
        assert_eq!(meta_pos, head_pos + "<head>".len());
    }

    #[test]
    fn csp_prepended_without_head() {
        let out = inject_csp("<p>hi</p>", "default-src 'none'");
        assert!(out.starts_with("<meta http-equiv"));
        assert!(out.ends_with("<p>hi</p>"));
    }

    #[test]
    fn retry_after_rounds_up_and_is_at_least_one() {
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(10)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1001)), 2);
        assert_eq!(retry_after_secs(Duration::from_secs(30)), 30);
    }

    #[test]
    fn protocol_negotiation_falls_back_to_latest() {
        assert_eq!(
            negotiate_protocol(Some(PROTOCOL_VERSION_2025_06_18)),
            PROTOCOL_VERSION_2025_06_18
        );
        assert_eq!(negotiate_protocol(Some("1999-01-01")), PROTOCOL_VERSION_LATEST);
        assert_eq!(negotiate_protocol(None), PROTOCOL_VERSION_LATEST);
    }
}
