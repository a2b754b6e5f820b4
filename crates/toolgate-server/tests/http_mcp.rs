use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use toolgate_auth::{AuthInfo, AuthProvider, ResourceMetadata};
use toolgate_mcp::{CallToolResult, ContentBlock};
use toolgate_runtime::{
    ResourceHandler, ResourceRegistration, ToolOutput, ToolRegistration, tool_fn,
};
use toolgate_server::{CorsConfig, IpRateLimitConfig, McpServer, McpServerBuilder};

struct MockAuthProvider {
    scopes: Vec<String>,
}

#[async_trait]
impl AuthProvider for MockAuthProvider {
    async fn verify_token(&self, token: &str) -> anyhow::Result<Option<AuthInfo>> {
        if token == "valid-token" {
            Ok(Some(AuthInfo {
                subject: "alice".to_string(),
                client_id: None,
                scopes: self.scopes.clone(),
                claims: json!({}),
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
            scopes_supported: vec!["read".to_string(), "admin".to_string()],
        }
    }
}

struct StaticPage {
    html: &'static str,
}

#[async_trait]
impl ResourceHandler for StaticPage {
    async fn read(&self, uri: &url::Url) -> anyhow::Result<toolgate_mcp::ResourceContents> {
        Ok(toolgate_mcp::ResourceContents {
            uri: uri.to_string(),
            mime_type: Some("text/html".to_string()),
            text: self.html.to_string(),
        })
    }
}

fn echo_tool() -> ToolRegistration {
    ToolRegistration::new(
        "echo",
        "Echo the text argument",
        json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"],
        }),
        tool_fn(|args| async move {
            let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
            Ok(ToolOutput::Value(json!({ "echo": text })))
        }),
    )
}

async fn start(builder: McpServerBuilder) -> (Arc<McpServer>, String) {
    let server = Arc::new(builder.build());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let handle = server.clone();
    tokio::spawn(async move {
        let _ = handle.serve_on(listener).await;
    });
    (server, format!("http://{addr}"))
}

async fn rpc(
    client: &reqwest::Client,
    base: &str,
    session: Option<&str>,
    body: Value,
) -> reqwest::Response {
    let mut req = client.post(format!("{base}/mcp")).json(&body);
    if let Some(sid) = session {
        req = req.header("mcp-session-id", sid);
    }
    req.send().await.expect("request")
}

async fn initialize(client: &reqwest::Client, base: &str) -> String {
    let resp = rpc(
        client,
        base,
        None,
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}),
    )
    .await;
    assert_eq!(resp.status(), 200);
    resp.headers()
        .get("mcp-session-id")
        .expect("session header")
        .to_str()
        .expect("header str")
        .to_string()
}

#[tokio::test]
async fn initialize_then_list_and_call_tools() {
    let builder = McpServer::builder("test-server", "0.1.0")
        .tool(echo_tool())
        .expect("register echo");
    let (_server, base) = start(builder).await;
    let client = reqwest::Client::new();

    let session = initialize(&client, &base).await;
    assert_eq!(session.len(), 32);

    // tools/list sees the registered tool.
    let resp = rpc(
        &client,
        &base,
        Some(&session),
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["result"]["tools"][0]["name"], "echo");

    // tools/call wraps the free-form value as a text block.
    let resp = rpc(
        &client,
        &base,
        Some(&session),
        json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call",
            "params": {"name": "echo", "arguments": {"text": "hi"}},
        }),
    )
    .await;
    let body: Value = resp.json().await.expect("json");
    let text = body["result"]["content"][0]["text"]
        .as_str()
        .expect("text block");
    assert!(text.contains("hi"));

    // No auth configured: protected-resource metadata is absent.
    let resp = client
        .get(format!("{base}/.well-known/oauth-protected-resource"))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn health_and_metrics_endpoints() {
    let builder = McpServer::builder("test-server", "0.1.0")
        .tool(echo_tool())
        .expect("register echo");
    let (_server, base) = start(builder).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .expect("health")
        .json()
        .await
        .expect("json");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["server"], "test-server");

    initialize(&client, &base).await;

    let metrics = client
        .get(format!("{base}/metrics"))
        .send()
        .await
        .expect("metrics")
        .text()
        .await
        .expect("text");
    assert!(metrics.contains("toolgate_requests_total"));
    assert!(metrics.contains("toolgate_sessions_active{server=\"test-server\"} 1"));
}

#[tokio::test]
async fn missing_scope_is_403_with_missing_scope_named() {
    let builder = McpServer::builder("test-server", "0.1.0")
        .tool(
            ToolRegistration::new(
                "admin_action",
                "Privileged",
                json!({"type": "object"}),
                tool_fn(|_| async move { Ok(ToolOutput::Value(json!("done"))) }),
            )
            .with_scopes(["admin"]),
        )
        .expect("register")
        .auth_provider(Arc::new(MockAuthProvider {
            scopes: vec!["read".to_string()],
        }));
    let (_server, base) = start(builder).await;
    let client = reqwest::Client::new();

    let session = initialize(&client, &base).await;

    let resp = client
        .post(format!("{base}/mcp"))
        .header("mcp-session-id", &session)
        .header("authorization", "Bearer valid-token")
        .json(&json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "admin_action"},
        }))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 403);
    let body = resp.text().await.expect("body");
    assert!(body.contains("admin"), "403 body must name the missing scope: {body}");
}

#[tokio::test]
async fn missing_and_invalid_tokens_are_401_with_challenge() {
    let builder = McpServer::builder("test-server", "0.1.0")
        .tool(echo_tool())
        .expect("register")
        .auth_provider(Arc::new(MockAuthProvider { scopes: vec![] }));
    let (_server, base) = start(builder).await;
    let client = reqwest::Client::new();

    let session = initialize(&client, &base).await;

    // Missing token.
    let resp = rpc(
        &client,
        &base,
        Some(&session),
        json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "echo", "arguments": {"text": "x"}},
        }),
    )
    .await;
    assert_eq!(resp.status(), 401);
    let challenge = resp
        .headers()
        .get("www-authenticate")
        .expect("challenge")
        .to_str()
        .expect("str");
    assert!(challenge.contains("resource_metadata=\"https://mcp.example.com/.well-known/oauth-protected-resource\""));

    // Invalid token adds the error code.
    let resp = client
        .post(format!("{base}/mcp"))
        .header("mcp-session-id", &session)
        .header("authorization", "Bearer wrong")
        .json(&json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call",
            "params": {"name": "echo", "arguments": {"text": "x"}},
        }))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 401);
    let challenge = resp
        .headers()
        .get("www-authenticate")
        .expect("challenge")
        .to_str()
        .expect("str");
    assert!(challenge.contains("error=\"invalid_token\""));

    // Metadata endpoint is live when auth is configured.
    let body: Value = client
        .get(format!("{base}/.well-known/oauth-protected-resource"))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(body["resource"], "https://mcp.example.com");
    assert_eq!(body["bearer_methods_supported"][0], "header");
}

#[tokio::test]
async fn second_initialize_from_same_ip_is_429() {
    let builder = McpServer::builder("test-server", "0.1.0")
        .tool(echo_tool())
        .expect("register")
        .ip_rate_limit(IpRateLimitConfig::reject(1, Duration::from_secs(60)));
    let (server, base) = start(builder).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/mcp"))
        .header("x-forwarded-for", "203.0.113.5")
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);
    assert_eq!(server.session_count(), 1);

    let resp = client
        .post(format!("{base}/mcp"))
        .header("x-forwarded-for", "203.0.113.5")
        .json(&json!({"jsonrpc": "2.0", "id": 2, "method": "initialize"}))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 429);
    let retry_after: u64 = resp
        .headers()
        .get("retry-after")
        .expect("retry-after")
        .to_str()
        .expect("str")
        .parse()
        .expect("seconds");
    assert!(retry_after >= 1);
    // No session was created for the limited request.
    assert_eq!(server.session_count(), 1);

    // A different client IP still has budget.
    let resp = client
        .post(format!("{base}/mcp"))
        .header("x-forwarded-for", "198.51.100.9")
        .json(&json!({"jsonrpc": "2.0", "id": 3, "method": "initialize"}))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn initialize_budget_is_separate_from_general_traffic() {
    let builder = McpServer::builder("test-server", "0.1.0")
        .tool(echo_tool())
        .expect("register")
        .initialize_rate(2, Duration::from_secs(60));
    let (_server, base) = start(builder).await;
    let client = reqwest::Client::new();

    for id in 1..=2 {
        let resp = client
            .post(format!("{base}/mcp"))
            .header("x-forwarded-for", "203.0.113.77")
            .json(&json!({"jsonrpc": "2.0", "id": id, "method": "initialize"}))
            .send()
            .await
            .expect("request");
        assert_eq!(resp.status(), 200);
    }

    let resp = client
        .post(format!("{base}/mcp"))
        .header("x-forwarded-for", "203.0.113.77")
        .json(&json!({"jsonrpc": "2.0", "id": 3, "method": "initialize"}))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 429);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"]["code"], -32000);
    assert_eq!(body["error"]["message"], "Too many initialize requests");
}

#[tokio::test]
async fn cors_reflects_allowlisted_origin_only() {
    let builder = McpServer::builder("test-server", "0.1.0")
        .tool(echo_tool())
        .expect("register")
        .cors(CorsConfig {
            origins: Some(vec!["https://app.example.com".to_string()]),
        });
    let (_server, base) = start(builder).await;
    let client = reqwest::Client::new();

    let resp = client
        .request(reqwest::Method::OPTIONS, format!("{base}/mcp"))
        .header("origin", "https://app.example.com")
        .header("access-control-request-method", "POST")
        .send()
        .await
        .expect("preflight");
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .expect("allow-origin")
            .to_str()
            .expect("str"),
        "https://app.example.com"
    );

    let resp = client
        .request(reqwest::Method::OPTIONS, format!("{base}/mcp"))
        .header("origin", "https://evil.example.com")
        .header("access-control-request-method", "POST")
        .send()
        .await
        .expect("preflight");
    assert!(resp.headers().get("access-control-allow-origin").is_none());
}

#[tokio::test]
async fn stale_session_is_404() {
    let builder = McpServer::builder("test-server", "0.1.0")
        .tool(echo_tool())
        .expect("register");
    let (_server, base) = start(builder).await;
    let client = reqwest::Client::new();

    let resp = rpc(
        &client,
        &base,
        Some("ffffffffffffffffffffffffffffffff"),
        json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/call",
            "params": {"name": "echo", "arguments": {"text": "x"}},
        }),
    )
    .await;
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"]["code"], -32001);
}

#[tokio::test]
async fn oversized_body_is_413() {
    let builder = McpServer::builder("test-server", "0.1.0")
        .tool(echo_tool())
        .expect("register")
        .max_body_bytes(Some(64));
    let (_server, base) = start(builder).await;
    let client = reqwest::Client::new();

    let big = "x".repeat(1024);
    let resp = rpc(
        &client,
        &base,
        None,
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {"pad": big}}),
    )
    .await;
    assert_eq!(resp.status(), 413);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"]["code"], -32000);
}

#[tokio::test]
async fn protocol_errors_map_to_jsonrpc_codes() {
    let builder = McpServer::builder("test-server", "0.1.0")
        .tool(echo_tool())
        .expect("register");
    let (_server, base) = start(builder).await;
    let client = reqwest::Client::new();
    let session = initialize(&client, &base).await;

    // Unknown method.
    let body: Value = rpc(
        &client,
        &base,
        Some(&session),
        json!({"jsonrpc": "2.0", "id": 2, "method": "bogus/method"}),
    )
    .await
    .json()
    .await
    .expect("json");
    assert_eq!(body["error"]["code"], -32601);

    // Unknown tool.
    let body: Value = rpc(
        &client,
        &base,
        Some(&session),
        json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call",
            "params": {"name": "missing_tool"},
        }),
    )
    .await
    .json()
    .await
    .expect("json");
    assert_eq!(body["error"]["code"], -32602);
    assert!(
        body["error"]["message"]
            .as_str()
            .expect("message")
            .starts_with("Unknown tool")
    );

    // Schema violation.
    let body: Value = rpc(
        &client,
        &base,
        Some(&session),
        json!({
            "jsonrpc": "2.0", "id": 4, "method": "tools/call",
            "params": {"name": "echo", "arguments": {}},
        }),
    )
    .await
    .json()
    .await
    .expect("json");
    assert_eq!(body["error"]["code"], -32602);
    assert!(
        body["error"]["message"]
            .as_str()
            .expect("message")
            .contains("Missing required property: text")
    );

    // Notification: accepted with an empty body.
    let resp = rpc(
        &client,
        &base,
        Some(&session),
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
    )
    .await;
    assert_eq!(resp.status(), 202);
    assert!(resp.text().await.expect("body").is_empty());

    // Parse error.
    let resp = client
        .post(format!("{base}/mcp"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .expect("request");
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"]["code"], -32700);
}

#[tokio::test]
async fn preformatted_results_pass_through_unchanged() {
    let builder = McpServer::builder("test-server", "0.1.0")
        .tool(ToolRegistration::new(
            "formatted",
            "Returns a preformatted result",
            json!({"type": "object"}),
            tool_fn(|_| async move {
                Ok(ToolOutput::Result(CallToolResult {
                    content: vec![ContentBlock::Text {
                        text: "already formatted".to_string(),
                    }],
                    structured_content: Some(json!({"k": 1})),
                    is_error: Some(false),
                    meta: Some(json!({"source": "test"})),
                }))
            }),
        ))
        .expect("register");
    let (_server, base) = start(builder).await;
    let client = reqwest::Client::new();
    let session = initialize(&client, &base).await;

    let body: Value = rpc(
        &client,
        &base,
        Some(&session),
        json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "formatted"},
        }),
    )
    .await
    .json()
    .await
    .expect("json");
    assert_eq!(body["result"]["content"][0]["text"], "already formatted");
    assert_eq!(body["result"]["structuredContent"]["k"], 1);
    assert_eq!(body["result"]["_meta"]["source"], "test");
}

#[tokio::test]
async fn handler_errors_are_internal_errors_with_message() {
    let builder = McpServer::builder("test-server", "0.1.0")
        .tool(ToolRegistration::new(
            "boom",
            "Always fails",
            json!({"type": "object"}),
            tool_fn(|_| async move { anyhow::bail!("kaboom") }),
        ))
        .expect("register");
    let (_server, base) = start(builder).await;
    let client = reqwest::Client::new();
    let session = initialize(&client, &base).await;

    let resp = rpc(
        &client,
        &base,
        Some(&session),
        json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "boom"},
        }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["error"]["code"], -32603);
    assert!(
        body["error"]["message"]
            .as_str()
            .expect("message")
            .contains("kaboom")
    );
}

#[tokio::test]
async fn resources_are_listed_read_and_csp_injected() {
    let builder = McpServer::builder("test-server", "0.1.0")
        .tool(echo_tool())
        .expect("register")
        .resources(vec![ResourceRegistration {
            uri: "ui://widget/hello".to_string(),
            name: "hello".to_string(),
            description: Some("Demo page".to_string()),
            mime_type: Some("text/html".to_string()),
            handler: Arc::new(StaticPage {
                html: "<html><head></head><body>hi</body></html>",
            }),
        }])
        .expect("resources")
        .resource_csp("default-src 'self'");
    let (_server, base) = start(builder).await;
    let client = reqwest::Client::new();

    let session = initialize(&client, &base).await;

    let body: Value = rpc(
        &client,
        &base,
        Some(&session),
        json!({"jsonrpc": "2.0", "id": 2, "method": "resources/list"}),
    )
    .await
    .json()
    .await
    .expect("json");
    assert_eq!(body["result"]["resources"][0]["uri"], "ui://widget/hello");

    let body: Value = rpc(
        &client,
        &base,
        Some(&session),
        json!({
            "jsonrpc": "2.0", "id": 3, "method": "resources/read",
            "params": {"uri": "ui://widget/hello"},
        }),
    )
    .await
    .json()
    .await
    .expect("json");
    let text = body["result"]["contents"][0]["text"]
        .as_str()
        .expect("text");
    assert!(text.contains("Content-Security-Policy"));
    assert!(text.contains("default-src &quot;self&quot;") || text.contains("default-src 'self'"));

    let body: Value = rpc(
        &client,
        &base,
        Some(&session),
        json!({
            "jsonrpc": "2.0", "id": 4, "method": "resources/read",
            "params": {"uri": "ui://widget/missing"},
        }),
    )
    .await
    .json()
    .await
    .expect("json");
    assert_eq!(body["error"]["code"], -32602);
}

#[tokio::test]
async fn capabilities_advertise_resources_only_when_present_or_expected() {
    // Without resources.
    let builder = McpServer::builder("test-server", "0.1.0")
        .tool(echo_tool())
        .expect("register");
    let (_server, base) = start(builder).await;
    let client = reqwest::Client::new();
    let resp = rpc(
        &client,
        &base,
        None,
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}),
    )
    .await;
    let body: Value = resp.json().await.expect("json");
    assert!(body["result"]["capabilities"]["tools"].is_object());
    assert!(body["result"]["capabilities"].get("resources").is_none());

    // Expect-resources pre-advertises before anything is registered.
    let builder = McpServer::builder("test-server", "0.1.0")
        .tool(echo_tool())
        .expect("register")
        .expect_resources();
    let (server, base) = start(builder).await;
    let resp = rpc(
        &client,
        &base,
        None,
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}),
    )
    .await;
    let body: Value = resp.json().await.expect("json");
    assert!(body["result"]["capabilities"]["resources"].is_object());

    // Late-bound resources become visible without renegotiation.
    server
        .register_resources(vec![ResourceRegistration {
            uri: "ui://late/one".to_string(),
            name: "late".to_string(),
            description: None,
            mime_type: Some("text/html".to_string()),
            handler: Arc::new(StaticPage { html: "<p>late</p>" }),
        }])
        .expect("late registration");
    let session = initialize(&client, &base).await;
    let body: Value = rpc(
        &client,
        &base,
        Some(&session),
        json!({"jsonrpc": "2.0", "id": 2, "method": "resources/list"}),
    )
    .await
    .json()
    .await
    .expect("json");
    assert_eq!(body["result"]["resources"][0]["uri"], "ui://late/one");
}

#[tokio::test]
async fn get_without_event_stream_accept_is_405() {
    let builder = McpServer::builder("test-server", "0.1.0")
        .tool(echo_tool())
        .expect("register");
    let (_server, base) = start(builder).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{base}/mcp"))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 405);
}

#[tokio::test]
async fn delete_ends_the_session() {
    let builder = McpServer::builder("test-server", "0.1.0")
        .tool(echo_tool())
        .expect("register");
    let (server, base) = start(builder).await;
    let client = reqwest::Client::new();
    let session = initialize(&client, &base).await;
    assert_eq!(server.session_count(), 1);

    let resp = client
        .delete(format!("{base}/mcp"))
        .header("mcp-session-id", &session)
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 202);
    assert_eq!(server.session_count(), 0);

    // The session is gone for subsequent calls.
    let resp = rpc(
        &client,
        &base,
        Some(&session),
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
    )
    .await;
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn root_path_serves_the_same_endpoint() {
    let builder = McpServer::builder("test-server", "0.1.0")
        .tool(echo_tool())
        .expect("register");
    let (_server, base) = start(builder).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/"))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().get("mcp-session-id").is_some());
}
