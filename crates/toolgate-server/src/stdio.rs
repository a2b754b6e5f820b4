use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::sync::mpsc;
use tracing::error;

use toolgate_mcp::{
    CallToolParams, InitializeParams, InitializeResult, JsonRpcError, JsonRpcId, JsonRpcMessage,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListResourcesResult, ListToolsResult,
    McpServerInfo, PROTOCOL_VERSION_LATEST, ReadResourceParams, ReadResourceResult,
    error_codes,
};
use toolgate_runtime::{InvocationContext, PipelineError};

use crate::server::ServerCore;

/// Writer handle for server-initiated notifications on the stdio stream.
#[derive(Clone)]
pub struct StdioHandle {
    tx: mpsc::UnboundedSender<String>,
}

impl StdioHandle {
    pub fn send_notification(&self, method: &str, params: Value) -> anyhow::Result<()> {
        let line = serde_json::to_string(&JsonRpcNotification::new(method, Some(params)))?;
        self.tx
            .send(line)
            .map_err(|_| anyhow::anyhow!("stdio writer closed"))
    }
}

fn err_response(id: JsonRpcId, code: i64, message: impl Into<String>) -> JsonRpcResponse {
    JsonRpcResponse::err(id, JsonRpcError::new(code, message))
}

fn stdio_error(id: JsonRpcId, err: PipelineError) -> JsonRpcResponse {
    let code = match &err {
        PipelineError::UnknownTool(_) | PipelineError::Validation(_) => error_codes::INVALID_PARAMS,
        PipelineError::RateLimited { .. } | PipelineError::CapacityExceeded { .. } => {
            error_codes::SERVER_OVERLOADED
        }
        PipelineError::Auth(_) => error_codes::SESSION_NOT_FOUND,
        PipelineError::Misconfigured(_) | PipelineError::Handler(_) => error_codes::INTERNAL_ERROR,
    };
    err_response(id, code, err.to_string())
}

fn capabilities(core: &ServerCore) -> Value {
    let mut caps = serde_json::json!({ "tools": {} });
    if !core.resources.is_empty() || core.cfg.expect_resources {
        caps["resources"] = serde_json::json!({});
    }
    caps
}

/// Handle one JSON-RPC message from the local peer. Auth and sessions do not
/// apply on this transport: the invocation context carries no request, which
/// the auth and scope middlewares detect and skip.
pub(crate) async fn dispatch_message(
    core: &ServerCore,
    msg: JsonRpcMessage,
) -> Option<JsonRpcResponse> {
    let req = match msg {
        JsonRpcMessage::Request(req) => req,
        JsonRpcMessage::Notification(_) | JsonRpcMessage::Response(_) => return None,
    };

    Some(dispatch_request(core, req).await)
}

async fn dispatch_request(core: &ServerCore, req: JsonRpcRequest) -> JsonRpcResponse {
    match req.method.as_str() {
        "initialize" => {
            let params: Option<InitializeParams> =
                req.params.and_then(|v| serde_json::from_value(v).ok());
            let negotiated = match params.as_ref().map(|p| p.protocol_version.as_str()) {
                Some(v)
                    if v == PROTOCOL_VERSION_LATEST
                        || v == toolgate_mcp::PROTOCOL_VERSION_2025_06_18 =>
                {
                    v.to_string()
                }
                _ => PROTOCOL_VERSION_LATEST.to_string(),
            };
            let result = InitializeResult {
                protocol_version: negotiated,
                capabilities: capabilities(core),
                server_info: McpServerInfo {
                    name: core.cfg.name.clone(),
                    version: core.cfg.version.clone(),
                },
                instructions: core.cfg.instructions.clone(),
            };
            JsonRpcResponse::ok(
                req.id,
                serde_json::to_value(result).unwrap_or(Value::Null),
            )
        }
        "ping" => JsonRpcResponse::ok(req.id, serde_json::json!({})),
        "tools/list" => {
            let result = ListToolsResult {
                tools: core.registry.list(),
                next_cursor: None,
            };
            JsonRpcResponse::ok(
                req.id,
                serde_json::to_value(result).unwrap_or(Value::Null),
            )
        }
        "tools/call" => {
            let Some(params) = req.params else {
                return err_response(req.id, error_codes::INVALID_PARAMS, "missing params");
            };
            let params: CallToolParams = match serde_json::from_value(params) {
                Ok(p) => p,
                Err(e) => {
                    return err_response(req.id, error_codes::INVALID_PARAMS, e.to_string());
                }
            };

            core.metrics.incr_tool_calls();
            core.otel.record_tool_call(&params.name);

            let mut ctx = InvocationContext::new(
                params.name,
                params.arguments.unwrap_or_else(|| serde_json::json!({})),
            );
            match core.pipeline.run(&mut ctx).await {
                Ok(output) => JsonRpcResponse::ok(
                    req.id,
                    serde_json::to_value(output.into_call_result()).unwrap_or(Value::Null),
                ),
                Err(err) => {
                    core.metrics.incr_tool_errors();
                    stdio_error(req.id, err)
                }
            }
        }
        "resources/list" => {
            let result = ListResourcesResult {
                resources: core.resources.list(),
            };
            JsonRpcResponse::ok(
                req.id,
                serde_json::to_value(result).unwrap_or(Value::Null),
            )
        }
        "resources/read" => {
            let params: Option<ReadResourceParams> =
                req.params.and_then(|v| serde_json::from_value(v).ok());
            let Some(params) = params else {
                return err_response(req.id, error_codes::INVALID_PARAMS, "missing params");
            };
            let Some(resource) = core.resources.get(&params.uri) else {
                return err_response(
                    req.id,
                    error_codes::INVALID_PARAMS,
                    format!("Resource not found: {}", params.uri),
                );
            };
            let parsed = match url::Url::parse(&resource.uri) {
                Ok(u) => u,
                Err(e) => {
                    return err_response(
                        req.id,
                        error_codes::INVALID_PARAMS,
                        format!("Invalid resource uri: {e}"),
                    );
                }
            };
            match resource.handler.read(&parsed).await {
                Ok(contents) => {
                    let result = ReadResourceResult {
                        contents: vec![contents],
                    };
                    JsonRpcResponse::ok(
                        req.id,
                        serde_json::to_value(result).unwrap_or(Value::Null),
                    )
                }
                Err(e) => err_response(req.id, error_codes::INTERNAL_ERROR, e.to_string()),
            }
        }
        other => err_response(
            req.id,
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        ),
    }
}

/// Read line-delimited JSON-RPC from stdin, dispatch, and write responses to
/// stdout until EOF. The returned handle can push notifications concurrently.
pub(crate) async fn run(core: Arc<ServerCore>) -> anyhow::Result<()> {
    let (handle, done) = start(core);
    drop(handle);
    done.await?
}

pub(crate) fn start(
    core: Arc<ServerCore>,
) -> (StdioHandle, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let handle = StdioHandle { tx: tx.clone() };

    let task = tokio::spawn(async move {
        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(line) = rx.recv().await {
                if stdout.write_all(line.as_bytes()).await.is_err()
                    || stdout.write_all(b"\n").await.is_err()
                    || stdout.flush().await.is_err()
                {
                    error!("stdio writer failed");
                    break;
                }
            }
        });

        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let value: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(_) => {
                    send_response(
                        &tx,
                        err_response(JsonRpcId::Null, error_codes::PARSE_ERROR, "Parse error"),
                    );
                    continue;
                }
            };

            if value.is_array() {
                send_response(
                    &tx,
                    err_response(
                        JsonRpcId::Null,
                        error_codes::INVALID_REQUEST,
                        "batching not supported",
                    ),
                );
                continue;
            }

            let msg: JsonRpcMessage = match serde_json::from_value(value) {
                Ok(m) => m,
                Err(_) => {
                    send_response(
                        &tx,
                        err_response(
                            JsonRpcId::Null,
                            error_codes::INVALID_REQUEST,
                            "Invalid Request",
                        ),
                    );
                    continue;
                }
            };

            if let Some(resp) = dispatch_message(&core, msg).await {
                send_response(&tx, resp);
            }
        }

        drop(tx);
        let _ = writer.await;
        Ok(())
    });

    (handle, task)
}

fn send_response(tx: &mpsc::UnboundedSender<String>, resp: JsonRpcResponse) {
    if let Ok(line) = serde_json::to_string(&resp) {
        let _ = tx.send(line);
    }
}
