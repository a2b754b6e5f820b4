use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use clap::Parser;
use serde_json::{Value, json};
use tracing::info;

use toolgate_auth::{JwtAuthProvider, load_auth_settings};
use toolgate_otel::TracingInitOptions;
use toolgate_runtime::{
    AdmissionStrategy, QueueOptions, ToolOutput, ToolRegistration, tool_fn,
};
use toolgate_server::{IpRateLimitConfig, McpServer};

#[derive(Debug, Parser)]
#[command(name = "toolgated", version, about = "MCP tool server over stdio and HTTP")]
struct Args {
    /// Listen for MCP streamable HTTP on this address.
    #[arg(long, env = "TOOLGATE_HTTP_ADDR")]
    http_addr: Option<SocketAddr>,

    /// Disable the stdio transport (use HTTP only).
    #[arg(long, env = "TOOLGATE_NO_STDIO", default_value_t = false)]
    no_stdio: bool,

    /// YAML file with the `auth:` block; absence disables bearer auth unless
    /// MCP_AUTH_* variables are set.
    #[arg(long, env = "TOOLGATE_AUTH_CONFIG")]
    auth_config: Option<PathBuf>,

    /// Maximum concurrent tool calls admitted by backpressure.
    #[arg(long, env = "TOOLGATE_MAX_CONCURRENT", default_value_t = 16)]
    max_concurrent: usize,

    /// Admission strategy at capacity: reject, queue, or sleep.
    #[arg(long, env = "TOOLGATE_ADMISSION", default_value = "queue")]
    admission: String,

    /// Per-IP request budget per minute for the HTTP transport (0 disables).
    #[arg(long, env = "TOOLGATE_IP_RATE_LIMIT", default_value_t = 0)]
    ip_rate_limit: usize,
}

fn parse_admission(raw: &str) -> anyhow::Result<AdmissionStrategy> {
    match raw {
        "reject" => Ok(AdmissionStrategy::Reject),
        "queue" => Ok(AdmissionStrategy::Queue),
        "sleep" => Ok(AdmissionStrategy::Sleep),
        other => anyhow::bail!("invalid admission strategy: {other}"),
    }
}

fn echo_tool() -> ToolRegistration {
    ToolRegistration::new(
        "echo",
        "Echo the text argument back to the caller",
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

fn server_time_tool() -> ToolRegistration {
    ToolRegistration::new(
        "server_time",
        "Current server time as a unix timestamp",
        json!({"type": "object"}),
        tool_fn(|_| async move {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            Ok(ToolOutput::Value(json!({ "unix_seconds": now })))
        }),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    toolgate_otel::init_tracing(TracingInitOptions {
        service_name: "toolgated",
        service_version: env!("CARGO_PKG_VERSION"),
        default_env_filter: "info",
    })?;

    let args = Args::parse();
    let strategy = parse_admission(&args.admission)?;

    let mut builder = McpServer::builder("toolgated", env!("CARGO_PKG_VERSION"))
        .backpressure(QueueOptions {
            max_concurrent: args.max_concurrent,
            strategy,
            sleep_interval: Duration::from_millis(50),
        })
        .tool(echo_tool())?
        .tool(server_time_tool())?;

    if args.ip_rate_limit > 0 {
        builder = builder.ip_rate_limit(IpRateLimitConfig::reject(
            args.ip_rate_limit,
            Duration::from_secs(60),
        ));
    }

    if let Some(settings) = load_auth_settings(args.auth_config.as_deref())? {
        let sink = builder.auth_event_sink();
        let provider = JwtAuthProvider::new(settings.into_provider_options())
            .context("build jwt auth provider")?
            .with_event_sink(sink);
        builder = builder.auth_provider(Arc::new(provider));
        info!("bearer auth enabled");
    }

    let server = Arc::new(builder.build());

    let http_task = args.http_addr.map(|addr| {
        let server = server.clone();
        tokio::spawn(async move { server.serve(addr).await })
    });

    if args.no_stdio {
        tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    } else {
        server.run_stdio().await?;
    }

    server.shutdown();
    if let Some(task) = http_task {
        task.await.context("http task join")??;
    }

    Ok(())
}
