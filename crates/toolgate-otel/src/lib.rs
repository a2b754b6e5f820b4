//! Tracing initialization and metrics for toolgate servers.
//!
//! Spans and logs go through `tracing`; when an OTLP endpoint is configured
//! they are exported via OpenTelemetry. Request-level counters live in
//! [`ServerMetrics`], which doubles as the snapshot source for the
//! `/metrics` Prometheus text endpoint.

mod metrics;

pub use metrics::{GaugeSample, ServerMetrics};

use anyhow::Context as _;

#[derive(Debug, Clone)]
pub struct TracingInitOptions<'a> {
    pub service_name: &'a str,
    pub service_version: &'a str,
    pub default_env_filter: &'a str,
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// OTLP export destination, resolved once at startup. Export stays off
/// unless `OTEL_EXPORTER_OTLP_ENDPOINT` names a collector or
/// `TOOLGATE_OTEL` opts into the local default.
struct OtlpTarget {
    base: String,
}

impl OtlpTarget {
    fn from_env() -> Option<Self> {
        if let Some(base) = env_nonempty("OTEL_EXPORTER_OTLP_ENDPOINT") {
            return Some(Self { base });
        }
        let opted_in = env_nonempty("TOOLGATE_OTEL").is_some_and(|v| {
            matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
        });
        opted_in.then(|| Self {
            base: "http://127.0.0.1:4318".to_string(),
        })
    }

    /// Endpoint for one signal: the standard per-signal variable wins,
    /// otherwise the signal path is joined onto the base.
    fn endpoint(&self, override_var: &str, signal_path: &str) -> String {
        env_nonempty(override_var)
            .unwrap_or_else(|| format!("{}{signal_path}", self.base.trim_end_matches('/')))
    }
}

/// Install the global subscriber: JSON logs filtered by `RUST_LOG` (falling
/// back to the caller's default), plus OTLP span and metric export when a
/// collector is configured.
pub fn init_tracing(opts: TracingInitOptions<'_>) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| opts.default_env_filter.into());

    let Some(target) = OtlpTarget::from_env() else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
        return Ok(());
    };

    use opentelemetry::KeyValue;
    use opentelemetry_otlp::{Protocol, WithExportConfig as _};
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let resource = opentelemetry_sdk::Resource::builder()
        .with_service_name(opts.service_name.to_string())
        .with_attributes([KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            opts.service_version.to_string(),
        )])
        .build();

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(target.endpoint("OTEL_EXPORTER_OTLP_TRACES_ENDPOINT", "/v1/traces"))
        .with_protocol(Protocol::HttpBinary)
        .build()
        .context("build otlp span exporter")?;
    let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(span_exporter)
        .with_resource(resource.clone())
        .build();
    use opentelemetry::trace::TracerProvider as _;
    let tracer = tracer_provider.tracer(opts.service_name.to_string());
    opentelemetry::global::set_tracer_provider(tracer_provider);

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_endpoint(target.endpoint("OTEL_EXPORTER_OTLP_METRICS_ENDPOINT", "/v1/metrics"))
        .with_protocol(Protocol::HttpBinary)
        .build()
        .context("build otlp metric exporter")?;
    let meter_provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .with_resource(resource)
        .build();
    opentelemetry::global::set_meter_provider(meter_provider);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .init();
    Ok(())
}

/// Per-server OTEL counters for auth and session events.
///
/// Built per instance rather than behind a process-wide `OnceLock` so
/// concurrent servers in one process do not share a bridge.
#[derive(Debug, Clone)]
pub struct OtelBridge {
    auth_verify_total: opentelemetry::metrics::Counter<u64>,
    auth_reject_total: opentelemetry::metrics::Counter<u64>,
    auth_cache_hit_total: opentelemetry::metrics::Counter<u64>,
    sessions_expired_total: opentelemetry::metrics::Counter<u64>,
    tool_calls_total: opentelemetry::metrics::Counter<u64>,
}

impl OtelBridge {
    pub fn new(service_name: &str) -> Self {
        let scope = opentelemetry::InstrumentationScope::builder(service_name.to_string()).build();
        let meter = opentelemetry::global::meter_with_scope(scope);

        let auth_verify_total = meter
            .u64_counter("toolgate_auth_verify_total")
            .with_description("Count of bearer tokens verified against the JWKS.")
            .build();

        let auth_reject_total = meter
            .u64_counter("toolgate_auth_reject_total")
            .with_description("Count of bearer tokens rejected.")
            .build();

        let auth_cache_hit_total = meter
            .u64_counter("toolgate_auth_cache_hit_total")
            .with_description("Count of token verifications served from cache.")
            .build();

        let sessions_expired_total = meter
            .u64_counter("toolgate_sessions_expired_total")
            .with_description("Count of sessions removed by the TTL reaper.")
            .build();

        let tool_calls_total = meter
            .u64_counter("toolgate_tool_calls_total")
            .with_description("Count of tools/call invocations.")
            .build();

        Self {
            auth_verify_total,
            auth_reject_total,
            auth_cache_hit_total,
            sessions_expired_total,
            tool_calls_total,
        }
    }

    pub fn record_auth_verify(&self) {
        self.auth_verify_total.add(1, &[]);
    }

    pub fn record_auth_reject(&self) {
        self.auth_reject_total.add(1, &[]);
    }

    pub fn record_auth_cache_hit(&self) {
        self.auth_cache_hit_total.add(1, &[]);
    }

    pub fn record_sessions_expired(&self, count: u64) {
        self.sessions_expired_total.add(count, &[]);
    }

    pub fn record_tool_call(&self, tool: &str) {
        self.tool_calls_total.add(
            1,
            &[opentelemetry::KeyValue::new("tool", tool.to_string())],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_endpoint_joins_path_onto_base() {
        let target = OtlpTarget {
            base: "http://collector:4318/".to_string(),
        };
        assert_eq!(
            target.endpoint("TOOLGATE_TEST_UNSET_OVERRIDE", "/v1/traces"),
            "http://collector:4318/v1/traces"
        );
    }
}
