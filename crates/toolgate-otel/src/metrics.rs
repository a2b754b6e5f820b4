use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const DURATION_BUCKETS_MS: [u64; 11] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

/// A point-in-time gauge reading supplied by the server at render time
/// (session count, SSE client count, queue depth).
#[derive(Debug, Clone, Copy)]
pub struct GaugeSample {
    pub name: &'static str,
    pub help: &'static str,
    pub value: u64,
}

/// Monotonic request counters plus a fixed-bucket latency histogram.
///
/// All fields are atomics; increments happen on the request path without a
/// lock. `render_prometheus` produces text exposition format 0.0.4.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    requests_total: AtomicU64,
    tool_calls_total: AtomicU64,
    tool_errors_total: AtomicU64,
    auth_verify_total: AtomicU64,
    auth_reject_total: AtomicU64,
    auth_cache_hit_total: AtomicU64,
    rate_limited_total: AtomicU64,
    payloads_rejected_total: AtomicU64,
    sessions_expired_total: AtomicU64,
    duration_buckets: [AtomicU64; 11],
    duration_count: AtomicU64,
    duration_sum_micros: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_tool_calls(&self) {
        self.tool_calls_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_tool_errors(&self) {
        self.tool_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_auth_verify(&self) {
        self.auth_verify_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_auth_reject(&self) {
        self.auth_reject_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_auth_cache_hit(&self) {
        self.auth_cache_hit_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_payloads_rejected(&self) {
        self.payloads_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sessions_expired(&self, count: u64) {
        self.sessions_expired_total
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn sessions_expired(&self) -> u64 {
        self.sessions_expired_total.load(Ordering::Relaxed)
    }

    pub fn observe_call_duration(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        for (i, bound) in DURATION_BUCKETS_MS.iter().enumerate() {
            if ms <= *bound {
                self.duration_buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.duration_count.fetch_add(1, Ordering::Relaxed);
        self.duration_sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self, server_name: &str, gauges: &[GaugeSample]) -> String {
        let mut out = String::with_capacity(2048);

        let counters: [(&str, &str, u64); 9] = [
            (
                "toolgate_requests_total",
                "Total HTTP JSON-RPC requests received.",
                self.requests_total.load(Ordering::Relaxed),
            ),
            (
                "toolgate_tool_calls_total",
                "Total tools/call invocations.",
                self.tool_calls_total.load(Ordering::Relaxed),
            ),
            (
                "toolgate_tool_errors_total",
                "Total tools/call invocations that failed.",
                self.tool_errors_total.load(Ordering::Relaxed),
            ),
            (
                "toolgate_auth_verify_total",
                "Bearer tokens verified against the JWKS.",
                self.auth_verify_total.load(Ordering::Relaxed),
            ),
            (
                "toolgate_auth_reject_total",
                "Bearer tokens rejected.",
                self.auth_reject_total.load(Ordering::Relaxed),
            ),
            (
                "toolgate_auth_cache_hit_total",
                "Token verifications served from cache.",
                self.auth_cache_hit_total.load(Ordering::Relaxed),
            ),
            (
                "toolgate_rate_limited_total",
                "Requests refused by a rate limiter.",
                self.rate_limited_total.load(Ordering::Relaxed),
            ),
            (
                "toolgate_payloads_rejected_total",
                "Request bodies refused for exceeding the size limit.",
                self.payloads_rejected_total.load(Ordering::Relaxed),
            ),
            (
                "toolgate_sessions_expired_total",
                "Sessions removed by the TTL reaper.",
                self.sessions_expired_total.load(Ordering::Relaxed),
            ),
        ];

        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name}{{server=\"{server_name}\"}} {value}");
        }

        for g in gauges {
            let _ = writeln!(out, "# HELP {} {}", g.name, g.help);
            let _ = writeln!(out, "# TYPE {} gauge", g.name);
            let _ = writeln!(out, "{}{{server=\"{server_name}\"}} {}", g.name, g.value);
        }

        let hist = "toolgate_tool_call_duration_seconds";
        let _ = writeln!(out, "# HELP {hist} Tool call duration.");
        let _ = writeln!(out, "# TYPE {hist} histogram");
        for (i, bound_ms) in DURATION_BUCKETS_MS.iter().enumerate() {
            let le = *bound_ms as f64 / 1000.0;
            let _ = writeln!(
                out,
                "{hist}_bucket{{server=\"{server_name}\",le=\"{le}\"}} {}",
                self.duration_buckets[i].load(Ordering::Relaxed)
            );
        }
        let count = self.duration_count.load(Ordering::Relaxed);
        let _ = writeln!(
            out,
            "{hist}_bucket{{server=\"{server_name}\",le=\"+Inf\"}} {count}"
        );
        let _ = writeln!(
            out,
            "{hist}_sum{{server=\"{server_name}\"}} {}",
            self.duration_sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
        );
        let _ = writeln!(out, "{hist}_count{{server=\"{server_name}\"}} {count}");

        out
    }
}
