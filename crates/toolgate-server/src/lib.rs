//! The network-facing half of toolgate: an axum HTTP transport serving
//! JSON-RPC over POST and SSE over GET, a line-oriented stdio transport, and
//! the session/SSE/sampling state both share.
//!
//! Build a server with [`McpServer::builder`], register tools and resources,
//! then call `serve` (HTTP), `run_stdio`, or both.

mod config;
mod http;
mod ip;
mod sampling;
mod server;
mod session;
mod sse;
mod stdio;

pub use config::{CorsConfig, IpRateLimitConfig, IpRequestInfo, ServerConfig};
pub use ip::client_ip;
pub use sampling::PendingSamplings;
pub use server::{McpServer, McpServerBuilder};
pub use session::{Session, SessionExhaustion, SessionManager};
pub use sse::SseHub;
pub use stdio::StdioHandle;
