//! Model Context Protocol (MCP) wire primitives.
//!
//! This crate is intentionally scoped to the message-level parts shared by the
//! HTTP and stdio transports in `crates/toolgate-server`:
//! JSON-RPC 2.0 envelopes, the MCP request/result payloads for the tool and
//! resource surfaces, and SSE framing for server-initiated messages.

mod jsonrpc;
mod sse;
mod types;

pub use jsonrpc::{
    JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    error_codes,
};
pub use sse::{SseFrame, decode_sse_frames, encode_sse_frame, parse_first_json_frame};
pub use types::{
    CallToolParams, CallToolResult, ContentBlock, InitializeParams, InitializeResult,
    ListResourcesResult, ListToolsParams, ListToolsResult, McpClientInfo, McpServerInfo,
    ReadResourceParams, ReadResourceResult, ResourceContents, ResourceDescriptor, Tool,
};

/// Latest protocol version supported by this implementation.
pub const PROTOCOL_VERSION_LATEST: &str = "2025-11-25";

/// Older protocol version still commonly used by clients.
pub const PROTOCOL_VERSION_2025_06_18: &str = "2025-06-18";
