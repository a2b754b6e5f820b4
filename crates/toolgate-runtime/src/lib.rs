//! The control plane that wraps every tool invocation: bounded admission,
//! per-key rate limiting, JSON Schema validation, the tool/resource registry,
//! and the onion-composed middleware pipeline that strings them together in a
//! fixed order.

mod context;
mod error;
mod pipeline;
mod queue;
mod ratelimit;
mod registry;
mod schema;

pub use context::{HttpRequestInfo, InvocationContext};
pub use error::PipelineError;
pub use pipeline::{
    Middleware, Next, Pipeline, PipelineBuilder, RateLimitMode, RateLimitSettings,
};
pub use queue::{AdmissionStrategy, QueueOptions, RequestQueue, SlotGuard};
pub use ratelimit::{RateLimiter, RateLimiterOptions};
pub use registry::{
    RegisteredTool, RegistryError, ResourceHandler, ResourceRegistration, ResourceRegistry,
    ToolHandler, ToolOutput, ToolRegistration, ToolRegistry, tool_fn,
};
pub use schema::{SchemaValidator, ValidationIssue, ValidationOutcome};
