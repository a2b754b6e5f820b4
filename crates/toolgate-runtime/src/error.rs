use thiserror::Error;
use toolgate_auth::AuthError;

/// Failure raised anywhere in the middleware chain or the handler.
///
/// The HTTP transport translates each variant to a status code and JSON-RPC
/// error; the stdio transport translates to JSON-RPC only. This is the typed
/// form of the translation table in the error-handling design.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Capacity exceeded: at most {limit} concurrent requests")]
    CapacityExceeded { limit: usize },

    #[error("Rate limit exceeded. Retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("pipeline misconfigured: {0}")]
    Misconfigured(String),

    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}
