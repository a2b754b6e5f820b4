use std::collections::HashMap;
use std::sync::Arc;

use http::HeaderMap;
use serde_json::Value;
use uuid::Uuid;

use toolgate_auth::AuthInfo;

use crate::error::PipelineError;

/// The HTTP-facing slice of a request, carried only when the invocation came
/// over the network transport. Its absence is how the auth middleware detects
/// the stdio path.
#[derive(Debug, Clone)]
pub struct HttpRequestInfo {
    pub headers: HeaderMap,
    pub client_ip: String,
    pub method: String,
    pub path: String,
}

/// Per-request value threaded through the middleware pipeline.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub request_id: Uuid,
    pub tool_name: String,
    pub args: Value,
    pub request: Option<HttpRequestInfo>,
    pub session_id: Option<String>,
    auth_info: Option<Arc<AuthInfo>>,
    pub resource_metadata_url: Option<String>,
    /// Open extension area for user middlewares.
    pub extensions: HashMap<String, Value>,
}

impl InvocationContext {
    pub fn new(tool_name: impl Into<String>, args: Value) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            tool_name: tool_name.into(),
            args,
            request: None,
            session_id: None,
            auth_info: None,
            resource_metadata_url: None,
            extensions: HashMap::new(),
        }
    }

    pub fn with_request(mut self, request: HttpRequestInfo) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn auth_info(&self) -> Option<&Arc<AuthInfo>> {
        self.auth_info.as_ref()
    }

    /// Attach the verified identity. Write-once: the auth middleware is the
    /// only writer, and anything downstream sees an immutable `Arc`.
    pub fn set_auth_info(&mut self, info: Arc<AuthInfo>) -> Result<(), PipelineError> {
        if self.auth_info.is_some() {
            return Err(PipelineError::Misconfigured(
                "auth info is already set for this invocation".to_string(),
            ));
        }
        self.auth_info = Some(info);
        Ok(())
    }
}
