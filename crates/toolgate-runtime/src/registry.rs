use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use url::Url;

use toolgate_mcp::{CallToolResult, ResourceContents, ResourceDescriptor, Tool};

use crate::context::InvocationContext;

/// What a tool handler hands back: either a free-form value the transport
/// wraps into a text block, or a fully formed MCP result that passes through
/// unchanged. An explicit sum type, so no structural sniffing is needed.
#[derive(Debug, Clone)]
pub enum ToolOutput {
    Value(Value),
    Result(CallToolResult),
}

impl ToolOutput {
    pub fn into_call_result(self) -> CallToolResult {
        match self {
            ToolOutput::Value(v) => CallToolResult::from_value(v),
            ToolOutput::Result(r) => r,
        }
    }
}

impl From<Value> for ToolOutput {
    fn from(v: Value) -> Self {
        ToolOutput::Value(v)
    }
}

impl From<CallToolResult> for ToolOutput {
    fn from(r: CallToolResult) -> Self {
        ToolOutput::Result(r)
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value, ctx: &InvocationContext) -> anyhow::Result<ToolOutput>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<ToolOutput>> + Send,
{
    async fn call(&self, args: Value, _ctx: &InvocationContext) -> anyhow::Result<ToolOutput> {
        (self.0)(args).await
    }
}

/// Wrap an async closure over the arguments as a [`ToolHandler`].
pub fn tool_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ToolOutput>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Tool already registered: {0}")]
    DuplicateTool(String),

    #[error("Resource already registered: {0}")]
    DuplicateResource(String),

    #[error("Duplicate resource uri in batch: {0}")]
    DuplicateInBatch(String),

    #[error("Invalid resource uri {uri}: {reason}")]
    InvalidResourceUri { uri: String, reason: String },
}

#[derive(Clone)]
pub struct ToolRegistration {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub required_scopes: Vec<String>,
    pub metadata: serde_json::Map<String, Value>,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolRegistration {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            required_scopes: Vec::new(),
            metadata: serde_json::Map::new(),
            handler,
        }
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

pub struct RegisteredTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub required_scopes: Vec<String>,
    pub metadata: serde_json::Map<String, Value>,
    pub handler: Arc<dyn ToolHandler>,
}

/// Tools keyed by name. Plain `register` is the pre-start path and fails on
/// duplicates; `live_register`/`unregister` mutate the same map atomically so
/// a concurrent `tools/list` always sees a consistent snapshot.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<RegisteredTool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, reg: ToolRegistration) -> Result<(), RegistryError> {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        if tools.contains_key(&reg.name) {
            return Err(RegistryError::DuplicateTool(reg.name));
        }
        tools.insert(reg.name.clone(), Arc::new(into_registered(reg)));
        Ok(())
    }

    /// Insert-or-replace for use after the server has started.
    pub fn live_register(&self, reg: ToolRegistration) {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        tools.insert(reg.name.clone(), Arc::new(into_registered(reg)));
    }

    /// Remove a tool. In-flight calls keep the handler they resolved.
    pub fn unregister(&self, name: &str) -> bool {
        self.tools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredTool>> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn list(&self) -> Vec<Tool> {
        let mut tools = self
            .tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|t| Tool {
                name: t.name.clone(),
                description: Some(t.description.clone()),
                input_schema: t.input_schema.clone(),
            })
            .collect::<Vec<_>>();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Per-tool required scopes, computed when the pipeline is built.
    pub fn required_scopes_map(&self) -> HashMap<String, Vec<String>> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|t| !t.required_scopes.is_empty())
            .map(|t| (t.name.clone(), t.required_scopes.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn into_registered(reg: ToolRegistration) -> RegisteredTool {
    RegisteredTool {
        name: reg.name,
        description: reg.description,
        input_schema: reg.input_schema,
        required_scopes: reg.required_scopes,
        metadata: reg.metadata,
        handler: reg.handler,
    }
}

#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn read(&self, uri: &Url) -> anyhow::Result<ResourceContents>;
}

#[derive(Clone)]
pub struct ResourceRegistration {
    pub uri: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    pub handler: Arc<dyn ResourceHandler>,
}

/// Resources keyed by URI with all-or-nothing batch registration.
pub struct ResourceRegistry {
    resources: RwLock<HashMap<String, Arc<ResourceRegistration>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            resources: RwLock::new(HashMap::new()),
        }
    }

    /// Register a batch atomically: every URI is validated against the batch
    /// and the existing map before anything is inserted, so a failure leaves
    /// the registry untouched.
    pub fn register_batch(&self, batch: Vec<ResourceRegistration>) -> Result<(), RegistryError> {
        let mut resources = self.resources.write().unwrap_or_else(|e| e.into_inner());

        let mut seen = HashSet::new();
        for reg in &batch {
            let parsed =
                Url::parse(&reg.uri).map_err(|e| RegistryError::InvalidResourceUri {
                    uri: reg.uri.clone(),
                    reason: e.to_string(),
                })?;
            if !seen.insert(reg.uri.clone()) {
                return Err(RegistryError::DuplicateInBatch(reg.uri.clone()));
            }
            if resources.contains_key(&reg.uri) {
                return Err(RegistryError::DuplicateResource(reg.uri.clone()));
            }
            if parsed.scheme() != "ui" {
                warn!(uri = %reg.uri, scheme = parsed.scheme(), "resource uri does not use the ui: scheme");
            }
        }

        for reg in batch {
            resources.insert(reg.uri.clone(), Arc::new(reg));
        }
        Ok(())
    }

    pub fn get(&self, uri: &str) -> Option<Arc<ResourceRegistration>> {
        self.resources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(uri)
            .cloned()
    }

    pub fn list(&self) -> Vec<ResourceDescriptor> {
        let mut out = self
            .resources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|r| ResourceDescriptor {
                uri: r.uri.clone(),
                name: r.name.clone(),
                description: r.description.clone(),
                mime_type: r.mime_type.clone(),
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.uri.cmp(&b.uri));
        out
    }

    pub fn len(&self) -> usize {
        self.resources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_handler() -> Arc<dyn ToolHandler> {
        tool_fn(|args| async move { Ok(ToolOutput::Value(args)) })
    }

    struct StaticResource;

    #[async_trait]
    impl ResourceHandler for StaticResource {
        async fn read(&self, uri: &Url) -> anyhow::Result<ResourceContents> {
            Ok(ResourceContents {
                uri: uri.to_string(),
                mime_type: Some("text/plain".to_string()),
                text: "hello".to_string(),
            })
        }
    }

    fn resource(uri: &str) -> ResourceRegistration {
        ResourceRegistration {
            uri: uri.to_string(),
            name: uri.to_string(),
            description: None,
            mime_type: Some("text/plain".to_string()),
            handler: Arc::new(StaticResource),
        }
    }

    #[test]
    fn duplicate_tool_registration_fails() {
        let reg = ToolRegistry::new();
        let t = ToolRegistration::new("echo", "Echo", serde_json::json!({}), echo_handler());
        reg.register(t.clone()).expect("first");
        let err = reg.register(t).expect_err("duplicate");
        assert!(matches!(err, RegistryError::DuplicateTool(name) if name == "echo"));
    }

    #[test]
    fn live_register_replaces_and_list_stays_sorted() {
        let reg = ToolRegistry::new();
        for name in ["zeta", "alpha"] {
            reg.register(ToolRegistration::new(
                name,
                "d",
                serde_json::json!({}),
                echo_handler(),
            ))
            .expect("register");
        }
        reg.live_register(ToolRegistration::new(
            "zeta",
            "replaced",
            serde_json::json!({}),
            echo_handler(),
        ));
        let listed = reg.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "alpha");
        assert_eq!(listed[1].description.as_deref(), Some("replaced"));
        assert!(reg.unregister("zeta"));
        assert!(!reg.unregister("zeta"));
    }

    #[test]
    fn scope_map_only_includes_scoped_tools() {
        let reg = ToolRegistry::new();
        reg.register(ToolRegistration::new(
            "open",
            "d",
            serde_json::json!({}),
            echo_handler(),
        ))
        .expect("register");
        reg.register(
            ToolRegistration::new("admin_action", "d", serde_json::json!({}), echo_handler())
                .with_scopes(["admin"]),
        )
        .expect("register");

        let map = reg.required_scopes_map();
        assert_eq!(map.len(), 1);
        assert_eq!(map["admin_action"], vec!["admin"]);
    }

    #[test]
    fn resource_batch_is_atomic_on_duplicate() {
        let reg = ResourceRegistry::new();
        reg.register_batch(vec![resource("ui://widget/one")])
            .expect("seed");

        let before = reg.len();
        let err = reg
            .register_batch(vec![resource("ui://widget/two"), resource("ui://widget/one")])
            .expect_err("existing uri in batch");
        assert!(matches!(err, RegistryError::DuplicateResource(_)));
        assert_eq!(reg.len(), before);
        assert!(reg.get("ui://widget/two").is_none());
    }

    #[test]
    fn resource_batch_rejects_in_batch_duplicates_and_bad_uris() {
        let reg = ResourceRegistry::new();
        let err = reg
            .register_batch(vec![resource("ui://a"), resource("ui://a")])
            .expect_err("dup in batch");
        assert!(matches!(err, RegistryError::DuplicateInBatch(_)));
        assert_eq!(reg.len(), 0);

        let err = reg
            .register_batch(vec![resource("not a uri")])
            .expect_err("invalid uri");
        assert!(matches!(err, RegistryError::InvalidResourceUri { .. }));
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn non_ui_scheme_is_allowed_with_warning() {
        let reg = ResourceRegistry::new();
        reg.register_batch(vec![resource("https://example.com/doc")])
            .expect("registered despite scheme warning");
        assert_eq!(reg.len(), 1);
    }
}
