//! Tool abstraction.
//!
//! A [`Tool`] is a typed capability the model can invoke through a function
//! call. The flow locates tools by exact name on the running agent, executes
//! them through [`Tool::execute`], and folds their side effects (state
//! writes, artifact saves, transfer, escalation, credential requests) into
//! the function-response event via [`ToolContext`].
//!
//! # Adaptors
//!
//! - [`FunctionTool`]: registers a plain Rust closure (sync or async).
//! - [`crate::agentflow::tools::AgentTool`]: wraps a sub-agent as a tool.
//! - Built-ins in [`crate::agentflow::tools`] publish intent only: their
//!   execution happens inside the model or inside the flow.
//!
//! # Example
//!
//! ```rust
//! use agentflow::tool::{FunctionTool, Tool};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let add = FunctionTool::new(
//!     "add",
//!     "Adds two integers",
//!     Arc::new(|args| {
//!         let a = args["a"].as_i64().unwrap_or(0);
//!         let b = args["b"].as_i64().unwrap_or(0);
//!         Ok(json!({ "result": a + b }))
//!     }),
//! );
//! assert_eq!(add.name(), "add");
//! ```

use crate::agentflow::artifact::ArtifactKey;
use crate::agentflow::auth::AuthConfig;
use crate::agentflow::content::Part;
use crate::agentflow::error::{AgentError, Result};
use crate::agentflow::event::EventActions;
use crate::agentflow::invocation::InvocationContext;
use crate::agentflow::model::{FunctionDeclaration, LlmRequest};
use async_trait::async_trait;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;

/// Per-execution context handed to a tool.
///
/// Writes through this context are recorded in [`ToolContext::actions`] and
/// merged into the aggregated function-response event, so callers observe
/// every side effect a tool performed.
pub struct ToolContext {
    invocation: Arc<InvocationContext>,
    /// Id of the function call being executed.
    pub function_call_id: String,
    /// Actions accumulated by this execution.
    pub actions: EventActions,
}

impl ToolContext {
    pub fn new(invocation: Arc<InvocationContext>, function_call_id: String) -> Self {
        Self {
            invocation,
            function_call_id,
            actions: EventActions::default(),
        }
    }

    pub fn invocation(&self) -> &Arc<InvocationContext> {
        &self.invocation
    }

    /// Read a session-state value.
    pub async fn state_get(&self, key: &str) -> Option<Value> {
        self.invocation.state_get(key).await
    }

    /// Write a session-state value; recorded as a state delta.
    pub async fn state_set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.invocation.state_set(key.clone(), value.clone()).await;
        self.actions.state_delta.insert(key, value);
    }

    /// Save an artifact under the invocation's session; recorded as an
    /// artifact delta. Fails with `Unavailable` when no artifact service is
    /// attached.
    pub async fn save_artifact(&mut self, filename: &str, part: Part) -> Result<u64> {
        let service = self
            .invocation
            .artifacts()
            .ok_or_else(|| AgentError::Unavailable("no artifact service attached".to_string()))?;
        let key = self.artifact_key(filename);
        let version = service.save_artifact(&key, part).await?;
        self.actions
            .artifact_delta
            .insert(filename.to_string(), version);
        Ok(version)
    }

    /// Load an artifact version (latest when `version` is `None`).
    pub async fn load_artifact(&self, filename: &str, version: Option<u64>) -> Result<Option<Part>> {
        let service = self
            .invocation
            .artifacts()
            .ok_or_else(|| AgentError::Unavailable("no artifact service attached".to_string()))?;
        let key = self.artifact_key(filename);
        service.load_artifact(&key, version).await
    }

    /// Sorted artifact filenames visible to this session.
    pub async fn list_artifacts(&self) -> Result<Vec<String>> {
        let service = self
            .invocation
            .artifacts()
            .ok_or_else(|| AgentError::Unavailable("no artifact service attached".to_string()))?;
        let session = self.invocation.session();
        service
            .list_artifact_keys(&session.app, &session.user, &session.session)
            .await
    }

    /// Ask the caller for end-user credentials. The flow relays the request
    /// as a long-running `request_euc` function call.
    pub fn request_credential(&mut self, config: AuthConfig) {
        self.actions
            .requested_auth_configs
            .insert(self.function_call_id.clone(), config);
    }

    /// Look up a previously supplied credential for the given config.
    pub async fn get_credential(&self, config: &AuthConfig) -> Option<AuthConfig> {
        let value = self.invocation.state_get(&config.credential_key()).await?;
        serde_json::from_value(value).ok()
    }

    fn artifact_key(&self, filename: &str) -> ArtifactKey {
        let session = self.invocation.session();
        ArtifactKey {
            app: session.app.clone(),
            user: session.user.clone(),
            session: session.session.clone(),
            filename: filename.to_string(),
        }
    }
}

/// A typed capability invokable by the model.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Exact name the model must use in its function calls.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the accepted arguments, if declared.
    fn parameters_schema(&self) -> Option<Value> {
        None
    }

    /// JSON Schema for the result, if declared.
    fn response_schema(&self) -> Option<Value> {
        None
    }

    /// Long-running tools are not auto-executed: the flow records their call
    /// ids on the event and suspends until the host injects a response.
    fn is_long_running(&self) -> bool {
        false
    }

    /// Advertise this tool on an outgoing model request. The default adds a
    /// function declaration; built-ins override to publish model-side intent.
    async fn process_llm_request(&self, request: &mut LlmRequest) -> Result<()> {
        request.add_function_declaration(FunctionDeclaration {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        });
        Ok(())
    }

    /// Execute with the model-supplied JSON arguments, returning the JSON
    /// result. Failures are recovered by the flow into error responses.
    async fn execute(&self, ctx: &mut ToolContext, args: Value) -> Result<Value>;
}

/// Synchronous tool handler.
pub type ToolHandler = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// Asynchronous tool handler.
pub type AsyncToolHandler = Arc<
    dyn Fn(Value) -> Pin<Box<dyn std::future::Future<Output = Result<Value>> + Send>>
        + Send
        + Sync,
>;

enum Handler {
    Sync(ToolHandler),
    Async(AsyncToolHandler),
}

/// A tool backed by a plain Rust function.
pub struct FunctionTool {
    name: String,
    description: String,
    parameters: Option<Value>,
    handler: Handler,
    long_running: bool,
}

impl FunctionTool {
    /// Wrap a synchronous closure.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: ToolHandler,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: None,
            handler: Handler::Sync(handler),
            long_running: false,
        }
    }

    /// Wrap an asynchronous closure.
    pub fn new_async(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: AsyncToolHandler,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: None,
            handler: Handler::Async(handler),
            long_running: false,
        }
    }

    /// Declare the accepted-arguments schema.
    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = Some(schema);
        self
    }

    /// Mark the tool long-running; the flow will suspend instead of
    /// executing it.
    pub fn long_running(mut self) -> Self {
        self.long_running = true;
        self
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Option<Value> {
        self.parameters.clone()
    }

    fn is_long_running(&self) -> bool {
        self.long_running
    }

    async fn execute(&self, _ctx: &mut ToolContext, args: Value) -> Result<Value> {
        match &self.handler {
            Handler::Sync(f) => f(args),
            Handler::Async(f) => f(args).await,
        }
    }
}
