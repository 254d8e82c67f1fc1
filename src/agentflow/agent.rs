//! Agent tree and the single-model agent.
//!
//! Agents form a named forest: every node has at most one parent, names are
//! unique across a tree, and lookup is by name from any node. The leaf
//! workhorse is [`LlmAgent`], which delegates its turn to the
//! [`LlmFlow`](crate::agentflow::flow::LlmFlow); composite agents live in
//! [`crate::agentflow::workflow`].
//!
//! # Example
//!
//! ```rust,ignore
//! let billing = LlmAgent::builder("billing")
//!     .description("Answers billing questions")
//!     .model("gemini-2.0-flash")
//!     .build()?;
//!
//! let root = LlmAgent::builder("support")
//!     .instruction("Route the user to the right specialist.")
//!     .model("gemini-2.0-flash")
//!     .sub_agent(billing)
//!     .build()?;
//! ```

use crate::agentflow::content::Content;
use crate::agentflow::error::{AgentError, Result};
use crate::agentflow::event::Event;
use crate::agentflow::flow::LlmFlow;
use crate::agentflow::invocation::InvocationContext;
use crate::agentflow::model::{resolve_llm, Llm, LlmRequest, LlmResponse};
use crate::agentflow::planner::Planner;
use crate::agentflow::telemetry::default_tracer;
use crate::agentflow::tool::Tool;
use crate::agentflow::tools::TransferToAgentTool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::sync::Weak;
use tokio::sync::mpsc;

/// Reserved author name for caller-injected events.
pub const USER_AUTHOR: &str = "user";

/// Read side of one invocation's event channel.
pub type EventStream = mpsc::Receiver<Event>;

/// A node in the agent tree.
///
/// `run` starts the producer task and returns the read side of the event
/// channel; the stream closes exactly once when the producer exits.
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Model identifier, for agents that own one. Used by the runner's
    /// session log.
    fn model_name(&self) -> Option<&str> {
        None
    }

    fn sub_agents(&self) -> Vec<Arc<dyn Agent>> {
        Vec::new()
    }

    fn parent(&self) -> Option<Arc<dyn Agent>>;

    /// Record `parent` as this agent's parent. Fails with
    /// `HierarchyConflict` when a different parent is already set.
    fn attach_parent(&self, parent: Arc<dyn Agent>) -> Result<()>;

    /// Process the invocation, emitting events on the returned stream.
    fn run(self: Arc<Self>, ctx: Arc<InvocationContext>) -> EventStream;
}

/// Parent pointer shared by every agent implementation. Weak, so trees of
/// `Arc` nodes never cycle.
pub struct ParentLink {
    inner: StdRwLock<Option<Weak<dyn Agent>>>,
}

impl ParentLink {
    pub fn new() -> Self {
        Self {
            inner: StdRwLock::new(None),
        }
    }

    pub fn get(&self) -> Option<Arc<dyn Agent>> {
        self.inner
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().and_then(|weak| weak.upgrade()))
    }

    /// Set the parent, rejecting reassignment to a different node.
    pub fn attach(&self, child_name: &str, parent: Arc<dyn Agent>) -> Result<()> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| AgentError::Internal("parent link lock poisoned".to_string()))?;
        if let Some(existing) = guard.as_ref().and_then(|weak| weak.upgrade()) {
            if Arc::ptr_eq(&existing, &parent) {
                return Ok(());
            }
            return Err(AgentError::HierarchyConflict(format!(
                "agent '{}' already has parent '{}'",
                child_name,
                existing.name()
            )));
        }
        *guard = Some(Arc::downgrade(&parent));
        Ok(())
    }
}

impl Default for ParentLink {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk parent pointers to the root of the tree.
pub fn root_agent(agent: &Arc<dyn Agent>) -> Arc<dyn Agent> {
    let mut current = agent.clone();
    while let Some(parent) = current.parent() {
        current = parent;
    }
    current
}

/// Depth-first search from `from` (inclusive) for the named agent.
pub fn find_agent(from: &Arc<dyn Agent>, name: &str) -> Option<Arc<dyn Agent>> {
    if from.name() == name {
        return Some(from.clone());
    }
    find_sub_agent(from, name)
}

/// Depth-first search below `from` (exclusive) for the named agent.
pub fn find_sub_agent(from: &Arc<dyn Agent>, name: &str) -> Option<Arc<dyn Agent>> {
    for sub in from.sub_agents() {
        if let Some(found) = find_agent(&sub, name) {
            return Some(found);
        }
    }
    None
}

/// Identifier check. Violations warn and proceed; the name is kept verbatim.
pub(crate) fn validate_agent_name(name: &str) {
    let valid_identifier = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(true);
    if !valid_identifier {
        log::warn!("agent name '{}' is not a valid identifier", name);
    }
    if name == USER_AUTHOR {
        log::warn!("agent name 'user' is reserved for caller-injected events");
    }
}

/// Attach `subs` to `parent` and verify name uniqueness across the subtree.
pub(crate) fn adopt_sub_agents(parent: &Arc<dyn Agent>, subs: &[Arc<dyn Agent>]) -> Result<()> {
    for sub in subs {
        sub.attach_parent(parent.clone())?;
    }
    let mut seen = HashSet::new();
    ensure_unique_names(parent, &mut seen)
}

fn ensure_unique_names(agent: &Arc<dyn Agent>, seen: &mut HashSet<String>) -> Result<()> {
    if !seen.insert(agent.name().to_string()) {
        return Err(AgentError::HierarchyConflict(format!(
            "duplicate agent name '{}' in tree",
            agent.name()
        )));
    }
    for sub in agent.sub_agents() {
        ensure_unique_names(&sub, seen)?;
    }
    Ok(())
}

/// Read-only view handed to agent and model callbacks.
pub struct CallbackContext {
    pub invocation_id: String,
    pub agent_name: String,
}

impl CallbackContext {
    pub(crate) fn new(ctx: &InvocationContext, agent_name: &str) -> Self {
        Self {
            invocation_id: ctx.invocation_id().to_string(),
            agent_name: agent_name.to_string(),
        }
    }
}

/// Short-circuit hook before a turn; `Some` skips the model entirely.
pub type BeforeAgentCallback = Arc<dyn Fn(&CallbackContext) -> Option<Content> + Send + Sync>;
/// Post-transform hook on the final response; `None` keeps it unchanged.
pub type AfterAgentCallback =
    Arc<dyn Fn(&CallbackContext, &Content) -> Option<Content> + Send + Sync>;
/// Short-circuit hook before a model call; `Some` is used as the response
/// without counting against the budget.
pub type BeforeModelCallback =
    Arc<dyn Fn(&CallbackContext, &LlmRequest) -> Option<LlmResponse> + Send + Sync>;
/// Response rewrite hook; `None` keeps the response unchanged.
pub type AfterModelCallback =
    Arc<dyn Fn(&CallbackContext, &LlmResponse) -> Option<LlmResponse> + Send + Sync>;

enum ModelRef {
    Named(String),
    Handle(Arc<dyn Llm>),
}

/// A single-model agent: instruction, tools, optional planner, optional
/// sub-agents reachable via transfer.
pub struct LlmAgent {
    name: String,
    description: String,
    instruction: Option<String>,
    model: ModelRef,
    tools: Vec<Arc<dyn Tool>>,
    tools_by_name: HashMap<String, Arc<dyn Tool>>,
    sub_agents: Vec<Arc<dyn Agent>>,
    planner: Option<Arc<dyn Planner>>,
    flow: Arc<LlmFlow>,
    pub(crate) before_agent_callback: Option<BeforeAgentCallback>,
    pub(crate) after_agent_callback: Option<AfterAgentCallback>,
    pub(crate) before_model_callback: Option<BeforeModelCallback>,
    pub(crate) after_model_callback: Option<AfterModelCallback>,
    parent: ParentLink,
}

impl LlmAgent {
    pub fn builder(name: impl Into<String>) -> LlmAgentBuilder {
        LlmAgentBuilder::new(name)
    }

    pub fn instruction(&self) -> Option<&str> {
        self.instruction.as_deref()
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    /// Exact-name tool lookup, as used by function-call dispatch.
    pub fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools_by_name.get(name).cloned()
    }

    pub fn planner(&self) -> Option<&Arc<dyn Planner>> {
        self.planner.as_ref()
    }

    /// Identifier placed on outgoing requests.
    pub fn model_identifier(&self) -> &str {
        match &self.model {
            ModelRef::Named(name) => name,
            ModelRef::Handle(llm) => llm.model_name(),
        }
    }

    /// The backend serving this agent, resolving through the registry for
    /// named models.
    pub fn resolve_model(&self) -> Result<Arc<dyn Llm>> {
        match &self.model {
            ModelRef::Handle(llm) => Ok(llm.clone()),
            ModelRef::Named(name) => resolve_llm(name),
        }
    }
}

impl Agent for LlmAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn model_name(&self) -> Option<&str> {
        Some(self.model_identifier())
    }

    fn sub_agents(&self) -> Vec<Arc<dyn Agent>> {
        self.sub_agents.clone()
    }

    fn parent(&self) -> Option<Arc<dyn Agent>> {
        self.parent.get()
    }

    fn attach_parent(&self, parent: Arc<dyn Agent>) -> Result<()> {
        self.parent.attach(&self.name, parent)
    }

    fn run(self: Arc<Self>, ctx: Arc<InvocationContext>) -> EventStream {
        let (tx, rx) = mpsc::channel(1);
        let agent = self;
        tokio::spawn(async move {
            ctx.set_agent(agent.clone() as Arc<dyn Agent>);
            let tracer = default_tracer();
            let mut span = tracer.start_span("agent.run");
            span.set_attribute("agent.name", agent.name());
            span.set_attribute("invocation.id", ctx.invocation_id());

            if let Some(callback) = &agent.before_agent_callback {
                let cb_ctx = CallbackContext::new(&ctx, agent.name());
                if let Some(content) = callback(&cb_ctx) {
                    let event = Event::new(ctx.invocation_id(), agent.name())
                        .with_branch(ctx.branch().map(|b| b.to_string()))
                        .with_content(content);
                    ctx.push_event(event.clone()).await;
                    let _ = tx.send(event).await;
                    span.end();
                    return;
                }
            }

            let outcome = agent.flow.clone().run(agent.clone(), ctx.clone(), &tx).await;

            if let Ok(Some(final_content)) = outcome {
                if let Some(callback) = &agent.after_agent_callback {
                    let cb_ctx = CallbackContext::new(&ctx, agent.name());
                    if let Some(replacement) = callback(&cb_ctx, &final_content) {
                        let event = Event::new(ctx.invocation_id(), agent.name())
                            .with_branch(ctx.branch().map(|b| b.to_string()))
                            .with_content(replacement);
                        ctx.push_event(event.clone()).await;
                        let _ = tx.send(event).await;
                    }
                }
            }
            span.end();
        });
        rx
    }
}

/// Builder for [`LlmAgent`]. Recognized fields only; there is no
/// runtime-flexible option dictionary.
pub struct LlmAgentBuilder {
    name: String,
    description: String,
    instruction: Option<String>,
    model: Option<ModelRef>,
    tools: Vec<Arc<dyn Tool>>,
    sub_agents: Vec<Arc<dyn Agent>>,
    planner: Option<Arc<dyn Planner>>,
    before_agent_callback: Option<BeforeAgentCallback>,
    after_agent_callback: Option<AfterAgentCallback>,
    before_model_callback: Option<BeforeModelCallback>,
    after_model_callback: Option<AfterModelCallback>,
}

impl LlmAgentBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instruction: None,
            model: None,
            tools: Vec::new(),
            sub_agents: Vec::new(),
            planner: None,
            before_agent_callback: None,
            after_agent_callback: None,
            before_model_callback: None,
            after_model_callback: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    /// Select the model by name; resolved through the registry on first call.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(ModelRef::Named(model.into()));
        self
    }

    /// Bind a concrete backend, bypassing the registry.
    pub fn model_handle(mut self, llm: Arc<dyn Llm>) -> Self {
        self.model = Some(ModelRef::Handle(llm));
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn sub_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.sub_agents.push(agent);
        self
    }

    pub fn sub_agents(mut self, agents: Vec<Arc<dyn Agent>>) -> Self {
        self.sub_agents.extend(agents);
        self
    }

    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn before_agent_callback(mut self, callback: BeforeAgentCallback) -> Self {
        self.before_agent_callback = Some(callback);
        self
    }

    pub fn after_agent_callback(mut self, callback: AfterAgentCallback) -> Self {
        self.after_agent_callback = Some(callback);
        self
    }

    pub fn before_model_callback(mut self, callback: BeforeModelCallback) -> Self {
        self.before_model_callback = Some(callback);
        self
    }

    pub fn after_model_callback(mut self, callback: AfterModelCallback) -> Self {
        self.after_model_callback = Some(callback);
        self
    }

    pub fn build(mut self) -> Result<Arc<LlmAgent>> {
        validate_agent_name(&self.name);
        let model = self
            .model
            .take()
            .ok_or_else(|| AgentError::InvalidArgument(format!("agent '{}' has no model", self.name)))?;

        // Agents with sub-agents can always route to them.
        let has_transfer = self.tools.iter().any(|t| t.name() == "transfer_to_agent");
        if !self.sub_agents.is_empty() && !has_transfer {
            self.tools.push(Arc::new(TransferToAgentTool::new()));
        }

        let mut tools_by_name = HashMap::new();
        for tool in &self.tools {
            tools_by_name.insert(tool.name().to_string(), tool.clone());
        }

        let agent = Arc::new(LlmAgent {
            name: self.name,
            description: self.description,
            instruction: self.instruction,
            model,
            tools: self.tools,
            tools_by_name,
            sub_agents: self.sub_agents,
            planner: self.planner,
            flow: Arc::new(LlmFlow::standard()),
            before_agent_callback: self.before_agent_callback,
            after_agent_callback: self.after_agent_callback,
            before_model_callback: self.before_model_callback,
            after_model_callback: self.after_model_callback,
            parent: ParentLink::new(),
        });

        let as_dyn: Arc<dyn Agent> = agent.clone();
        adopt_sub_agents(&as_dyn, &agent.sub_agents)?;
        Ok(agent)
    }
}

/// Outcome of draining one sub-agent run.
pub(crate) struct SubRunOutcome {
    /// Final response text (empty when the run produced none).
    pub text: String,
    /// True when any event escalated.
    pub escalate: bool,
    /// Set when the run ended with an error event.
    pub error: Option<AgentError>,
}

/// Run `agent` on a branch-scoped child context seeded with `message`,
/// optionally forwarding every event to `forward`, and collect the outcome.
pub(crate) async fn collect_sub_run(
    agent: &Arc<dyn Agent>,
    ctx: &Arc<InvocationContext>,
    message: &str,
    forward: Option<&mpsc::Sender<Event>>,
) -> SubRunOutcome {
    use crate::agentflow::content::Role;

    let child = ctx.child(
        agent.clone(),
        Some(Content::new(Role::User).with_text(message)),
    );
    let mut stream = agent.clone().run(child);

    let mut outcome = SubRunOutcome {
        text: String::new(),
        escalate: false,
        error: None,
    };
    while let Some(event) = stream.recv().await {
        outcome.escalate = outcome.escalate || event.actions.escalate;
        if let Some(code) = &event.error_code {
            let message = event.error_message.clone().unwrap_or_default();
            outcome.error = Some(error_from_code(code, message));
        } else if event.is_final_response() {
            if let Some(content) = &event.content {
                let text = content.text();
                if !text.is_empty() {
                    outcome.text = text;
                }
            }
        }
        if let Some(tx) = forward {
            if tx.send(event).await.is_err() {
                break;
            }
        }
    }
    outcome
}

/// Rebuild an [`AgentError`] from an event's error code and message.
pub(crate) fn error_from_code(code: &str, message: String) -> AgentError {
    match code {
        "INVALID_ARGUMENT" => AgentError::InvalidArgument(message),
        "NOT_FOUND" => AgentError::NotFound(message),
        "HIERARCHY_CONFLICT" => AgentError::HierarchyConflict(message),
        "RESOURCE_EXHAUSTED" => AgentError::ResourceExhausted(message),
        "UNAVAILABLE" => AgentError::Unavailable(message),
        "CANCELLED" => AgentError::Cancelled,
        "UNSUPPORTED" => AgentError::Unsupported(message),
        _ => AgentError::Internal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentflow::content::Role;
    use crate::agentflow::model::LlmResponse;
    use async_trait::async_trait;

    struct SilentLlm;

    #[async_trait]
    impl Llm for SilentLlm {
        fn model_name(&self) -> &str {
            "silent"
        }

        async fn generate_content(&self, _request: &LlmRequest) -> Result<LlmResponse> {
            Ok(LlmResponse::with_content(
                Content::new(Role::Model).with_text("ok"),
            ))
        }
    }

    fn leaf(name: &str) -> Arc<LlmAgent> {
        LlmAgent::builder(name)
            .model_handle(Arc::new(SilentLlm))
            .build()
            .unwrap()
    }

    #[test]
    fn test_find_agent_from_root() {
        let billing = leaf("billing");
        let refunds = leaf("refunds");
        let root = LlmAgent::builder("support")
            .model_handle(Arc::new(SilentLlm))
            .sub_agent(billing.clone())
            .sub_agent(refunds)
            .build()
            .unwrap();

        let root_dyn: Arc<dyn Agent> = root.clone();
        assert!(find_agent(&root_dyn, "billing").is_some());
        assert!(find_agent(&root_dyn, "support").is_some());
        assert!(find_agent(&root_dyn, "nobody").is_none());
        assert!(find_sub_agent(&root_dyn, "support").is_none());

        let billing_dyn: Arc<dyn Agent> = billing;
        assert_eq!(root_agent(&billing_dyn).name(), "support");
    }

    #[test]
    fn test_parent_reassignment_is_rejected() {
        let shared = leaf("shared");
        let _first = LlmAgent::builder("first")
            .model_handle(Arc::new(SilentLlm))
            .sub_agent(shared.clone())
            .build()
            .unwrap();

        let second = LlmAgent::builder("second")
            .model_handle(Arc::new(SilentLlm))
            .sub_agent(shared)
            .build();
        match second {
            Err(AgentError::HierarchyConflict(_)) => {}
            other => panic!("expected hierarchy conflict, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let result = LlmAgent::builder("twin")
            .model_handle(Arc::new(SilentLlm))
            .sub_agent(leaf("twin"))
            .build();
        match result {
            Err(AgentError::HierarchyConflict(_)) => {}
            other => panic!("expected hierarchy conflict, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_sub_agents_get_transfer_tool() {
        let root = LlmAgent::builder("root")
            .model_handle(Arc::new(SilentLlm))
            .sub_agent(leaf("spec"))
            .build()
            .unwrap();
        assert!(root.tool("transfer_to_agent").is_some());

        let lone = leaf("lone");
        assert!(lone.tool("transfer_to_agent").is_none());
    }

    #[test]
    fn test_build_requires_model() {
        match LlmAgent::builder("nameless").build() {
            Err(AgentError::InvalidArgument(_)) => {}
            other => panic!("expected invalid argument, got {:?}", other.map(|_| ())),
        }
    }
}
