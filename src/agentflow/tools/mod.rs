//! Built-in tools.
//!
//! Built-ins publish intent rather than doing work themselves: `exit_loop`
//! and `transfer_to_agent` set event actions that the flow and the loop
//! agent interpret, while the search and code-execution variants advertise
//! model-side capabilities on the outgoing request and are executed inside
//! the model.

mod agent_tool;

pub use agent_tool::AgentTool;

use crate::agentflow::error::{AgentError, Result};
use crate::agentflow::model::LlmRequest;
use crate::agentflow::tool::{Tool, ToolContext};
use async_trait::async_trait;
use serde_json::{json, Value};

/// Ends the enclosing loop agent by escalating.
pub struct ExitLoopTool;

impl ExitLoopTool {
    pub fn new() -> Self {
        ExitLoopTool
    }
}

impl Default for ExitLoopTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ExitLoopTool {
    fn name(&self) -> &str {
        "exit_loop"
    }

    fn description(&self) -> &str {
        "Exits the loop. Call this only when the task is fully done."
    }

    async fn execute(&self, ctx: &mut ToolContext, _args: Value) -> Result<Value> {
        ctx.actions.escalate = true;
        Ok(json!({}))
    }
}

/// Routes the remainder of the invocation to a named agent in the tree.
pub struct TransferToAgentTool;

impl TransferToAgentTool {
    pub fn new() -> Self {
        TransferToAgentTool
    }
}

impl Default for TransferToAgentTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for TransferToAgentTool {
    fn name(&self) -> &str {
        "transfer_to_agent"
    }

    fn description(&self) -> &str {
        "Transfers the conversation to another agent when its expertise fits better."
    }

    fn parameters_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "agent_name": {
                    "type": "string",
                    "description": "Name of the agent to hand the conversation to"
                }
            },
            "required": ["agent_name"]
        }))
    }

    async fn execute(&self, ctx: &mut ToolContext, args: Value) -> Result<Value> {
        let target = args
            .get("agent_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AgentError::InvalidArgument("transfer_to_agent requires 'agent_name'".to_string())
            })?;
        ctx.actions.transfer_to_agent = Some(target.to_string());
        Ok(json!({}))
    }
}

/// A capability executed inside the model. Advertises itself on the request
/// and rejects local execution.
pub struct ModelSideTool {
    name: &'static str,
    description: &'static str,
}

#[async_trait]
impl Tool for ModelSideTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    async fn process_llm_request(&self, request: &mut LlmRequest) -> Result<()> {
        request.add_builtin_tool(self.name);
        Ok(())
    }

    async fn execute(&self, _ctx: &mut ToolContext, _args: Value) -> Result<Value> {
        Err(AgentError::Unsupported(format!(
            "'{}' executes inside the model",
            self.name
        )))
    }
}

/// Web grounding through the model's search integration.
pub fn google_search() -> ModelSideTool {
    ModelSideTool {
        name: "google_search",
        description: "Grounds answers with Google Search results.",
    }
}

/// Enterprise document grounding.
pub fn vertex_ai_search() -> ModelSideTool {
    ModelSideTool {
        name: "vertex_ai_search",
        description: "Grounds answers with Vertex AI Search data stores.",
    }
}

/// Model-side sandboxed code execution.
pub fn built_in_code_execution() -> ModelSideTool {
    ModelSideTool {
        name: "built_in_code_execution",
        description: "Lets the model write and execute code to answer the question.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentflow::invocation::InvocationContext;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_exit_loop_escalates() {
        let ctx = Arc::new(InvocationContext::for_test());
        let mut tool_ctx = ToolContext::new(ctx, "c1".to_string());
        ExitLoopTool::new()
            .execute(&mut tool_ctx, json!({}))
            .await
            .unwrap();
        assert!(tool_ctx.actions.escalate);
    }

    #[tokio::test]
    async fn test_transfer_sets_target() {
        let ctx = Arc::new(InvocationContext::for_test());
        let mut tool_ctx = ToolContext::new(ctx, "c1".to_string());
        TransferToAgentTool::new()
            .execute(&mut tool_ctx, json!({"agent_name": "billing"}))
            .await
            .unwrap();
        assert_eq!(
            tool_ctx.actions.transfer_to_agent.as_deref(),
            Some("billing")
        );
    }

    #[tokio::test]
    async fn test_transfer_requires_agent_name() {
        let ctx = Arc::new(InvocationContext::for_test());
        let mut tool_ctx = ToolContext::new(ctx, "c1".to_string());
        let err = TransferToAgentTool::new()
            .execute(&mut tool_ctx, json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn test_model_side_tools_advertise_but_do_not_execute() {
        let tool = google_search();
        let mut request = LlmRequest::new("gemini-2.0-flash");
        tool.process_llm_request(&mut request).await.unwrap();
        assert_eq!(request.builtin_tools, vec!["google_search"]);
        assert!(request.tools.is_empty());

        let ctx = Arc::new(InvocationContext::for_test());
        let mut tool_ctx = ToolContext::new(ctx, "c1".to_string());
        let err = tool.execute(&mut tool_ctx, json!({})).await.unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED");
    }
}
