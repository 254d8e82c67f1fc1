//! Sub-agents as tools.
//!
//! [`AgentTool`] wraps an agent so a coordinator can call it like any other
//! function: input `{"request": "..."}`, output `{"response": "..."}`. This
//! is how hierarchical delegation happens without special cases in the flow.
//! The tool holds a plain reference to the wrapped agent; it does not adopt
//! it into the caller's tree, so the same specialist can serve several
//! coordinators.

use crate::agentflow::agent::Agent;
use crate::agentflow::content::{Content, Role};
use crate::agentflow::error::Result;
use crate::agentflow::tool::{Tool, ToolContext};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Wraps an agent as a callable tool.
pub struct AgentTool {
    agent: Arc<dyn Agent>,
    skip_summarization: bool,
}

impl AgentTool {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self {
            agent,
            skip_summarization: false,
        }
    }

    /// Surface the sub-agent's answer verbatim instead of letting the caller
    /// model summarize it.
    pub fn skip_summarization(mut self, skip: bool) -> Self {
        self.skip_summarization = skip;
        self
    }

    fn extract_request(args: &Value) -> String {
        if let Some(request) = args.get("request").and_then(|v| v.as_str()) {
            return request.to_string();
        }
        match args {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        self.agent.name()
    }

    fn description(&self) -> &str {
        self.agent.description()
    }

    fn parameters_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "request": {
                    "type": "string",
                    "description": format!("The request to send to the {} agent", self.agent.name())
                }
            },
            "required": ["request"]
        }))
    }

    fn response_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "response": { "type": "string" }
            }
        }))
    }

    async fn execute(&self, ctx: &mut ToolContext, args: Value) -> Result<Value> {
        let request = Self::extract_request(&args);
        let child = ctx.invocation().child(
            self.agent.clone(),
            Some(Content::new(Role::User).with_text(request)),
        );

        let mut stream = self.agent.clone().run(child);
        let mut response = String::new();
        while let Some(event) = stream.recv().await {
            // Surface the sub-agent's side effects on the wrapping call.
            ctx.actions
                .state_delta
                .extend(event.actions.state_delta.clone());
            ctx.actions
                .artifact_delta
                .extend(event.actions.artifact_delta.clone());
            if event.error_code.is_none() && event.is_final_response() {
                if let Some(content) = &event.content {
                    let text = content.text();
                    if !text.is_empty() {
                        response = text;
                    }
                }
            }
        }

        if self.skip_summarization {
            ctx.actions.skip_summarization = true;
        }
        Ok(json!({ "response": response }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentflow::agent::{EventStream, ParentLink};
    use crate::agentflow::error::Result;
    use crate::agentflow::event::Event;
    use crate::agentflow::invocation::InvocationContext;
    use tokio::sync::mpsc;

    struct EchoAgent {
        name: String,
        parent: ParentLink,
    }

    impl Agent for EchoAgent {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "Echoes the request"
        }

        fn parent(&self) -> Option<Arc<dyn Agent>> {
            self.parent.get()
        }

        fn attach_parent(&self, parent: Arc<dyn Agent>) -> Result<()> {
            self.parent.attach(&self.name, parent)
        }

        fn run(self: Arc<Self>, ctx: Arc<InvocationContext>) -> EventStream {
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(async move {
                let text = ctx.user_content().map(|c| c.text()).unwrap_or_default();
                let event = Event::new(ctx.invocation_id(), self.name())
                    .with_content(Content::new(Role::Model).with_text(format!("echo: {}", text)));
                ctx.push_event(event.clone()).await;
                let _ = tx.send(event).await;
            });
            rx
        }
    }

    #[tokio::test]
    async fn test_agent_tool_runs_wrapped_agent() {
        let specialist: Arc<dyn Agent> = Arc::new(EchoAgent {
            name: "specialist".to_string(),
            parent: ParentLink::new(),
        });
        let tool = AgentTool::new(specialist);
        assert_eq!(tool.name(), "specialist");

        let ctx = Arc::new(InvocationContext::for_test());
        let mut tool_ctx = ToolContext::new(ctx, "c1".to_string());
        let result = tool
            .execute(&mut tool_ctx, json!({"request": "hello"}))
            .await
            .unwrap();
        assert_eq!(result["response"], "echo: hello");
    }

    #[test]
    fn test_extract_request_variants() {
        assert_eq!(
            AgentTool::extract_request(&json!({"request": "do it"})),
            "do it"
        );
        assert_eq!(AgentTool::extract_request(&json!("plain")), "plain");
    }
}
