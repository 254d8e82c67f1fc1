// src/lib.rs

// Import the top-level `agentflow` module.
pub mod agentflow;

// Re-export the component modules at the crate root so callers write
// agentflow::tool::FunctionTool instead of agentflow::agentflow::tool::...
pub use agentflow::{
    agent, artifact, auth, content, error, event, flow, invocation, model, models, planner,
    remote, runner, telemetry, tool, tools, workflow,
};

// Re-exporting key items for easier external access.
pub use agentflow::agent::{Agent, EventStream, LlmAgent};
pub use agentflow::content::{Content, Part, Role};
pub use agentflow::error::AgentError;
pub use agentflow::event::{Event, EventActions};
pub use agentflow::invocation::{InvocationContext, RunConfig, StreamingMode};
pub use agentflow::runner::Runner;
pub use agentflow::tool::{FunctionTool, Tool, ToolContext};
pub use agentflow::workflow::{LoopAgent, ParallelAgent, SequentialAgent};
