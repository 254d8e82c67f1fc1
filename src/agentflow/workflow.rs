//! Composite agents.
//!
//! Three shapes cover most multi-agent workflows:
//!
//! - [`SequentialAgent`] pipes each sub-agent's final response into the next
//!   one, failing fast on the first error.
//! - [`ParallelAgent`] fans the message out to every sub-agent concurrently
//!   and joins the responses in declaration order.
//! - [`LoopAgent`] repeats its sub-agent sequence up to a bounded number of
//!   iterations; any sub-agent can end the loop early through the
//!   `exit_loop` tool.
//!
//! Composites participate in the agent tree like any other node, so they can
//! be transfer targets and wrap [`LlmAgent`]s or other composites.

use crate::agentflow::agent::{
    adopt_sub_agents, collect_sub_run, validate_agent_name, Agent, EventStream, ParentLink,
};
use crate::agentflow::content::{Content, Role};
use crate::agentflow::error::{AgentError, Result};
use crate::agentflow::event::Event;
use crate::agentflow::invocation::InvocationContext;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Separator between parallel sub-agent responses. Kept in one place so a
/// structured joiner can be swapped in without touching ordering.
const PARALLEL_JOINER: &str = "\n\n";

const DEFAULT_MAX_ITERATIONS: usize = 10;

fn initial_message(ctx: &InvocationContext) -> String {
    ctx.user_content().map(|c| c.text()).unwrap_or_default()
}

async fn emit_composite_event(
    ctx: &Arc<InvocationContext>,
    tx: &mpsc::Sender<Event>,
    event: Event,
) {
    ctx.push_event(event.clone()).await;
    let _ = tx.send(event).await;
}

/// Runs sub-agents in order, chaining messages: the first sub-agent sees the
/// user message, each later one sees its predecessor's final response.
pub struct SequentialAgent {
    name: String,
    description: String,
    sub_agents: Vec<Arc<dyn Agent>>,
    parent: ParentLink,
}

impl SequentialAgent {
    pub fn builder(name: impl Into<String>) -> CompositeBuilder<SequentialAgent> {
        CompositeBuilder::new(name)
    }
}

impl Agent for SequentialAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
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
            let mut message = initial_message(&ctx);
            for sub in &agent.sub_agents {
                if ctx.is_cancelled() {
                    return;
                }
                let outcome = collect_sub_run(sub, &ctx, &message, Some(&tx)).await;
                if outcome.error.is_some() {
                    // The sub-agent's error event was already forwarded.
                    return;
                }
                message = outcome.text;
            }
        });
        rx
    }
}

/// Fans the message out to every sub-agent concurrently and joins the final
/// responses in declaration order, regardless of completion order.
pub struct ParallelAgent {
    name: String,
    description: String,
    sub_agents: Vec<Arc<dyn Agent>>,
    parent: ParentLink,
}

impl ParallelAgent {
    pub fn builder(name: impl Into<String>) -> CompositeBuilder<ParallelAgent> {
        CompositeBuilder::new(name)
    }
}

impl Agent for ParallelAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
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
            let message = initial_message(&ctx);

            let mut handles = Vec::with_capacity(agent.sub_agents.len());
            for sub in agent.sub_agents.clone() {
                let ctx = ctx.clone();
                let message = message.clone();
                handles.push(tokio::spawn(async move {
                    collect_sub_run(&sub, &ctx, &message, None).await
                }));
            }

            let mut responses = Vec::with_capacity(handles.len());
            let mut first_error = None;
            for handle in handles {
                match handle.await {
                    Ok(outcome) => {
                        if let Some(err) = outcome.error {
                            if first_error.is_none() {
                                first_error = Some(err);
                            }
                        } else {
                            responses.push(outcome.text);
                        }
                    }
                    Err(join_err) => {
                        if first_error.is_none() {
                            first_error = Some(AgentError::Internal(join_err.to_string()));
                        }
                    }
                }
            }

            let event = match first_error {
                Some(err) => Event::error(ctx.invocation_id(), agent.name(), &err)
                    .with_branch(ctx.branch().map(|b| b.to_string())),
                None => Event::new(ctx.invocation_id(), agent.name())
                    .with_branch(ctx.branch().map(|b| b.to_string()))
                    .with_content(
                        Content::new(Role::Model).with_text(responses.join(PARALLEL_JOINER)),
                    ),
            };
            emit_composite_event(&ctx, &tx, event).await;
        });
        rx
    }
}

/// Repeats its sub-agent sequence up to `max_iterations` times (default 10).
/// A sub-agent escalating (typically via the `exit_loop` tool) terminates
/// the loop early.
pub struct LoopAgent {
    name: String,
    description: String,
    sub_agents: Vec<Arc<dyn Agent>>,
    max_iterations: usize,
    parent: ParentLink,
}

impl LoopAgent {
    pub fn builder(name: impl Into<String>) -> CompositeBuilder<LoopAgent> {
        CompositeBuilder::new(name)
    }
}

impl Agent for LoopAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
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
            let mut message = initial_message(&ctx);
            'iterations: for _ in 0..agent.max_iterations {
                for sub in &agent.sub_agents {
                    if ctx.is_cancelled() {
                        return;
                    }
                    let outcome = collect_sub_run(sub, &ctx, &message, Some(&tx)).await;
                    if outcome.error.is_some() {
                        return;
                    }
                    message = outcome.text;
                    if outcome.escalate {
                        break 'iterations;
                    }
                }
            }
        });
        rx
    }
}

/// Shared builder for the three composite shapes.
pub struct CompositeBuilder<T> {
    name: String,
    description: String,
    sub_agents: Vec<Arc<dyn Agent>>,
    max_iterations: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<T> CompositeBuilder<T> {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            sub_agents: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
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
}

impl CompositeBuilder<SequentialAgent> {
    pub fn build(self) -> Result<Arc<SequentialAgent>> {
        validate_agent_name(&self.name);
        let agent = Arc::new(SequentialAgent {
            name: self.name,
            description: self.description,
            sub_agents: self.sub_agents,
            parent: ParentLink::new(),
        });
        let as_dyn: Arc<dyn Agent> = agent.clone();
        adopt_sub_agents(&as_dyn, &agent.sub_agents)?;
        Ok(agent)
    }
}

impl CompositeBuilder<ParallelAgent> {
    pub fn build(self) -> Result<Arc<ParallelAgent>> {
        validate_agent_name(&self.name);
        let agent = Arc::new(ParallelAgent {
            name: self.name,
            description: self.description,
            sub_agents: self.sub_agents,
            parent: ParentLink::new(),
        });
        let as_dyn: Arc<dyn Agent> = agent.clone();
        adopt_sub_agents(&as_dyn, &agent.sub_agents)?;
        Ok(agent)
    }
}

impl CompositeBuilder<LoopAgent> {
    /// Cap on full passes through the sub-agent sequence.
    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn build(self) -> Result<Arc<LoopAgent>> {
        validate_agent_name(&self.name);
        let agent = Arc::new(LoopAgent {
            name: self.name,
            description: self.description,
            sub_agents: self.sub_agents,
            max_iterations: self.max_iterations,
            parent: ParentLink::new(),
        });
        let as_dyn: Arc<dyn Agent> = agent.clone();
        adopt_sub_agents(&as_dyn, &agent.sub_agents)?;
        Ok(agent)
    }
}
