//! Remote agents over HTTP.
//!
//! A [`RemoteAgent`] delegates an invocation to a service that speaks the
//! event wire format: POST `{invocation_id, context: {invocation_id,
//! agent_name}}`, answer with a JSON array of events. Transport failures and
//! non-200 statuses become a single synthesized error event, so remote
//! agents degrade the same way local agents fail.

use crate::agentflow::agent::{Agent, EventStream, ParentLink};
use crate::agentflow::error::{AgentError, Result};
use crate::agentflow::event::Event;
use crate::agentflow::invocation::InvocationContext;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const REQUEST_DEADLINE: Duration = Duration::from_secs(120);

/// An agent served by a remote endpoint.
pub struct RemoteAgent {
    name: String,
    description: String,
    url: String,
    client: reqwest::Client,
    parent: ParentLink,
}

impl RemoteAgent {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_DEADLINE)
            .build()
            .map_err(|e| AgentError::Internal(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            description: String::new(),
            url: url.into(),
            client,
            parent: ParentLink::new(),
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl Agent for RemoteAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
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
            let body = json!({
                "invocation_id": ctx.invocation_id(),
                "context": {
                    "invocation_id": ctx.invocation_id(),
                    "agent_name": agent.name,
                }
            });

            let outcome = agent.client.post(&agent.url).json(&body).send().await;
            let events = match outcome {
                Ok(response) if response.status().is_success() => {
                    match response.json::<Vec<Event>>().await {
                        Ok(events) => events,
                        Err(err) => vec![Event::error(
                            ctx.invocation_id(),
                            agent.name(),
                            &AgentError::Unavailable(format!(
                                "remote agent returned malformed events: {}",
                                err
                            )),
                        )],
                    }
                }
                Ok(response) => vec![Event::error(
                    ctx.invocation_id(),
                    agent.name(),
                    &AgentError::Unavailable(format!(
                        "remote agent answered with status {}",
                        response.status()
                    )),
                )],
                Err(err) => vec![Event::error(
                    ctx.invocation_id(),
                    agent.name(),
                    &AgentError::Unavailable(format!("remote agent request failed: {}", err)),
                )],
            };

            for event in events {
                ctx.push_event(event.clone()).await;
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        rx
    }
}
