//! Drives invocations and renders events to a transport.
//!
//! [`Runner::run`] is the one-shot path: hand it an agent and a user
//! message, get the final response text back. [`Runner::start`] exposes the
//! raw event stream together with its invocation context, which is what
//! servers and UIs build on. [`Runner::run_interactive`] is a line-oriented
//! REPL over any async reader/writer pair, with an optional JSON session log
//! written when the session closes.

use crate::agentflow::agent::{error_from_code, Agent, EventStream};
use crate::agentflow::artifact::ArtifactService;
use crate::agentflow::content::{Content, Role};
use crate::agentflow::error::{AgentError, Result};
use crate::agentflow::invocation::{InvocationContext, RunConfig, SessionKey};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// One REPL exchange, kept for the session log.
#[derive(Debug, Clone, Serialize)]
pub struct Interaction {
    pub user: String,
    pub response: String,
}

#[derive(Serialize)]
struct SessionRecord<'a> {
    agent_name: &'a str,
    agent_model: Option<&'a str>,
    start: String,
    end: String,
    interactions: &'a [Interaction],
}

/// Entry point for callers: owns the session identity, run configuration,
/// and optional artifact service shared by its invocations.
pub struct Runner {
    session: SessionKey,
    run_config: RunConfig,
    artifacts: Option<Arc<dyn ArtifactService>>,
    session_log_path: Option<PathBuf>,
}

impl Runner {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            session: SessionKey {
                app: app_name.into(),
                user: "default-user".to_string(),
                session: Uuid::new_v4().to_string(),
            },
            run_config: RunConfig::default(),
            artifacts: None,
            session_log_path: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.session.user = user.into();
        self
    }

    pub fn with_session_id(mut self, session: impl Into<String>) -> Self {
        self.session.session = session.into();
        self
    }

    pub fn with_run_config(mut self, run_config: RunConfig) -> Self {
        self.run_config = run_config;
        self
    }

    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactService>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Write a JSON session log to `path` when an interactive session ends.
    pub fn with_session_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.session_log_path = Some(path.into());
        self
    }

    /// Start an invocation and return its context plus the event stream.
    pub fn start(
        &self,
        agent: &Arc<dyn Agent>,
        content: Content,
    ) -> (Arc<InvocationContext>, EventStream) {
        let mut ctx =
            InvocationContext::new(Some(content), self.run_config.clone()).with_session(self.session.clone());
        if let Some(artifacts) = &self.artifacts {
            ctx = ctx.with_artifacts(artifacts.clone());
        }
        let ctx = Arc::new(ctx);
        let stream = agent.clone().run(ctx.clone());
        (ctx, stream)
    }

    /// Re-run an agent on an existing context: the host-side counterpart of
    /// long-running tool suspension, after injecting the tool's response
    /// event with [`InvocationContext::inject_event`].
    pub fn resume(&self, agent: &Arc<dyn Agent>, ctx: &Arc<InvocationContext>) -> EventStream {
        agent.clone().run(ctx.clone())
    }

    /// Non-interactive turn: drain the stream and return the last final
    /// response text. Error events map back to their error kind.
    pub async fn run(&self, agent: &Arc<dyn Agent>, input: &str) -> Result<String> {
        let (_ctx, mut stream) = self.start(agent, Content::new(Role::User).with_text(input));
        let mut final_text = String::new();
        let mut error = None;
        while let Some(event) = stream.recv().await {
            if let Some(code) = &event.error_code {
                let message = event.error_message.clone().unwrap_or_default();
                error = Some(error_from_code(code, message));
            } else if event.is_final_response() {
                if let Some(content) = &event.content {
                    let text = content.text();
                    if !text.is_empty() {
                        final_text = text;
                    }
                }
            }
        }
        match error {
            Some(err) => Err(err),
            None => Ok(final_text),
        }
    }

    /// Line-oriented REPL: read prompts from `input`, write responses to
    /// `output`. `exit`/`quit` or EOF ends the session; the session log, if
    /// configured, is written on the way out.
    pub async fn run_interactive<R, W>(
        &self,
        agent: &Arc<dyn Agent>,
        input: R,
        mut output: W,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let start: DateTime<Utc> = Utc::now();
        let mut interactions = Vec::new();
        let mut lines = input.lines();

        loop {
            write_all(&mut output, b"> ").await?;
            let line = lines
                .next_line()
                .await
                .map_err(|e| AgentError::Internal(e.to_string()))?;
            let line = match line {
                Some(line) => line,
                None => break,
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed == "exit" || trimmed == "quit" {
                break;
            }

            match self.run(agent, trimmed).await {
                Ok(response) => {
                    write_all(&mut output, response.as_bytes()).await?;
                    write_all(&mut output, b"\n").await?;
                    interactions.push(Interaction {
                        user: trimmed.to_string(),
                        response,
                    });
                }
                Err(err) => {
                    write_all(&mut output, format!("error: {}\n", err).as_bytes()).await?;
                }
            }
        }

        if let Some(path) = &self.session_log_path {
            let record = SessionRecord {
                agent_name: agent.name(),
                agent_model: agent.model_name(),
                start: start.to_rfc3339(),
                end: Utc::now().to_rfc3339(),
                interactions: &interactions,
            };
            let encoded = serde_json::to_vec_pretty(&record)
                .map_err(|e| AgentError::Internal(e.to_string()))?;
            tokio::fs::write(path, encoded)
                .await
                .map_err(|e| AgentError::Internal(e.to_string()))?;
        }
        Ok(())
    }
}

async fn write_all<W: AsyncWrite + Unpin>(output: &mut W, bytes: &[u8]) -> Result<()> {
    output
        .write_all(bytes)
        .await
        .map_err(|e| AgentError::Internal(e.to_string()))?;
    output
        .flush()
        .await
        .map_err(|e| AgentError::Internal(e.to_string()))
}
