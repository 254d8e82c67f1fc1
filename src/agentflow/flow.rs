//! The LLM Flow: the orchestration loop at the heart of the runtime.
//!
//! One *step* is one model turn: ordered request processors build an
//! [`LlmRequest`], the model is consulted (honoring the before/after model
//! callbacks and the call budget), ordered response processors rewrite the
//! answer, and the finalized event is emitted. Function calls are then
//! dispatched to tools and answered with a single aggregated
//! function-response event; a transfer re-runs the loop on another agent;
//! long-running calls suspend the flow until the host injects their
//! responses. Steps repeat until a terminal event with nothing left to
//! dispatch.
//!
//! ```text
//! INIT ─► PREPROCESS ─► CALL ─► POSTPROCESS ─► (terminate | DISPATCH | TRANSFER) ─► (INIT or END)
//! ```
//!
//! Tool failures never abort the loop: they become error-shaped function
//! responses and the conversation continues. Model failures, an exhausted
//! budget, and unresolvable transfer targets are terminal and surface as a
//! final error event.

use crate::agentflow::agent::{
    find_agent, root_agent, Agent, CallbackContext, LlmAgent, USER_AUTHOR,
};
use crate::agentflow::auth::{AuthRequestProcessor, REQUEST_CREDENTIAL_FUNCTION};
use crate::agentflow::content::{Content, FunctionCall, FunctionResponse, Part, Role};
use crate::agentflow::error::{AgentError, Result};
use crate::agentflow::event::{Event, EventActions};
use crate::agentflow::invocation::{InvocationContext, LiveRequest, StreamingMode};
use crate::agentflow::model::{LlmRequest, LlmResponse};
use crate::agentflow::telemetry::default_tracer;
use crate::agentflow::tool::ToolContext;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Mutates the outgoing request before the model call. May emit events of
/// its own (e.g. auth resumption) and may end the invocation early.
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    async fn process(
        &self,
        ctx: &Arc<InvocationContext>,
        agent: &Arc<LlmAgent>,
        request: &mut LlmRequest,
    ) -> Result<Vec<Event>>;
}

/// Rewrites a model response before the event is finalized.
#[async_trait]
pub trait ResponseProcessor: Send + Sync {
    async fn process(
        &self,
        ctx: &Arc<InvocationContext>,
        agent: &Arc<LlmAgent>,
        response: &mut LlmResponse,
    ) -> Result<()>;
}

struct StepOutcome {
    terminal: bool,
    final_content: Option<Content>,
}

/// The step state machine. One instance per [`LlmAgent`].
pub struct LlmFlow {
    request_processors: Vec<Arc<dyn RequestProcessor>>,
    response_processors: Vec<Arc<dyn ResponseProcessor>>,
}

impl LlmFlow {
    /// The stock processor chain: planner preamble, system instruction, auth
    /// resumption, conversation history, tool declarations; planner response
    /// rewriting on the way back.
    pub fn standard() -> Self {
        Self {
            request_processors: vec![
                Arc::new(PlanningRequestProcessor),
                Arc::new(InstructionsRequestProcessor),
                Arc::new(AuthRequestProcessor::new()),
                Arc::new(ContentsRequestProcessor),
                Arc::new(ToolsRequestProcessor),
            ],
            response_processors: vec![Arc::new(PlanningResponseProcessor)],
        }
    }

    /// Custom processor chain, in execution order.
    pub fn new(
        request_processors: Vec<Arc<dyn RequestProcessor>>,
        response_processors: Vec<Arc<dyn ResponseProcessor>>,
    ) -> Self {
        Self {
            request_processors,
            response_processors,
        }
    }

    /// Drive steps until a terminal event. Returns the last final content
    /// seen, for the after-agent callback.
    pub async fn run(
        self: Arc<Self>,
        agent: Arc<LlmAgent>,
        ctx: Arc<InvocationContext>,
        tx: &mpsc::Sender<Event>,
    ) -> Result<Option<Content>> {
        let mut last_final = None;
        loop {
            if ctx.is_cancelled() {
                return Ok(last_final);
            }
            let outcome = self.step(&agent, &ctx, tx).await?;
            if outcome.final_content.is_some() {
                last_final = outcome.final_content;
            }
            if outcome.terminal {
                return Ok(last_final);
            }
        }
    }

    async fn step(
        &self,
        agent: &Arc<LlmAgent>,
        ctx: &Arc<InvocationContext>,
        tx: &mpsc::Sender<Event>,
    ) -> Result<StepOutcome> {
        let mut outcome = StepOutcome {
            terminal: false,
            final_content: None,
        };
        let tracer = default_tracer();
        let mut span = tracer.start_span("flow.step");
        span.set_attribute("agent.name", agent.name());

        // PREPROCESS
        let mut request = LlmRequest::new(agent.model_identifier());
        for processor in &self.request_processors {
            match processor.process(ctx, agent, &mut request).await {
                Ok(events) => {
                    for event in events {
                        emit(ctx, tx, event).await?;
                    }
                }
                Err(err) => {
                    emit_error(ctx, tx, agent, &err).await?;
                    span.end();
                    outcome.terminal = true;
                    return Ok(outcome);
                }
            }
        }
        if ctx.ended() {
            span.end();
            outcome.terminal = true;
            return Ok(outcome);
        }

        // CALL
        let cb_ctx = CallbackContext::new(ctx, agent.name());
        let precomputed = agent
            .before_model_callback
            .as_ref()
            .and_then(|cb| cb(&cb_ctx, &request));

        let mut final_response = match precomputed {
            Some(response) => Some(apply_after_model(agent, &cb_ctx, response)),
            None => {
                if let Err(err) = ctx.increment_llm_call_count() {
                    emit_error(ctx, tx, agent, &err).await?;
                    span.end();
                    outcome.terminal = true;
                    return Ok(outcome);
                }
                let llm = match agent.resolve_model() {
                    Ok(llm) => llm,
                    Err(err) => {
                        emit_error(ctx, tx, agent, &err).await?;
                        span.end();
                        outcome.terminal = true;
                        return Ok(outcome);
                    }
                };

                let mut model_span = tracer.start_span("llm.generate");
                model_span.set_attribute("model", &request.model);
                let called = self
                    .call_model(agent, ctx, tx, &cb_ctx, llm.as_ref(), &request)
                    .await;
                model_span.end();
                match called {
                    Ok(CallResult::Final(response)) => Some(response),
                    Ok(CallResult::Stopped) => {
                        span.end();
                        outcome.terminal = true;
                        return Ok(outcome);
                    }
                    Err(err) => {
                        emit_error(ctx, tx, agent, &err).await?;
                        span.end();
                        outcome.terminal = true;
                        return Ok(outcome);
                    }
                }
            }
        };

        let mut response = match final_response.take() {
            Some(response) => response,
            None => {
                let err =
                    AgentError::Internal("model stream ended without a final response".to_string());
                emit_error(ctx, tx, agent, &err).await?;
                span.end();
                outcome.terminal = true;
                return Ok(outcome);
            }
        };

        // POSTPROCESS
        for processor in &self.response_processors {
            if let Err(err) = processor.process(ctx, agent, &mut response).await {
                emit_error(ctx, tx, agent, &err).await?;
                span.end();
                outcome.terminal = true;
                return Ok(outcome);
            }
        }

        let model_event = self.finalize_model_event(agent, ctx, response);
        let calls: Vec<FunctionCall> = model_event
            .content
            .as_ref()
            .map(|c| c.function_calls().into_iter().cloned().collect())
            .unwrap_or_default();
        let model_event = emit(ctx, tx, model_event).await?;

        if model_event.error_code.is_some() {
            span.end();
            outcome.terminal = true;
            return Ok(outcome);
        }
        if model_event.is_final_response() {
            outcome.final_content = model_event.content.clone();
        }

        // Long-running suspension: emit and return without dispatch.
        if !model_event.long_running_tool_ids.is_empty() {
            span.end();
            outcome.terminal = true;
            return Ok(outcome);
        }

        if calls.is_empty() {
            if !model_event.is_final_response() {
                log::warn!("model turn produced neither content nor function calls; stopping");
            }
            span.end();
            outcome.terminal = true;
            return Ok(outcome);
        }

        // DISPATCH
        let mut actions = EventActions::default();
        let mut parts = Vec::with_capacity(calls.len());
        for call in &calls {
            if ctx.is_cancelled() {
                span.end();
                outcome.terminal = true;
                return Ok(outcome);
            }
            let mut tool_span = tracer.start_span("tool.execute");
            tool_span.set_attribute("tool.name", &call.name);
            let mut auth_request = None;
            let value = match agent.tool(&call.name) {
                None => {
                    log::warn!("model requested unknown tool '{}'", call.name);
                    json!({ "error": format!("tool '{}' is not available", call.name) })
                }
                Some(tool) => {
                    let mut tool_ctx = ToolContext::new(ctx.clone(), call.id.clone());
                    let result = tool.execute(&mut tool_ctx, call.args.clone()).await;
                    auth_request = tool_ctx
                        .actions
                        .requested_auth_configs
                        .get(&call.id)
                        .cloned();
                    actions.merge(tool_ctx.actions);
                    match result {
                        Ok(value) => value,
                        Err(err) => {
                            log::warn!("tool '{}' failed: {}", call.name, err);
                            json!({ "error": err.to_string() })
                        }
                    }
                }
            };
            tool_span.end();
            parts.push(Part::FunctionResponse(FunctionResponse {
                id: call.id.clone(),
                name: call.name.clone(),
                response: value,
                auth_request,
            }));
        }

        let requested_auth = actions.requested_auth_configs.clone();
        let mut response_event = Event::new(ctx.invocation_id(), agent.name())
            .with_branch(ctx.branch().map(|b| b.to_string()))
            .with_content(Content {
                role: Some(Role::Tool),
                parts,
            });
        response_event.actions = actions;
        let response_event = emit(ctx, tx, response_event).await?;

        // Relay credential requests to the caller: one long-running
        // `request_euc` call per config, with the auth request itself as a
        // sibling part so transports can render it.
        if !requested_auth.is_empty() {
            let mut parts = Vec::with_capacity(requested_auth.len() * 2);
            let mut ids = Vec::with_capacity(requested_auth.len());
            for (call_id, config) in &requested_auth {
                let id = Uuid::new_v4().to_string();
                ids.push(id.clone());
                parts.push(Part::AuthRequest(config.clone()));
                parts.push(Part::FunctionCall(FunctionCall {
                    id,
                    name: REQUEST_CREDENTIAL_FUNCTION.to_string(),
                    args: json!({ "functionCallId": call_id, "authConfig": config }),
                }));
            }
            let mut auth_event = Event::new(ctx.invocation_id(), agent.name())
                .with_branch(ctx.branch().map(|b| b.to_string()))
                .with_content(Content {
                    role: Some(Role::Model),
                    parts,
                });
            auth_event.long_running_tool_ids = ids;
            emit(ctx, tx, auth_event).await?;
            span.end();
            outcome.terminal = true;
            return Ok(outcome);
        }

        // TRANSFER
        if let Some(target_name) = response_event.actions.transfer_to_agent.clone() {
            let self_dyn: Arc<dyn Agent> = agent.clone();
            let root = root_agent(&self_dyn);
            match find_agent(&root, &target_name) {
                None => {
                    let err = AgentError::NotFound(format!(
                        "transfer target '{}' not found",
                        target_name
                    ));
                    emit_error(ctx, tx, agent, &err).await?;
                }
                Some(target) => {
                    ctx.set_agent(target.clone());
                    let mut sub = target.clone().run(ctx.clone());
                    while let Some(event) = sub.recv().await {
                        if event.error_code.is_none()
                            && event.is_final_response()
                            && event.content.is_some()
                        {
                            outcome.final_content = event.content.clone();
                        }
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
            span.end();
            outcome.terminal = true;
            return Ok(outcome);
        }

        if response_event.actions.escalate {
            span.end();
            outcome.terminal = true;
            return Ok(outcome);
        }

        span.end();
        Ok(outcome)
    }

    /// Consult the model, honoring the run config's streaming mode. Bidi
    /// tries a live connection first and falls back to streaming when the
    /// backend does not support one.
    async fn call_model(
        &self,
        agent: &Arc<LlmAgent>,
        ctx: &Arc<InvocationContext>,
        tx: &mpsc::Sender<Event>,
        cb_ctx: &CallbackContext,
        llm: &dyn crate::agentflow::model::Llm,
        request: &LlmRequest,
    ) -> Result<CallResult> {
        match ctx.run_config().streaming_mode {
            StreamingMode::None => {
                let cancel = ctx.cancel_signal().clone();
                tokio::select! {
                    _ = cancel.cancelled() => Ok(CallResult::Stopped),
                    result = llm.generate_content(request) => {
                        let response = result?;
                        Ok(CallResult::Final(apply_after_model(agent, cb_ctx, response)))
                    }
                }
            }
            StreamingMode::Sse => {
                self.drain_stream(agent, ctx, tx, cb_ctx, llm, request).await
            }
            StreamingMode::Bidi => match llm.connect(request).await {
                Ok(mut connection) => {
                    let queue = ctx.live_requests().clone();
                    let to_model = connection.to_model.clone();
                    tokio::spawn(async move {
                        while let Some(live) = queue.recv().await {
                            let content = match live {
                                LiveRequest::Content(content) => content,
                                LiveRequest::Blob(blob) => {
                                    Content::anonymous().with_part(Part::InlineBlob(blob))
                                }
                                LiveRequest::Close => break,
                            };
                            if to_model.send(content).await.is_err() {
                                break;
                            }
                        }
                    });

                    let mut final_response = None;
                    while let Some(chunk) = connection.from_model.recv().await {
                        if ctx.is_cancelled() {
                            return Ok(CallResult::Stopped);
                        }
                        let chunk = apply_after_model(agent, cb_ctx, chunk);
                        if chunk.partial {
                            emit_partial(ctx, tx, agent, &chunk).await?;
                        } else {
                            final_response = Some(chunk);
                            break;
                        }
                    }
                    match final_response {
                        Some(response) => Ok(CallResult::Final(response)),
                        None => Err(AgentError::Internal(
                            "live connection closed before a final response".to_string(),
                        )),
                    }
                }
                Err(AgentError::Unsupported(_)) => {
                    self.drain_stream(agent, ctx, tx, cb_ctx, llm, request).await
                }
                Err(err) => Err(err),
            },
        }
    }

    async fn drain_stream(
        &self,
        agent: &Arc<LlmAgent>,
        ctx: &Arc<InvocationContext>,
        tx: &mpsc::Sender<Event>,
        cb_ctx: &CallbackContext,
        llm: &dyn crate::agentflow::model::Llm,
        request: &LlmRequest,
    ) -> Result<CallResult> {
        let mut stream = llm.generate_content_stream(request).await?;
        let mut final_response = None;
        while let Some(item) = stream.next().await {
            if ctx.is_cancelled() {
                return Ok(CallResult::Stopped);
            }
            let chunk = apply_after_model(agent, cb_ctx, item?);
            if chunk.partial {
                emit_partial(ctx, tx, agent, &chunk).await?;
            } else {
                final_response = Some(chunk);
            }
        }
        match final_response {
            Some(response) => Ok(CallResult::Final(response)),
            None => Err(AgentError::Internal(
                "model stream ended without a final response".to_string(),
            )),
        }
    }

    /// Copy the model response into an event, assign ids to id-less function
    /// calls, and compute the long-running id set.
    fn finalize_model_event(
        &self,
        agent: &Arc<LlmAgent>,
        ctx: &Arc<InvocationContext>,
        response: LlmResponse,
    ) -> Event {
        let mut event = Event::new(ctx.invocation_id(), agent.name())
            .with_branch(ctx.branch().map(|b| b.to_string()));
        event.content = response.content;
        event.partial = false;
        event.error_code = response.error_code;
        event.error_message = response.error_message;
        event.interrupted = if response.interrupted { Some(true) } else { None };

        if let Some(content) = &mut event.content {
            for part in &mut content.parts {
                if let Part::FunctionCall(call) = part {
                    if call.id.is_empty() {
                        call.id = Uuid::new_v4().to_string();
                    }
                }
            }
        }

        let long_running: Vec<String> = event
            .content
            .as_ref()
            .map(|content| {
                content
                    .function_calls()
                    .into_iter()
                    .filter(|call| {
                        agent
                            .tool(&call.name)
                            .map(|tool| tool.is_long_running())
                            .unwrap_or(false)
                    })
                    .map(|call| call.id.clone())
                    .collect()
            })
            .unwrap_or_default();
        event.long_running_tool_ids = long_running;
        event
    }
}

enum CallResult {
    Final(LlmResponse),
    Stopped,
}

fn apply_after_model(
    agent: &Arc<LlmAgent>,
    cb_ctx: &CallbackContext,
    response: LlmResponse,
) -> LlmResponse {
    match &agent.after_model_callback {
        Some(callback) => callback(cb_ctx, &response).unwrap_or(response),
        None => response,
    }
}

/// Record the event on the context, then hand it to the consumer. The send
/// blocks when the consumer is slow; that back-pressure is intentional.
async fn emit(
    ctx: &Arc<InvocationContext>,
    tx: &mpsc::Sender<Event>,
    event: Event,
) -> Result<Event> {
    ctx.push_event(event.clone()).await;
    tx.send(event.clone())
        .await
        .map_err(|_| AgentError::Internal("event channel closed".to_string()))?;
    Ok(event)
}

async fn emit_error(
    ctx: &Arc<InvocationContext>,
    tx: &mpsc::Sender<Event>,
    agent: &Arc<LlmAgent>,
    error: &AgentError,
) -> Result<Event> {
    let event = Event::error(ctx.invocation_id(), agent.name(), error)
        .with_branch(ctx.branch().map(|b| b.to_string()));
    emit(ctx, tx, event).await
}

async fn emit_partial(
    ctx: &Arc<InvocationContext>,
    tx: &mpsc::Sender<Event>,
    agent: &Arc<LlmAgent>,
    chunk: &LlmResponse,
) -> Result<()> {
    let mut event = Event::new(ctx.invocation_id(), agent.name())
        .with_branch(ctx.branch().map(|b| b.to_string()));
    event.content = chunk.content.clone();
    event.partial = true;
    emit(ctx, tx, event).await?;
    Ok(())
}

// ── Stock request processors ─────────────────────────────────────────────

/// Adds the planner's preamble to the system instruction.
struct PlanningRequestProcessor;

#[async_trait]
impl RequestProcessor for PlanningRequestProcessor {
    async fn process(
        &self,
        _ctx: &Arc<InvocationContext>,
        agent: &Arc<LlmAgent>,
        request: &mut LlmRequest,
    ) -> Result<Vec<Event>> {
        if let Some(planner) = agent.planner() {
            if let Some(preamble) = planner.build_planning_instruction(request) {
                request.append_system_instruction(&preamble);
            }
        }
        Ok(Vec::new())
    }
}

/// Adds the agent's own instruction.
struct InstructionsRequestProcessor;

#[async_trait]
impl RequestProcessor for InstructionsRequestProcessor {
    async fn process(
        &self,
        _ctx: &Arc<InvocationContext>,
        agent: &Arc<LlmAgent>,
        request: &mut LlmRequest,
    ) -> Result<Vec<Event>> {
        if let Some(instruction) = agent.instruction() {
            request.append_system_instruction(instruction);
        }
        Ok(Vec::new())
    }
}

/// Assembles the conversation history: the user turn, then every non-partial
/// event content in emission order.
struct ContentsRequestProcessor;

#[async_trait]
impl RequestProcessor for ContentsRequestProcessor {
    async fn process(
        &self,
        ctx: &Arc<InvocationContext>,
        _agent: &Arc<LlmAgent>,
        request: &mut LlmRequest,
    ) -> Result<Vec<Event>> {
        if let Some(user) = ctx.user_content() {
            let mut content = user.clone();
            content.role = Some(Role::User);
            request.contents.push(content);
        }
        for event in ctx.events().await {
            if event.partial {
                continue;
            }
            let content = match &event.content {
                Some(content) if !content.parts.is_empty() => content.clone(),
                _ => continue,
            };
            let mut content = content;
            if event.author == USER_AUTHOR {
                content.role = Some(Role::User);
            } else if content.role != Some(Role::Tool) {
                content.role = Some(Role::Model);
            }
            request.contents.push(content);
        }
        Ok(Vec::new())
    }
}

/// Lets every tool advertise itself on the request.
struct ToolsRequestProcessor;

#[async_trait]
impl RequestProcessor for ToolsRequestProcessor {
    async fn process(
        &self,
        _ctx: &Arc<InvocationContext>,
        agent: &Arc<LlmAgent>,
        request: &mut LlmRequest,
    ) -> Result<Vec<Event>> {
        for tool in agent.tools() {
            tool.process_llm_request(request).await?;
        }
        Ok(Vec::new())
    }
}

// ── Stock response processors ────────────────────────────────────────────

/// Applies the planner's response rewriting (thought tagging).
struct PlanningResponseProcessor;

#[async_trait]
impl ResponseProcessor for PlanningResponseProcessor {
    async fn process(
        &self,
        _ctx: &Arc<InvocationContext>,
        agent: &Arc<LlmAgent>,
        response: &mut LlmResponse,
    ) -> Result<()> {
        if let Some(planner) = agent.planner() {
            if let Some(content) = &mut response.content {
                let parts = std::mem::take(&mut content.parts);
                content.parts = planner.process_planning_response(parts);
            }
        }
        Ok(())
    }
}
