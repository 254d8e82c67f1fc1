use agentflow::agentflow::error::Result;
use agentflow::agentflow::model::{Llm, LlmRequest, LlmResponse};
use agentflow::content::FunctionCall;
use agentflow::tool::FunctionTool;
use agentflow::{AgentError, Content, Part, Role, RunConfig, Runner};
use agentflow::{Agent, LlmAgent};
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

/// Plays back a fixed sequence of responses, one per model call.
struct ScriptedLlm {
    responses: Mutex<VecDeque<LlmResponse>>,
}

impl ScriptedLlm {
    fn new(responses: Vec<LlmResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
        })
    }
}

#[async_trait]
impl Llm for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate_content(&self, _request: &LlmRequest) -> Result<LlmResponse> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AgentError::Unavailable("script exhausted".to_string()))
    }
}

fn text_response(text: &str) -> LlmResponse {
    LlmResponse::with_content(Content::new(Role::Model).with_text(text))
}

fn call_response(name: &str, args: serde_json::Value) -> LlmResponse {
    LlmResponse::with_content(
        Content::new(Role::Model).with_part(Part::FunctionCall(FunctionCall::new(name, args))),
    )
}

fn add_tool() -> Arc<FunctionTool> {
    Arc::new(
        FunctionTool::new(
            "add",
            "Adds two integers",
            Arc::new(|args| {
                let a = args["a"].as_i64().unwrap_or(0);
                let b = args["b"].as_i64().unwrap_or(0);
                Ok(json!(a + b))
            }),
        )
        .with_parameters(json!({
            "type": "object",
            "properties": {
                "a": {"type": "integer"},
                "b": {"type": "integer"}
            },
            "required": ["a", "b"]
        })),
    )
}

// A single model turn with no tools: one final event, no partials, one call
// against the budget.
#[tokio::test]
async fn test_plain_turn_is_one_final_event() {
    let _ = env_logger::builder().is_test(true).try_init();
    let agent: Arc<dyn Agent> = LlmAgent::builder("greeter")
        .model_handle(ScriptedLlm::new(vec![text_response("Hello")]))
        .build()
        .unwrap();

    let runner = Runner::new("app").with_run_config(RunConfig {
        max_llm_calls: 1,
        ..Default::default()
    });
    let (ctx, mut stream) = runner.start(&agent, Content::new(Role::User).with_text("hi"));

    let mut events = Vec::new();
    while let Some(event) = stream.recv().await {
        events.push(event);
    }

    assert_eq!(events.len(), 1);
    assert!(events[0].is_final_response());
    assert!(!events[0].partial);
    assert_eq!(events[0].content.as_ref().unwrap().text(), "Hello");
    assert_eq!(ctx.llm_call_count(), 1);
}

// Function-call dispatch: the model asks for `add`, the core executes it and
// answers with a matching-id response, and the follow-up turn finishes.
#[tokio::test]
async fn test_tool_dispatch_round_trip() {
    let agent: Arc<dyn Agent> = LlmAgent::builder("calculator")
        .model_handle(ScriptedLlm::new(vec![
            call_response("add", json!({"a": 2, "b": 3})),
            text_response("5"),
        ]))
        .tool(add_tool())
        .build()
        .unwrap();

    let runner = Runner::new("app");
    let (_ctx, mut stream) = runner.start(&agent, Content::new(Role::User).with_text("add 2 and 3"));

    let mut events = Vec::new();
    while let Some(event) = stream.recv().await {
        events.push(event);
    }

    assert_eq!(events.len(), 3);

    let calls = events[0].function_calls();
    assert_eq!(calls.len(), 1);
    let call_id = calls[0].id.clone();
    assert!(!call_id.is_empty(), "the core must assign missing call ids");

    let responses = events[1].function_responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].id, call_id);
    assert_eq!(responses[0].name, "add");
    assert_eq!(responses[0].response, json!(5));

    assert_eq!(events[2].content.as_ref().unwrap().text(), "5");
}

// Every function response must match an earlier call with the same id and
// name, across a multi-tool conversation.
#[tokio::test]
async fn test_call_response_ids_always_match() {
    let agent: Arc<dyn Agent> = LlmAgent::builder("worker")
        .model_handle(ScriptedLlm::new(vec![
            call_response("add", json!({"a": 1, "b": 1})),
            call_response("add", json!({"a": 2, "b": 2})),
            text_response("done"),
        ]))
        .tool(add_tool())
        .build()
        .unwrap();

    let runner = Runner::new("app");
    let (_ctx, mut stream) = runner.start(&agent, Content::new(Role::User).with_text("go"));

    let mut events = Vec::new();
    while let Some(event) = stream.recv().await {
        events.push(event);
    }

    let mut seen_calls: Vec<(String, String)> = Vec::new();
    for event in &events {
        for call in event.function_calls() {
            seen_calls.push((call.id.clone(), call.name.clone()));
        }
        for response in event.function_responses() {
            assert!(
                seen_calls
                    .iter()
                    .any(|(id, name)| id == &response.id && name == &response.name),
                "response {} has no earlier matching call",
                response.id
            );
        }
    }
}

// A missing tool is recovered into an error-shaped response; the flow
// continues to the next turn instead of aborting.
#[tokio::test]
async fn test_missing_tool_is_recovered() {
    let agent: Arc<dyn Agent> = LlmAgent::builder("confused")
        .model_handle(ScriptedLlm::new(vec![
            call_response("no_such_tool", json!({})),
            text_response("recovered"),
        ]))
        .build()
        .unwrap();

    let runner = Runner::new("app");
    let response = runner.run(&agent, "hi").await.unwrap();
    assert_eq!(response, "recovered");
}

#[tokio::test]
async fn test_failing_tool_is_recovered() {
    let boom: Arc<FunctionTool> = Arc::new(FunctionTool::new(
        "boom",
        "Always fails",
        Arc::new(|_args| Err(AgentError::Internal("kaput".to_string()))),
    ));
    let agent: Arc<dyn Agent> = LlmAgent::builder("fragile")
        .model_handle(ScriptedLlm::new(vec![
            call_response("boom", json!({})),
            text_response("still standing"),
        ]))
        .tool(boom)
        .build()
        .unwrap();

    let runner = Runner::new("app");
    let (_ctx, mut stream) = runner.start(&agent, Content::new(Role::User).with_text("go"));

    let mut events = Vec::new();
    while let Some(event) = stream.recv().await {
        events.push(event);
    }
    let error_response = &events[1].function_responses()[0].response;
    assert!(error_response["error"].as_str().unwrap().contains("kaput"));
    assert_eq!(events[2].content.as_ref().unwrap().text(), "still standing");
}

// Long-running suspension: the model event carries the call id, dispatch is
// skipped, and after the host injects the response the next run finishes.
#[tokio::test]
async fn test_long_running_tool_suspends_and_resumes() {
    let submit: Arc<FunctionTool> = Arc::new(
        FunctionTool::new(
            "submit",
            "Submits a batch job",
            Arc::new(|_args| Ok(json!({"status": "queued"}))),
        )
        .long_running(),
    );
    let agent: Arc<dyn Agent> = LlmAgent::builder("batcher")
        .model_handle(ScriptedLlm::new(vec![
            call_response("submit", json!({"job_id": "j-1"})),
            text_response("ok"),
        ]))
        .tool(submit)
        .build()
        .unwrap();

    let runner = Runner::new("app");
    let (ctx, mut stream) = runner.start(&agent, Content::new(Role::User).with_text("submit it"));

    let mut events = Vec::new();
    while let Some(event) = stream.recv().await {
        events.push(event);
    }

    // Suspended: only the model event, with the long-running id recorded.
    assert_eq!(events.len(), 1);
    let call_id = events[0].function_calls()[0].id.clone();
    assert_eq!(events[0].long_running_tool_ids, vec![call_id.clone()]);

    // Host injects the tool's eventual response, then resumes.
    let mut injected = agentflow::Event::new(ctx.invocation_id(), "user");
    injected.content = Some(Content {
        role: Some(Role::Tool),
        parts: vec![Part::FunctionResponse(
            agentflow::agentflow::content::FunctionResponse {
                id: call_id,
                name: "submit".to_string(),
                response: json!("DONE"),
                auth_request: None,
            },
        )],
    });
    ctx.inject_event(injected).await;

    let mut resumed = runner.resume(&agent, &ctx);
    let mut final_text = String::new();
    while let Some(event) = resumed.recv().await {
        if event.is_final_response() {
            if let Some(content) = &event.content {
                final_text = content.text();
            }
        }
    }
    assert_eq!(final_text, "ok");
}

// Transfer: the routing agent's function-response event carries the target,
// then every further event is authored by the target.
#[tokio::test]
async fn test_transfer_routes_to_sibling() {
    let spec: Arc<dyn Agent> = LlmAgent::builder("spec")
        .description("Handles spec questions")
        .model_handle(ScriptedLlm::new(vec![text_response("spec says hi")]))
        .build()
        .unwrap();
    let root: Arc<dyn Agent> = LlmAgent::builder("root")
        .model_handle(ScriptedLlm::new(vec![call_response(
            "transfer_to_agent",
            json!({"agent_name": "spec"}),
        )]))
        .sub_agent(spec)
        .build()
        .unwrap();

    let runner = Runner::new("app");
    let (_ctx, mut stream) = runner.start(&root, Content::new(Role::User).with_text("ask spec"));

    let mut events = Vec::new();
    while let Some(event) = stream.recv().await {
        events.push(event);
    }

    let transfer_index = events
        .iter()
        .position(|e| e.actions.transfer_to_agent.as_deref() == Some("spec"))
        .expect("transfer event missing");
    assert_eq!(events[transfer_index].author, "root");

    // Post-transfer quiescence: nothing more from the pre-transfer agent.
    let tail = &events[transfer_index + 1..];
    assert!(!tail.is_empty());
    assert!(tail.iter().all(|e| e.author == "spec"));
    assert_eq!(
        tail.last().unwrap().content.as_ref().unwrap().text(),
        "spec says hi"
    );
}

#[tokio::test]
async fn test_transfer_to_unknown_agent_is_fatal() {
    let root: Arc<dyn Agent> = LlmAgent::builder("root")
        .model_handle(ScriptedLlm::new(vec![call_response(
            "transfer_to_agent",
            json!({"agent_name": "ghost"}),
        )]))
        .sub_agent(
            LlmAgent::builder("real")
                .model_handle(ScriptedLlm::new(vec![]))
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let runner = Runner::new("app");
    let err = runner.run(&root, "go").await.unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

// Budget exhaustion: a model that keeps asking for tools runs out of calls
// and the invocation ends with a ResourceExhausted error event.
#[tokio::test]
async fn test_budget_exhaustion_terminates_with_error() {
    let agent: Arc<dyn Agent> = LlmAgent::builder("greedy")
        .model_handle(ScriptedLlm::new(vec![
            call_response("add", json!({"a": 1, "b": 1})),
            call_response("add", json!({"a": 2, "b": 2})),
            call_response("add", json!({"a": 3, "b": 3})),
        ]))
        .tool(add_tool())
        .build()
        .unwrap();

    let runner = Runner::new("app").with_run_config(RunConfig {
        max_llm_calls: 2,
        ..Default::default()
    });
    let (ctx, mut stream) = runner.start(&agent, Content::new(Role::User).with_text("loop"));

    let mut events = Vec::new();
    while let Some(event) = stream.recv().await {
        events.push(event);
    }

    let model_events = events
        .iter()
        .filter(|e| !e.function_calls().is_empty())
        .count();
    assert_eq!(model_events, 2);

    let last = events.last().unwrap();
    assert_eq!(last.error_code.as_deref(), Some("RESOURCE_EXHAUSTED"));
    assert_eq!(ctx.llm_call_count(), 2);
}

#[tokio::test]
async fn test_model_failure_is_terminal() {
    let agent: Arc<dyn Agent> = LlmAgent::builder("doomed")
        .model_handle(ScriptedLlm::new(vec![]))
        .build()
        .unwrap();

    let runner = Runner::new("app");
    let err = runner.run(&agent, "hi").await.unwrap_err();
    assert_eq!(err.code(), "UNAVAILABLE");
}

// before_model_callback short-circuits the model without spending budget;
// after_model_callback rewrites responses, and None keeps them unchanged.
#[tokio::test]
async fn test_model_callbacks() {
    let agent: Arc<dyn Agent> = LlmAgent::builder("canned")
        .model_handle(ScriptedLlm::new(vec![]))
        .before_model_callback(Arc::new(|_ctx, _request| {
            Some(LlmResponse::with_content(
                Content::new(Role::Model).with_text("from callback"),
            ))
        }))
        .build()
        .unwrap();

    let runner = Runner::new("app");
    let (ctx, mut stream) = runner.start(&agent, Content::new(Role::User).with_text("hi"));
    let mut last_text = String::new();
    while let Some(event) = stream.recv().await {
        if let Some(content) = &event.content {
            last_text = content.text();
        }
    }
    assert_eq!(last_text, "from callback");
    assert_eq!(ctx.llm_call_count(), 0, "callback responses are free");

    let rewriter: Arc<dyn Agent> = LlmAgent::builder("rewriter")
        .model_handle(ScriptedLlm::new(vec![text_response("raw")]))
        .after_model_callback(Arc::new(|_ctx, response| {
            let text = response
                .content
                .as_ref()
                .map(|c| c.text())
                .unwrap_or_default();
            Some(LlmResponse::with_content(
                Content::new(Role::Model).with_text(format!("[{}]", text)),
            ))
        }))
        .build()
        .unwrap();
    let response = Runner::new("app").run(&rewriter, "hi").await.unwrap();
    assert_eq!(response, "[raw]");
}

#[tokio::test]
async fn test_before_agent_callback_skips_model() {
    let agent: Arc<dyn Agent> = LlmAgent::builder("skipped")
        .model_handle(ScriptedLlm::new(vec![]))
        .before_agent_callback(Arc::new(|_ctx| {
            Some(Content::new(Role::Model).with_text("short-circuited"))
        }))
        .build()
        .unwrap();

    let response = Runner::new("app").run(&agent, "hi").await.unwrap();
    assert_eq!(response, "short-circuited");
}

#[tokio::test]
async fn test_after_agent_callback_post_transforms() {
    let agent: Arc<dyn Agent> = LlmAgent::builder("suffixed")
        .model_handle(ScriptedLlm::new(vec![text_response("answer")]))
        .after_agent_callback(Arc::new(|_ctx, content| {
            Some(Content::new(Role::Model).with_text(format!("{} (reviewed)", content.text())))
        }))
        .build()
        .unwrap();

    let response = Runner::new("app").run(&agent, "hi").await.unwrap();
    assert_eq!(response, "answer (reviewed)");
}

/// Answers the first call, then hangs forever, like a stuck model.
struct HangAfterFirst {
    first: Mutex<Option<LlmResponse>>,
}

#[async_trait]
impl Llm for HangAfterFirst {
    fn model_name(&self) -> &str {
        "hanging"
    }

    async fn generate_content(&self, _request: &LlmRequest) -> Result<LlmResponse> {
        let first = self.first.lock().unwrap().take();
        match first {
            Some(response) => Ok(response),
            None => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

// Cancellation stops the producer: the in-flight model call is abandoned,
// no further events are emitted, and the stream closes.
#[tokio::test]
async fn test_cancellation_stops_the_stream() {
    let agent: Arc<dyn Agent> = LlmAgent::builder("cancelled")
        .model_handle(Arc::new(HangAfterFirst {
            first: Mutex::new(Some(call_response("add", json!({"a": 1, "b": 1})))),
        }))
        .tool(add_tool())
        .build()
        .unwrap();

    let runner = Runner::new("app");
    let (ctx, mut stream) = runner.start(&agent, Content::new(Role::User).with_text("go"));

    // Read the first model event and its function response, then cancel
    // while the second model call is stuck.
    let first = stream.recv().await.unwrap();
    assert_eq!(first.function_calls().len(), 1);
    let second = stream.recv().await.unwrap();
    assert_eq!(second.function_responses().len(), 1);

    ctx.cancel();
    assert!(stream.recv().await.is_none(), "no events after cancel");
}
