//! Per-invocation state.
//!
//! An [`InvocationContext`] is owned by the runner for the life of one user
//! turn. It carries the invocation id, run configuration, the running-agent
//! pointer, the accumulated event log, shared session state, the artifact
//! service handle, the live-request queue for bidi mode, the LLM-call
//! budget, and the cancellation signal.
//!
//! Composite agents derive branch-scoped children via
//! [`InvocationContext::child`]: children get a fresh event log and user
//! content but share the budget, session state, artifacts, and the cancel
//! signal with their parent, so resource limits hold across the whole tree.

use crate::agentflow::agent::Agent;
use crate::agentflow::artifact::ArtifactService;
use crate::agentflow::content::{Blob, Content};
use crate::agentflow::error::{AgentError, Result};
use crate::agentflow::event::Event;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

/// How responses are delivered to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingMode {
    /// One final response per model turn.
    None,
    /// Server-side streaming: partial events followed by a final one.
    Sse,
    /// Bidirectional: the caller feeds a live-request queue while reading
    /// events. Falls back to streaming when the model has no live endpoint.
    Bidi,
}

impl Default for StreamingMode {
    fn default() -> Self {
        StreamingMode::None
    }
}

/// Caller-supplied knobs for one invocation.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Upper bound on model calls per invocation. Values ≤ 0 disable
    /// enforcement (and log a warning at context creation).
    pub max_llm_calls: i64,
    pub streaming_mode: StreamingMode,
    /// Permit state mutation from tools while a turn is still streaming.
    pub allow_state_changes_on_streaming: bool,
    pub debug: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_llm_calls: 10,
            streaming_mode: StreamingMode::None,
            allow_state_changes_on_streaming: false,
            debug: false,
        }
    }
}

/// One item on the live-request queue.
#[derive(Debug, Clone)]
pub enum LiveRequest {
    Content(Content),
    Blob(Blob),
    Close,
}

/// Bounded FIFO feeding a bidi invocation. Capacity 100.
pub struct LiveRequestQueue {
    tx: mpsc::Sender<LiveRequest>,
    rx: Mutex<mpsc::Receiver<LiveRequest>>,
    closed: AtomicBool,
}

impl LiveRequestQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(100);
        Self {
            tx,
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn send_content(&self, content: Content) -> Result<()> {
        self.tx
            .send(LiveRequest::Content(content))
            .await
            .map_err(|_| AgentError::Internal("live request queue closed".to_string()))
    }

    pub async fn send_blob(&self, blob: Blob) -> Result<()> {
        self.tx
            .send(LiveRequest::Blob(blob))
            .await
            .map_err(|_| AgentError::Internal("live request queue closed".to_string()))
    }

    /// Shut the queue down. Idempotent.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(LiveRequest::Close).await;
        }
    }

    /// Receive the next request; `None` once the queue is closed and
    /// drained.
    pub async fn recv(&self) -> Option<LiveRequest> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(LiveRequest::Close) | None => None,
            Some(request) => Some(request),
        }
    }
}

impl Default for LiveRequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative cancellation for one invocation; clones observe one signal.
#[derive(Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Suspend until cancellation.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// `(app, user, session)` identity of the conversation being served.
#[derive(Debug, Clone)]
pub struct SessionKey {
    pub app: String,
    pub user: String,
    pub session: String,
}

impl Default for SessionKey {
    fn default() -> Self {
        Self {
            app: "agentflow".to_string(),
            user: "default-user".to_string(),
            session: Uuid::new_v4().to_string(),
        }
    }
}

struct LlmCallBudget {
    count: AtomicI64,
    max: i64,
}

/// State owned by the runner for the life of one user turn.
pub struct InvocationContext {
    invocation_id: String,
    branch: Option<String>,
    run_config: RunConfig,
    session: SessionKey,
    user_content: Option<Content>,
    agent: StdRwLock<Option<Arc<dyn Agent>>>,
    events: Mutex<Vec<Event>>,
    state: Arc<Mutex<HashMap<String, Value>>>,
    artifacts: Option<Arc<dyn ArtifactService>>,
    live_requests: Arc<LiveRequestQueue>,
    active_streaming_tools: Mutex<HashMap<String, Arc<LiveRequestQueue>>>,
    budget: Arc<LlmCallBudget>,
    end_invocation: Arc<AtomicBool>,
    cancel: CancelSignal,
}

impl InvocationContext {
    /// Fresh context for one user turn.
    pub fn new(user_content: Option<Content>, run_config: RunConfig) -> Self {
        if run_config.max_llm_calls <= 0 {
            log::warn!(
                "max_llm_calls={} disables the LLM-call budget; runaway loops will not be stopped",
                run_config.max_llm_calls
            );
        }
        let max = run_config.max_llm_calls;
        Self {
            invocation_id: format!("inv-{}", Uuid::new_v4()),
            branch: None,
            run_config,
            session: SessionKey::default(),
            user_content,
            agent: StdRwLock::new(None),
            events: Mutex::new(Vec::new()),
            state: Arc::new(Mutex::new(HashMap::new())),
            artifacts: None,
            live_requests: Arc::new(LiveRequestQueue::new()),
            active_streaming_tools: Mutex::new(HashMap::new()),
            budget: Arc::new(LlmCallBudget {
                count: AtomicI64::new(0),
                max,
            }),
            end_invocation: Arc::new(AtomicBool::new(false)),
            cancel: CancelSignal::new(),
        }
    }

    pub fn with_session(mut self, session: SessionKey) -> Self {
        self.session = session;
        self
    }

    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactService>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Derive a branch-scoped child for a sub-agent run. The child shares
    /// budget, state, artifacts, and cancellation with its parent but owns
    /// its event log and user content.
    pub fn child(
        self: &Arc<Self>,
        agent: Arc<dyn Agent>,
        user_content: Option<Content>,
    ) -> Arc<InvocationContext> {
        let branch = match &self.branch {
            Some(parent) => format!("{}.{}", parent, agent.name()),
            None => agent.name().to_string(),
        };
        Arc::new(InvocationContext {
            invocation_id: self.invocation_id.clone(),
            branch: Some(branch),
            run_config: self.run_config.clone(),
            session: self.session.clone(),
            user_content,
            agent: StdRwLock::new(Some(agent)),
            events: Mutex::new(Vec::new()),
            state: self.state.clone(),
            artifacts: self.artifacts.clone(),
            live_requests: self.live_requests.clone(),
            active_streaming_tools: Mutex::new(HashMap::new()),
            budget: self.budget.clone(),
            end_invocation: self.end_invocation.clone(),
            cancel: self.cancel.clone(),
        })
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run_config
    }

    pub fn session(&self) -> &SessionKey {
        &self.session
    }

    pub fn user_content(&self) -> Option<&Content> {
        self.user_content.as_ref()
    }

    pub fn artifacts(&self) -> Option<Arc<dyn ArtifactService>> {
        self.artifacts.clone()
    }

    pub fn live_requests(&self) -> &Arc<LiveRequestQueue> {
        &self.live_requests
    }

    /// The agent currently driving this invocation; updated on transfer.
    pub fn agent(&self) -> Option<Arc<dyn Agent>> {
        match self.agent.read() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        }
    }

    pub fn set_agent(&self, agent: Arc<dyn Agent>) {
        if let Ok(mut guard) = self.agent.write() {
            *guard = Some(agent);
        }
    }

    /// Snapshot of the event log for this branch.
    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// Append an event to this branch's log. The flow calls this for every
    /// event it emits.
    pub async fn push_event(&self, event: Event) {
        self.events.lock().await.push(event);
    }

    /// Host-side injection: used to resume long-running tools by appending
    /// their function responses as prior history.
    pub async fn inject_event(&self, event: Event) {
        self.push_event(event).await;
    }

    /// Count one model call against the budget. The stored count never
    /// exceeds the budget, even under concurrent increments.
    pub fn increment_llm_call_count(&self) -> Result<i64> {
        let mut current = self.budget.count.load(Ordering::SeqCst);
        loop {
            let next = current + 1;
            if self.budget.max > 0 && next > self.budget.max {
                return Err(AgentError::ResourceExhausted(format!(
                    "LLM call budget of {} exceeded",
                    self.budget.max
                )));
            }
            match self.budget.count.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(next),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn llm_call_count(&self) -> i64 {
        self.budget.count.load(Ordering::SeqCst)
    }

    /// Ask the flow to stop before the next model call.
    pub fn end_invocation(&self) {
        self.end_invocation.store(true, Ordering::SeqCst);
    }

    pub fn ended(&self) -> bool {
        self.end_invocation.load(Ordering::SeqCst)
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn state_get(&self, key: &str) -> Option<Value> {
        self.state.lock().await.get(key).cloned()
    }

    pub async fn state_set(&self, key: String, value: Value) {
        self.state.lock().await.insert(key, value);
    }

    pub async fn state_all(&self) -> HashMap<String, Value> {
        self.state.lock().await.clone()
    }

    /// Register a streaming tool's input queue by tool name.
    pub async fn add_streaming_tool(&self, name: String, queue: Arc<LiveRequestQueue>) {
        self.active_streaming_tools.lock().await.insert(name, queue);
    }

    pub async fn remove_streaming_tool(&self, name: &str) -> Option<Arc<LiveRequestQueue>> {
        self.active_streaming_tools.lock().await.remove(name)
    }

    pub async fn streaming_tool(&self, name: &str) -> Option<Arc<LiveRequestQueue>> {
        self.active_streaming_tools.lock().await.get(name).cloned()
    }

    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        Self::new(None, RunConfig::default())
    }
}
