//! Provider-agnostic model interface.
//!
//! The flow talks to language models through the [`Llm`] trait: a
//! request/response call, a streaming variant yielding partial chunks, and an
//! optional bidirectional connection. Concrete backends translate
//! [`LlmRequest`] into their wire format and answer with [`LlmResponse`]s in
//! a uniform shape.
//!
//! Model names resolve to backends through the [`LlmRegistry`]: an ordered
//! list of compiled patterns where the first hit wins and resolved handles
//! are memoized. A process-wide registry pre-registers the Gemini backend
//! for `gemini-*` names; tests build their own registries.

use crate::agentflow::content::Content;
use crate::agentflow::error::{AgentError, Result};
use async_trait::async_trait;
use futures_util::stream::Stream;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// One tool advertised to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    /// JSON Schema of the accepted arguments.
    pub parameters: Option<serde_json::Value>,
}

/// A single request to a model backend.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    /// Model identifier, e.g. `"gemini-2.0-flash"`.
    pub model: String,
    pub system_instruction: Option<String>,
    /// Conversation history, oldest first.
    pub contents: Vec<Content>,
    /// Function declarations for tools the model may call.
    pub tools: Vec<FunctionDeclaration>,
    /// Names of model-side tools (search, code execution) to enable.
    pub builtin_tools: Vec<String>,
}

impl LlmRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Append a paragraph to the system instruction.
    pub fn append_system_instruction(&mut self, text: &str) {
        match &mut self.system_instruction {
            Some(existing) => {
                existing.push_str("\n\n");
                existing.push_str(text);
            }
            None => self.system_instruction = Some(text.to_string()),
        }
    }

    /// Declare a callable function, replacing any declaration with the same
    /// name.
    pub fn add_function_declaration(&mut self, declaration: FunctionDeclaration) {
        self.tools.retain(|t| t.name != declaration.name);
        self.tools.push(declaration);
    }

    /// Enable a model-side built-in tool.
    pub fn add_builtin_tool(&mut self, name: &str) {
        if !self.builtin_tools.iter().any(|t| t == name) {
            self.builtin_tools.push(name.to_string());
        }
    }
}

/// Token accounting reported by a backend, when available.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

/// One model answer: either a streaming chunk (`partial == true`) or the
/// final response of a turn.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: Option<Content>,
    /// True on intermediate streaming chunks; the last chunk is non-partial.
    pub partial: bool,
    /// Set by live backends when the model was cut off mid-generation.
    pub interrupted: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl LlmResponse {
    pub fn with_content(content: Content) -> Self {
        Self {
            content: Some(content),
            ..Default::default()
        }
    }
}

/// Lazy sequence of responses from a streaming call.
pub type LlmResponseStream = Pin<Box<dyn Stream<Item = Result<LlmResponse>> + Send>>;

/// Bidirectional session with a live-capable model.
pub struct LlmConnection {
    /// Caller-to-model content (text or realtime blobs, pre-encoded).
    pub to_model: mpsc::Sender<Content>,
    /// Model-to-caller responses.
    pub from_model: mpsc::Receiver<LlmResponse>,
}

/// A concrete model backend.
#[async_trait]
pub trait Llm: Send + Sync {
    /// Identifier this instance serves, e.g. `"gemini-2.0-flash"`.
    fn model_name(&self) -> &str;

    /// Single request/response exchange.
    async fn generate_content(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Streaming exchange. The default wraps [`Llm::generate_content`] into
    /// a one-element stream, which keeps non-streaming backends usable under
    /// streaming run configs.
    async fn generate_content_stream(&self, request: &LlmRequest) -> Result<LlmResponseStream> {
        let response = self.generate_content(request).await?;
        Ok(Box::pin(futures_util::stream::iter(vec![Ok(response)])))
    }

    /// Open a bidirectional session. Backends without a live endpoint keep
    /// the default, and live mode falls back to streaming.
    async fn connect(&self, _request: &LlmRequest) -> Result<LlmConnection> {
        Err(AgentError::Unsupported(format!(
            "model '{}' does not support live connections",
            self.model_name()
        )))
    }
}

/// Factory invoked with the concrete model name on first resolution.
pub type LlmFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn Llm>> + Send + Sync>;

/// Pattern-based model resolver. First matching pattern wins; resolved
/// backends are memoized per concrete name.
pub struct LlmRegistry {
    entries: Vec<(Regex, LlmFactory)>,
    resolved: HashMap<String, Arc<dyn Llm>>,
}

impl LlmRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            resolved: HashMap::new(),
        }
    }

    /// Register a backend factory for all names matching `pattern`.
    pub fn register(&mut self, pattern: &str, factory: LlmFactory) -> Result<()> {
        let compiled = Regex::new(pattern)
            .map_err(|e| AgentError::InvalidArgument(format!("bad model pattern: {}", e)))?;
        self.entries.push((compiled, factory));
        Ok(())
    }

    /// Resolve a model name to a backend.
    pub fn resolve(&mut self, model: &str) -> Result<Arc<dyn Llm>> {
        if let Some(hit) = self.resolved.get(model) {
            return Ok(hit.clone());
        }
        for (pattern, factory) in &self.entries {
            if pattern.is_match(model) {
                let backend = factory(model)?;
                self.resolved.insert(model.to_string(), backend.clone());
                return Ok(backend);
            }
        }
        Err(AgentError::NotFound(format!(
            "no backend registered for model '{}'",
            model
        )))
    }
}

impl Default for LlmRegistry {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref GLOBAL_REGISTRY: Mutex<LlmRegistry> = {
        let mut registry = LlmRegistry::new();
        // Gemini is the stock backend; resolution fails cleanly without a key.
        let result = registry.register(
            "^gemini-",
            Arc::new(|model| {
                let backend = crate::agentflow::models::gemini::GeminiLlm::from_env(model)?;
                Ok(Arc::new(backend) as Arc<dyn Llm>)
            }),
        );
        if let Err(err) = result {
            log::error!("failed to register default gemini backend: {}", err);
        }
        Mutex::new(registry)
    };
}

/// Register a backend in the process-wide registry.
pub fn register_llm(pattern: &str, factory: LlmFactory) -> Result<()> {
    let mut registry = GLOBAL_REGISTRY
        .lock()
        .map_err(|_| AgentError::Internal("model registry lock poisoned".to_string()))?;
    registry.register(pattern, factory)
}

/// Resolve a model name through the process-wide registry.
pub fn resolve_llm(model: &str) -> Result<Arc<dyn Llm>> {
    let mut registry = GLOBAL_REGISTRY
        .lock()
        .map_err(|_| AgentError::Internal("model registry lock poisoned".to_string()))?;
    registry.resolve(model)
}
