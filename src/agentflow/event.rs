//! Event model.
//!
//! An [`Event`] is the atomic unit of observable progress for a caller: one
//! model response, one batch of function responses, one error, one transfer.
//! Events flow through a single-producer channel per invocation and are
//! immutable once emitted.
//!
//! Side effects ride on [`EventActions`]: session-state deltas, artifact
//! version deltas, agent transfer, loop escalation, and pending credential
//! requests. Actions merge with last-writer-wins semantics for scalars and
//! union semantics for maps.
//!
//! # Event flow for one model turn
//!
//! ```text
//! (partial content events, streaming only)
//! model event            - content, maybe FunctionCall parts
//!   └─ function-response event - one FunctionResponse part per call, in order
//!       └─ (transfer: events authored by the target agent)
//! ```

use crate::agentflow::auth::AuthConfig;
use crate::agentflow::content::{Content, FunctionCall, FunctionResponse};
use crate::agentflow::error::AgentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Side-effectful metadata attached to an [`Event`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventActions {
    /// Tool result should be surfaced verbatim, without a summarization turn.
    #[serde(default)]
    pub skip_summarization: bool,
    /// Session-state writes performed while producing this event.
    #[serde(default)]
    pub state_delta: HashMap<String, Value>,
    /// Artifact filename → version saved while producing this event.
    #[serde(default)]
    pub artifact_delta: HashMap<String, u64>,
    /// Routes the remainder of the invocation to the named agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_to_agent: Option<String>,
    /// Terminates the enclosing loop agent early.
    #[serde(default)]
    pub escalate: bool,
    /// function-call id → credential request raised by a tool.
    #[serde(default)]
    pub requested_auth_configs: HashMap<String, AuthConfig>,
}

impl EventActions {
    /// Merge `other` into `self`: last writer wins for scalars, maps union.
    pub fn merge(&mut self, other: EventActions) {
        self.skip_summarization = self.skip_summarization || other.skip_summarization;
        self.state_delta.extend(other.state_delta);
        self.artifact_delta.extend(other.artifact_delta);
        if other.transfer_to_agent.is_some() {
            self.transfer_to_agent = other.transfer_to_agent;
        }
        self.escalate = self.escalate || other.escalate;
        self.requested_auth_configs
            .extend(other.requested_auth_configs);
    }

    /// True when no field deviates from the default.
    pub fn is_empty(&self) -> bool {
        *self == EventActions::default()
    }
}

/// The atomic unit of observable progress for one invocation.
///
/// `id` is locally unique; emission order within an invocation is the
/// authoritative ordering. Serialized with camelCase keys on every transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub invocation_id: String,
    /// Agent name, or the reserved author `"user"` for injected user turns.
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    /// True for intermediate streaming chunks.
    #[serde(default)]
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupted: Option<bool>,
    /// Ids of function calls whose tools are long-running; the flow does not
    /// auto-execute these.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub long_running_tool_ids: Vec<String>,
    #[serde(default)]
    pub actions: EventActions,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// New empty event for the given invocation and author.
    pub fn new(invocation_id: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            invocation_id: invocation_id.into(),
            author: author.into(),
            branch: None,
            content: None,
            partial: false,
            error_code: None,
            error_message: None,
            interrupted: None,
            long_running_tool_ids: Vec::new(),
            actions: EventActions::default(),
            timestamp: Utc::now(),
        }
    }

    /// Terminal error event carrying the error's code and message.
    pub fn error(
        invocation_id: impl Into<String>,
        author: impl Into<String>,
        error: &AgentError,
    ) -> Self {
        let mut event = Event::new(invocation_id, author);
        event.error_code = Some(error.code().to_string());
        event.error_message = Some(error.to_string());
        event
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_branch(mut self, branch: Option<String>) -> Self {
        self.branch = branch;
        self
    }

    /// Final iff it carries an error, requests a transfer, or carries
    /// non-partial content. Consumers may stop reading after a final event.
    pub fn is_final_response(&self) -> bool {
        self.error_code.is_some()
            || self.actions.transfer_to_agent.is_some()
            || (self.content.is_some() && !self.partial)
    }

    /// Function calls in this event's content, preserving part order.
    pub fn function_calls(&self) -> Vec<&FunctionCall> {
        match &self.content {
            Some(content) => content.function_calls(),
            None => Vec::new(),
        }
    }

    /// Function responses in this event's content, preserving part order.
    pub fn function_responses(&self) -> Vec<&FunctionResponse> {
        match &self.content {
            Some(content) => content.function_responses(),
            None => Vec::new(),
        }
    }
}
