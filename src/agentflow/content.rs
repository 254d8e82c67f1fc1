//! Message content primitives.
//!
//! A [`Content`] is an ordered list of [`Part`]s plus an optional role. Parts
//! are a closed sum type: text, a function call, a function response, an
//! auth request, or an inline binary blob. Consumers match on the enum;
//! there is no key-sniffing anywhere in the crate.
//!
//! # Example
//!
//! ```rust
//! use agentflow::content::{Content, Part, Role};
//!
//! let content = Content::new(Role::User).with_text("add 2 and 3");
//! assert_eq!(content.text(), "add 2 and 3");
//! assert_eq!(content.parts.len(), 1);
//! ```

use crate::agentflow::auth::AuthConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role associated with a [`Content`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System priming, never produced by the model.
    System,
    /// End-user input.
    User,
    /// Assistant output when relayed verbatim from another runtime.
    Assistant,
    /// Model output produced inside this runtime.
    Model,
    /// Tool-result content fed back to the model.
    Tool,
}

/// A function call requested by the model.
///
/// `id` correlates the call with its eventual [`FunctionResponse`]. When the
/// model omits an id the flow assigns an opaque UUID before the event is
/// emitted; once assigned the id never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCall {
    /// Correlation id. Empty until the flow finalizes the event.
    #[serde(default)]
    pub id: String,
    /// Tool name, matched exactly against the running agent's tools.
    pub name: String,
    /// JSON arguments supplied by the model.
    #[serde(default)]
    pub args: Value,
}

impl FunctionCall {
    /// Build a call with no id; the flow assigns one at finalization.
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            args,
        }
    }
}

/// The result of executing a function call.
///
/// `id` MUST equal the id of an earlier [`FunctionCall`] within the same
/// invocation; the flow enforces this by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    /// JSON result payload. Tool failures are carried here as
    /// `{"error": "..."}` so the conversation continues.
    pub response: Value,
    /// Set when the tool needs end-user credentials before it can finish.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_request: Option<AuthConfig>,
}

/// An inline binary payload (image, audio frame, file chunk).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// One element of a [`Content`]. Exactly one payload per part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Part {
    /// Plain text. `thought` marks planner reasoning that must not be shown
    /// to the end user.
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        thought: bool,
    },
    FunctionCall(FunctionCall),
    FunctionResponse(FunctionResponse),
    AuthRequest(AuthConfig),
    InlineBlob(Blob),
}

impl Part {
    /// Convenience constructor for a non-thought text part.
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text {
            text: text.into(),
            thought: false,
        }
    }

    /// Convenience constructor for a thought-tagged text part.
    pub fn thought(text: impl Into<String>) -> Self {
        Part::Text {
            text: text.into(),
            thought: true,
        }
    }

    /// The text payload, if this is a text part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text, .. } => Some(text.as_str()),
            _ => None,
        }
    }

    /// True for text parts carrying the thought flag.
    pub fn is_thought(&self) -> bool {
        matches!(self, Part::Text { thought: true, .. })
    }
}

/// Ordered sequence of [`Part`]s. Order is preserved end-to-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn new(role: Role) -> Self {
        Self {
            role: Some(role),
            parts: Vec::new(),
        }
    }

    /// A content with no role, used for synthesized parts.
    pub fn anonymous() -> Self {
        Self {
            role: None,
            parts: Vec::new(),
        }
    }

    pub fn with_part(mut self, part: Part) -> Self {
        self.parts.push(part);
        self
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_part(Part::text(text))
    }

    /// Concatenation of all non-thought text parts, in order.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let Part::Text { text, thought } = part {
                if !*thought {
                    out.push_str(text);
                }
            }
        }
        out
    }

    /// All function calls in part order.
    pub fn function_calls(&self) -> Vec<&FunctionCall> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::FunctionCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    /// All function responses in part order.
    pub fn function_responses(&self) -> Vec<&FunctionResponse> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::FunctionResponse(resp) => Some(resp),
                _ => None,
            })
            .collect()
    }
}
