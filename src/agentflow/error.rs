//! Error taxonomy shared by every AgentFlow component.
//!
//! The runtime distinguishes recoverable tool failures (which become error
//! function-responses and never abort an invocation) from terminal failures
//! (which surface as a final error event). All public APIs return
//! [`AgentError`]; the variant selects the behaviour, the payload carries the
//! human-readable detail.

use std::error::Error;
use std::fmt;

/// Error kinds for agent, flow, model, and storage operations.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentError {
    /// A caller-supplied value failed validation (bad schema, malformed JSON
    /// arguments, empty model name, ...).
    InvalidArgument(String),
    /// A named entity (agent, tool, artifact, model pattern) does not exist.
    NotFound(String),
    /// A sub-agent already belongs to a different parent, or an agent name
    /// collides with one elsewhere in the tree.
    HierarchyConflict(String),
    /// The LLM-call budget for the invocation is spent.
    ResourceExhausted(String),
    /// The model or a backing service could not be reached or answered with a
    /// transport-level failure.
    Unavailable(String),
    /// The invocation was cancelled through its context.
    Cancelled,
    /// An internal invariant broke (channel closed early, poisoned lock, ...).
    Internal(String),
    /// The operation is not supported by this backend (e.g. live connect on a
    /// model without a bidi endpoint).
    Unsupported(String),
}

impl AgentError {
    /// Stable machine-readable code, used as `Event.error_code`.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::InvalidArgument(_) => "INVALID_ARGUMENT",
            AgentError::NotFound(_) => "NOT_FOUND",
            AgentError::HierarchyConflict(_) => "HIERARCHY_CONFLICT",
            AgentError::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            AgentError::Unavailable(_) => "UNAVAILABLE",
            AgentError::Cancelled => "CANCELLED",
            AgentError::Internal(_) => "INTERNAL",
            AgentError::Unsupported(_) => "UNSUPPORTED",
        }
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            AgentError::NotFound(msg) => write!(f, "not found: {}", msg),
            AgentError::HierarchyConflict(msg) => write!(f, "hierarchy conflict: {}", msg),
            AgentError::ResourceExhausted(msg) => write!(f, "resource exhausted: {}", msg),
            AgentError::Unavailable(msg) => write!(f, "unavailable: {}", msg),
            AgentError::Cancelled => write!(f, "cancelled"),
            AgentError::Internal(msg) => write!(f, "internal error: {}", msg),
            AgentError::Unsupported(msg) => write!(f, "unsupported: {}", msg),
        }
    }
}

impl Error for AgentError {}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(AgentError::Cancelled.code(), "CANCELLED");
        assert_eq!(
            AgentError::ResourceExhausted("x".into()).code(),
            "RESOURCE_EXHAUSTED"
        );
        assert_eq!(AgentError::NotFound("t".into()).code(), "NOT_FOUND");
    }

    #[test]
    fn test_display_includes_detail() {
        let err = AgentError::NotFound("tool 'add'".to_string());
        assert!(err.to_string().contains("tool 'add'"));
    }
}
