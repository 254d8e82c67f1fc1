//! Planner hook.
//!
//! A planner contributes an instruction preamble before the model call and
//! rewrites the response parts afterwards. [`BuiltInPlanner`] relies on the
//! model's own reasoning (no preamble, parts pass through);
//! [`PlanReActPlanner`] enforces a tagged plan/act structure and marks the
//! reasoning sections as thoughts so they never reach the end user.

use crate::agentflow::content::Part;
use crate::agentflow::model::LlmRequest;

pub const PLANNING_TAG: &str = "/*PLANNING*/";
pub const REPLANNING_TAG: &str = "/*REPLANNING*/";
pub const REASONING_TAG: &str = "/*REASONING*/";
pub const ACTION_TAG: &str = "/*ACTION*/";
pub const FINAL_ANSWER_TAG: &str = "/*FINAL_ANSWER*/";

const ALL_TAGS: [&str; 5] = [
    PLANNING_TAG,
    REPLANNING_TAG,
    REASONING_TAG,
    ACTION_TAG,
    FINAL_ANSWER_TAG,
];

/// Instruction-preamble and response-part rewriter for one agent.
pub trait Planner: Send + Sync {
    /// Extra system-instruction text, if the planner needs one.
    fn build_planning_instruction(&self, request: &LlmRequest) -> Option<String>;

    /// Rewrite the model's response parts (thought tagging, trimming).
    fn process_planning_response(&self, parts: Vec<Part>) -> Vec<Part>;
}

/// Delegates planning to the model itself: empty preamble, parts pass
/// through untouched.
pub struct BuiltInPlanner;

impl Planner for BuiltInPlanner {
    fn build_planning_instruction(&self, _request: &LlmRequest) -> Option<String> {
        None
    }

    fn process_planning_response(&self, parts: Vec<Part>) -> Vec<Part> {
        parts
    }
}

/// Plan-Re-Act planner: the model must lay out a plan, act on it with tools,
/// optionally replan, and close with a tagged final answer.
pub struct PlanReActPlanner;

impl PlanReActPlanner {
    fn starts_with_tag(text: &str) -> bool {
        let trimmed = text.trim_start();
        ALL_TAGS.iter().any(|tag| trimmed.starts_with(tag))
    }
}

impl Planner for PlanReActPlanner {
    fn build_planning_instruction(&self, _request: &LlmRequest) -> Option<String> {
        Some(format!(
            "When answering the question, try to leverage the available tools to gather \
             information instead of your memorized knowledge.\n\n\
             Follow this process: (1) first come up with a plan in natural language, \
             listed step by step; (2) use tools to execute the plan and provide reasoning \
             between tool usage; (3) when you believe the plan cannot be completed, \
             revise the plan; (4) once the task is accomplished, give the final answer.\n\n\
             Mark each section with the matching tag: start planning with {planning}, \
             start reasoning between actions with {reasoning}, start tool usage with \
             {action}, start plan revisions with {replanning}, and start the final answer \
             with {final_answer}. Never put the final answer before the plan is complete.",
            planning = PLANNING_TAG,
            reasoning = REASONING_TAG,
            action = ACTION_TAG,
            replanning = REPLANNING_TAG,
            final_answer = FINAL_ANSWER_TAG,
        ))
    }

    fn process_planning_response(&self, parts: Vec<Part>) -> Vec<Part> {
        // A function call ends the visible portion of the turn: keep the
        // preceding text (tagged sections become thoughts) plus the call.
        if let Some(call_index) = parts
            .iter()
            .position(|p| matches!(p, Part::FunctionCall(_)))
        {
            let mut out = Vec::with_capacity(call_index + 1);
            for part in parts.into_iter().take(call_index + 1) {
                match part {
                    Part::Text { text, .. } if Self::starts_with_tag(&text) => {
                        out.push(Part::thought(text));
                    }
                    other => out.push(other),
                }
            }
            return out;
        }

        let mut out = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                Part::Text { text, thought } => {
                    if let Some(index) = text.find(FINAL_ANSWER_TAG) {
                        let prefix = &text[..index];
                        let answer = &text[index + FINAL_ANSWER_TAG.len()..];
                        if !prefix.trim().is_empty() {
                            out.push(Part::thought(prefix.to_string()));
                        }
                        if !answer.trim().is_empty() {
                            out.push(Part::text(answer.trim_start().to_string()));
                        }
                    } else if Self::starts_with_tag(&text) {
                        out.push(Part::thought(text));
                    } else {
                        out.push(Part::Text { text, thought });
                    }
                }
                other => out.push(other),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentflow::content::FunctionCall;
    use serde_json::json;

    #[test]
    fn test_builtin_passes_through() {
        let planner = BuiltInPlanner;
        assert!(planner
            .build_planning_instruction(&LlmRequest::new("m"))
            .is_none());
        let parts = vec![Part::text("hello")];
        assert_eq!(planner.process_planning_response(parts.clone()), parts);
    }

    #[test]
    fn test_react_preamble_mentions_all_tags() {
        let preamble = PlanReActPlanner
            .build_planning_instruction(&LlmRequest::new("m"))
            .unwrap();
        for tag in &[PLANNING_TAG, REPLANNING_TAG, REASONING_TAG, ACTION_TAG, FINAL_ANSWER_TAG] {
            assert!(preamble.contains(tag), "missing {}", tag);
        }
    }

    #[test]
    fn test_parts_after_first_function_call_are_dropped() {
        let parts = vec![
            Part::text(format!("{} step 1: look it up", PLANNING_TAG)),
            Part::FunctionCall(FunctionCall::new("search", json!({"q": "rust"}))),
            Part::text("stray trailing text"),
        ];
        let processed = PlanReActPlanner.process_planning_response(parts);
        assert_eq!(processed.len(), 2);
        assert!(processed[0].is_thought());
        assert!(matches!(processed[1], Part::FunctionCall(_)));
    }

    #[test]
    fn test_final_answer_splits_thought_and_visible() {
        let parts = vec![Part::text(format!(
            "{} thinking it over {} 42",
            REASONING_TAG, FINAL_ANSWER_TAG
        ))];
        let processed = PlanReActPlanner.process_planning_response(parts);
        assert_eq!(processed.len(), 2);
        assert!(processed[0].is_thought());
        assert!(!processed[1].is_thought());
        assert_eq!(processed[1].as_text(), Some("42"));
    }

    #[test]
    fn test_untagged_text_stays_visible() {
        let parts = vec![Part::text("plain answer")];
        let processed = PlanReActPlanner.process_planning_response(parts);
        assert_eq!(processed.len(), 1);
        assert!(!processed[0].is_thought());
    }
}
