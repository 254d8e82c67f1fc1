//! Google Gemini backend for the [`Llm`](crate::agentflow::model::Llm) trait.
//!
//! Talks to the Generative Language API's `generateContent` endpoint with the
//! API key passed as a query parameter. The API key comes from
//! `GOOGLE_API_KEY`; `GEMINI_API_ENDPOINT` overrides the base URL (useful for
//! proxies and record/replay setups).
//!
//! # Example
//!
//! ```rust,no_run
//! use agentflow::models::gemini::GeminiLlm;
//!
//! let backend = GeminiLlm::from_env("gemini-2.0-flash").unwrap();
//! // hand to an LlmAgent via .model_handle(...) or resolve through the registry
//! ```

use crate::agentflow::content::{Content, FunctionCall, FunctionResponse, Part, Role};
use crate::agentflow::error::{AgentError, Result};
use crate::agentflow::model::{Llm, LlmRequest, LlmResponse, TokenUsage};
use async_trait::async_trait;
use serde_json::{json, Value};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini chat backend over the Generative Language REST API.
pub struct GeminiLlm {
    http: reqwest::Client,
    model: String,
    api_key: String,
    base_url: String,
}

impl GeminiLlm {
    /// Construct with an explicit key and the default base URL.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::new_with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    /// Construct against a custom base URL (no trailing slash).
    pub fn new_with_base_url(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: &str,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            model: model.into(),
            api_key: api_key.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Construct from `GOOGLE_API_KEY` and optional `GEMINI_API_ENDPOINT`.
    pub fn from_env(model: &str) -> Result<Self> {
        let api_key = std::env::var("GOOGLE_API_KEY").map_err(|_| {
            AgentError::Unavailable("GOOGLE_API_KEY is not set".to_string())
        })?;
        let base_url =
            std::env::var("GEMINI_API_ENDPOINT").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self::new_with_base_url(api_key, model, &base_url))
    }

    fn role_string(role: Option<Role>) -> &'static str {
        match role {
            Some(Role::User) | Some(Role::System) | Some(Role::Tool) => "user",
            _ => "model",
        }
    }

    fn encode_part(part: &Part) -> Value {
        match part {
            Part::Text { text, thought } => {
                if *thought {
                    json!({ "text": text, "thought": true })
                } else {
                    json!({ "text": text })
                }
            }
            Part::FunctionCall(call) => json!({
                "functionCall": { "name": call.name, "args": call.args }
            }),
            Part::FunctionResponse(resp) => json!({
                "functionResponse": { "name": resp.name, "response": resp.response }
            }),
            Part::AuthRequest(config) => json!({
                "text": serde_json::to_string(config).unwrap_or_default()
            }),
            Part::InlineBlob(blob) => json!({
                "inlineData": { "mimeType": blob.mime_type, "data": blob.data }
            }),
        }
    }

    fn build_body(&self, request: &LlmRequest) -> Value {
        let contents: Vec<Value> = request
            .contents
            .iter()
            .map(|content| {
                let parts: Vec<Value> = content.parts.iter().map(Self::encode_part).collect();
                json!({ "role": Self::role_string(content.role), "parts": parts })
            })
            .collect();

        let mut body = json!({ "contents": contents });

        if let Some(instruction) = &request.system_instruction {
            body["systemInstruction"] = json!({ "parts": [{ "text": instruction }] });
        }

        let mut tools = Vec::new();
        if !request.tools.is_empty() {
            let declarations: Vec<Value> = request
                .tools
                .iter()
                .map(|decl| {
                    let mut entry = json!({
                        "name": decl.name,
                        "description": decl.description,
                    });
                    if let Some(parameters) = &decl.parameters {
                        entry["parameters"] = parameters.clone();
                    }
                    entry
                })
                .collect();
            tools.push(json!({ "functionDeclarations": declarations }));
        }
        for builtin in &request.builtin_tools {
            let mut entry = serde_json::Map::new();
            entry.insert(builtin.clone(), json!({}));
            tools.push(Value::Object(entry));
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }

        body
    }

    fn decode_response(payload: &Value) -> Result<LlmResponse> {
        if let Some(error) = payload.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Err(AgentError::Unavailable(format!(
                "gemini API error: {}",
                message
            )));
        }

        let mut content = Content::new(Role::Model);
        if let Some(parts) = payload
            .pointer("/candidates/0/content/parts")
            .and_then(|p| p.as_array())
        {
            for part in parts {
                if let Some(call) = part.get("functionCall") {
                    let name = call
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let args = call.get("args").cloned().unwrap_or(Value::Null);
                    content = content.with_part(Part::FunctionCall(FunctionCall::new(name, args)));
                } else if let Some(resp) = part.get("functionResponse") {
                    let name = resp
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string();
                    content = content.with_part(Part::FunctionResponse(FunctionResponse {
                        id: String::new(),
                        name,
                        response: resp.get("response").cloned().unwrap_or(Value::Null),
                        auth_request: None,
                    }));
                } else if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    let thought = part
                        .get("thought")
                        .and_then(|t| t.as_bool())
                        .unwrap_or(false);
                    content = content.with_part(Part::Text {
                        text: text.to_string(),
                        thought,
                    });
                }
            }
        }

        let usage = payload.get("usageMetadata").map(|meta| {
            let input = meta
                .get("promptTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;
            let output = meta
                .get("candidatesTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;
            TokenUsage {
                input_tokens: input,
                output_tokens: output,
                total_tokens: input + output,
            }
        });

        let mut response = LlmResponse::with_content(content);
        response.usage = usage;
        Ok(response)
    }
}

#[async_trait]
impl Llm for GeminiLlm {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate_content(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let body = self.build_body(request);

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Unavailable(format!("gemini request failed: {}", e)))?;
        let payload: Value = response
            .json()
            .await
            .map_err(|e| AgentError::Unavailable(format!("gemini returned non-JSON: {}", e)))?;

        match Self::decode_response(&payload) {
            Ok(decoded) => Ok(decoded),
            Err(err) => {
                log::error!("GeminiLlm::generate_content error: {}", err);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentflow::model::FunctionDeclaration;

    #[test]
    fn test_body_carries_system_instruction_and_tools() {
        let backend = GeminiLlm::new("key", "gemini-2.0-flash");
        let mut request = LlmRequest::new("gemini-2.0-flash");
        request.append_system_instruction("Be terse.");
        request.contents.push(Content::new(Role::User).with_text("hi"));
        request.add_function_declaration(FunctionDeclaration {
            name: "add".into(),
            description: "adds".into(),
            parameters: Some(json!({"type": "object"})),
        });
        request.add_builtin_tool("google_search");

        let body = backend.build_body(&request);
        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            json!("Be terse.")
        );
        assert_eq!(body["contents"][0]["role"], json!("user"));
        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["name"],
            json!("add")
        );
        assert!(body["tools"][1]["google_search"].is_object());
    }

    #[test]
    fn test_decode_text_and_function_call() {
        let payload = json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        { "text": "let me check" },
                        { "functionCall": { "name": "add", "args": { "a": 1, "b": 2 } } }
                    ]
                }
            }],
            "usageMetadata": { "promptTokenCount": 10, "candidatesTokenCount": 5 }
        });
        let decoded = GeminiLlm::decode_response(&payload).unwrap();
        let content = decoded.content.unwrap();
        assert_eq!(content.text(), "let me check");
        assert_eq!(content.function_calls().len(), 1);
        assert_eq!(decoded.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn test_decode_surfaces_api_errors() {
        let payload = json!({ "error": { "message": "quota exceeded" } });
        let err = GeminiLlm::decode_response(&payload).unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }
}
