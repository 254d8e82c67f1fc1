//! End-user credential plumbing.
//!
//! A tool that needs end-user credentials raises an [`AuthConfig`] through
//! its tool context. The flow relays the request to the caller as a
//! long-running function call named [`REQUEST_CREDENTIAL_FUNCTION`]; the
//! caller eventually answers with a function response carrying the filled-in
//! config. On the next step the [`AuthRequestProcessor`] picks the response
//! up, caches the credential in session state under a deterministic
//! [`credential_key`], optionally exchanges OAuth2/OIDC credentials through a
//! pluggable [`CredentialExchanger`], and resumes the originating tool.
//!
//! The key is derived from the canonical JSON of scheme and raw credential,
//! so equivalent configs collide on purpose and share one cache slot.

use crate::agentflow::agent::{Agent, LlmAgent};
use crate::agentflow::content::{Content, FunctionResponse, Part, Role};
use crate::agentflow::error::{AgentError, Result};
use crate::agentflow::event::Event;
use crate::agentflow::invocation::InvocationContext;
use crate::agentflow::model::LlmRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Reserved function-call name used to round-trip credentials to the caller.
pub const REQUEST_CREDENTIAL_FUNCTION: &str = "request_euc";

/// Reserved session-state prefix for cached credentials.
pub const CREDENTIAL_STATE_PREFIX: &str = "temp:adk_";

/// A credential request or a (possibly exchanged) credential.
///
/// `scheme` describes how the credential is used (API key header, OAuth2
/// flow, ...); `raw_credential` is what the user supplied;
/// `exchanged_credential` is set once a [`CredentialExchanger`] has produced
/// a usable token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(default)]
    pub scheme: Value,
    #[serde(default)]
    pub raw_credential: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchanged_credential: Option<Value>,
}

impl AuthConfig {
    /// The deterministic session-state key for this config.
    pub fn credential_key(&self) -> String {
        credential_key(&self.scheme, &self.raw_credential)
    }

    /// True for schemes that go through token exchange.
    pub fn is_exchangeable(&self) -> bool {
        match self.scheme.get("type").and_then(|t| t.as_str()) {
            Some("oauth2") | Some("openIdConnect") => true,
            _ => false,
        }
    }
}

fn short_hash(value: &Value) -> String {
    // serde_json maps are sorted, so to_string is canonical.
    let canonical = value.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// `temp:adk_<scheme_hash>_<cred_hash>` over canonical JSON. Equivalent
/// configs map to the same key so cached credentials are shared.
pub fn credential_key(scheme: &Value, raw_credential: &Value) -> String {
    format!(
        "{}{}_{}",
        CREDENTIAL_STATE_PREFIX,
        short_hash(scheme),
        short_hash(raw_credential)
    )
}

/// Hook for exchanging a user-supplied credential for a usable token.
///
/// Returning `Ok(None)` means the scheme is not supported and the raw
/// credential is used as-is.
#[async_trait]
pub trait CredentialExchanger: Send + Sync {
    async fn exchange(&self, config: &AuthConfig) -> Result<Option<Value>>;
}

/// Default exchanger: never exchanges.
pub struct NoExchange;

#[async_trait]
impl CredentialExchanger for NoExchange {
    async fn exchange(&self, _config: &AuthConfig) -> Result<Option<Value>> {
        Ok(None)
    }
}

/// Request processor that resumes tools once the caller has answered a
/// credential request. Runs before contents assembly so the synthesized
/// function response lands in the history handed to the model.
pub struct AuthRequestProcessor {
    exchanger: Arc<dyn CredentialExchanger>,
}

impl AuthRequestProcessor {
    pub fn new() -> Self {
        Self {
            exchanger: Arc::new(NoExchange),
        }
    }

    pub fn with_exchanger(exchanger: Arc<dyn CredentialExchanger>) -> Self {
        Self { exchanger }
    }

    /// Walk `events` backward for the `request_euc` call with the given id
    /// and return the originating function-call id from its arguments.
    fn originating_call_id(events: &[Event], euc_call_id: &str) -> Option<String> {
        for event in events.iter().rev() {
            for call in event.function_calls() {
                if call.id == euc_call_id && call.name == REQUEST_CREDENTIAL_FUNCTION {
                    return call
                        .args
                        .get("functionCallId")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string());
                }
            }
        }
        None
    }
}

impl Default for AuthRequestProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl crate::agentflow::flow::RequestProcessor for AuthRequestProcessor {
    async fn process(
        &self,
        ctx: &Arc<InvocationContext>,
        agent: &Arc<LlmAgent>,
        _request: &mut LlmRequest,
    ) -> Result<Vec<Event>> {
        let events = ctx.events().await;

        // Most recent user turn that answers a credential request.
        let user_index = events.iter().rposition(|e| {
            e.author == "user"
                && e.function_responses()
                    .iter()
                    .any(|r| r.name == REQUEST_CREDENTIAL_FUNCTION)
        });
        let user_index = match user_index {
            Some(index) => index,
            None => return Ok(Vec::new()),
        };

        let mut emitted = Vec::new();
        let responses: Vec<FunctionResponse> = events[user_index]
            .function_responses()
            .into_iter()
            .filter(|r| r.name == REQUEST_CREDENTIAL_FUNCTION)
            .cloned()
            .collect();

        for euc_response in responses {
            let mut config: AuthConfig = match serde_json::from_value(euc_response.response.clone())
            {
                Ok(config) => config,
                Err(err) => {
                    log::warn!("discarding malformed credential response: {}", err);
                    continue;
                }
            };

            if config.is_exchangeable() && config.exchanged_credential.is_none() {
                if let Some(exchanged) = self.exchanger.exchange(&config).await? {
                    config.exchanged_credential = Some(exchanged);
                }
            }

            let key = config.credential_key();
            let config_value = serde_json::to_value(&config)
                .map_err(|e| AgentError::Internal(e.to_string()))?;
            ctx.state_set(key.clone(), config_value.clone()).await;

            let original_id = match Self::originating_call_id(&events, &euc_response.id) {
                Some(id) => id,
                None => continue,
            };

            // Already resumed on an earlier step?
            let resumed = events[user_index + 1..].iter().any(|e| {
                e.function_responses().iter().any(|r| r.id == original_id)
            });
            if resumed {
                continue;
            }

            let original_call = events.iter().rev().find_map(|e| {
                e.function_calls()
                    .into_iter()
                    .find(|c| c.id == original_id)
                    .cloned()
            });
            let original_call = match original_call {
                Some(call) => call,
                None => continue,
            };

            let tool = match agent.tool(&original_call.name) {
                Some(tool) => tool,
                None => continue,
            };

            let mut tool_ctx = crate::agentflow::tool::ToolContext::new(
                ctx.clone(),
                original_call.id.clone(),
            );
            let response_value = match tool.execute(&mut tool_ctx, original_call.args.clone()).await
            {
                Ok(value) => value,
                Err(err) => serde_json::json!({ "error": err.to_string() }),
            };

            let mut event = Event::new(ctx.invocation_id(), agent.name())
                .with_branch(ctx.branch().map(|b| b.to_string()))
                .with_content(Content {
                    role: Some(Role::Tool),
                    parts: vec![Part::FunctionResponse(FunctionResponse {
                        id: original_call.id.clone(),
                        name: original_call.name.clone(),
                        response: response_value,
                        auth_request: None,
                    })],
                });
            event.actions = tool_ctx.actions.clone();
            event.actions.state_delta.insert(key, config_value);
            emitted.push(event);
        }

        Ok(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_credential_key_is_deterministic() {
        let scheme = json!({"type": "apiKey", "name": "x-api-key", "in": "header"});
        let raw = json!({"apiKey": "secret"});
        let first = credential_key(&scheme, &raw);
        let second = credential_key(&scheme, &raw);
        assert_eq!(first, second);
        assert!(first.starts_with(CREDENTIAL_STATE_PREFIX));
    }

    #[test]
    fn test_credential_key_ignores_json_key_order() {
        let a = json!({"in": "header", "type": "apiKey"});
        let b = json!({"type": "apiKey", "in": "header"});
        assert_eq!(credential_key(&a, &json!({})), credential_key(&b, &json!({})));
    }

    #[test]
    fn test_credential_key_separates_distinct_credentials() {
        let scheme = json!({"type": "apiKey"});
        let first = credential_key(&scheme, &json!({"apiKey": "a"}));
        let second = credential_key(&scheme, &json!({"apiKey": "b"}));
        assert_ne!(first, second);
    }

    #[test]
    fn test_exchangeable_schemes() {
        let oauth = AuthConfig {
            scheme: json!({"type": "oauth2"}),
            raw_credential: json!({}),
            exchanged_credential: None,
        };
        assert!(oauth.is_exchangeable());

        let api_key = AuthConfig {
            scheme: json!({"type": "apiKey"}),
            raw_credential: json!({}),
            exchanged_credential: None,
        };
        assert!(!api_key.is_exchangeable());
    }
}
