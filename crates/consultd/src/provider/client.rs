//! HTTP adapter for the OpenAI-compatible chat-completions shape.
//!
//! One operation: `complete`. The call is wrapped in an exponential-backoff
//! retry loop (2 retries, 1s base) that fires only for transient failures;
//! validation-grade provider errors surface immediately.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DaemonError, Result};
use crate::provider::ModelSpec;

const MAX_RETRIES: u32 = 2;
const BASE_DELAY_MS: u64 = 1_000;
const RETRYABLE_STATUSES: &[u16] = &[429, 500, 501, 502, 503, 504, 599];

/// Provider connection settings resolved from config (plaintext key).
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatTurn>,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
    pub reasoning_content: Option<String>,
    pub response_time_ms: u64,
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: Option<WireMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
    reasoning_content: Option<String>,
}

pub struct ProviderClient {
    http: reqwest::Client,
}

impl ProviderClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Run one chat completion with retry and wall-time measurement.
    pub async fn complete(
        &self,
        endpoint: &ProviderEndpoint,
        spec: &ModelSpec,
        request: CompletionRequest,
    ) -> Result<CompletionResponse> {
        let messages = shape_messages(spec, &request);
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            match self.try_once(endpoint, spec, &messages, &request).await {
                Ok(mut response) => {
                    response.response_time_ms = started.elapsed().as_millis() as u64;
                    return Ok(response);
                }
                Err(failure) => {
                    if failure.retryable && attempt < MAX_RETRIES {
                        let delay = BASE_DELAY_MS * 2u64.pow(attempt);
                        warn!(
                            "provider call failed ({}), retry {}/{} in {}ms",
                            failure.message,
                            attempt + 1,
                            MAX_RETRIES,
                            delay
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(failure.into_error());
                }
            }
        }
    }

    async fn try_once(
        &self,
        endpoint: &ProviderEndpoint,
        spec: &ModelSpec,
        messages: &[ChatTurn],
        request: &CompletionRequest,
    ) -> std::result::Result<CompletionResponse, CallFailure> {
        let cap = request.max_tokens.min(spec.max_output_tokens);
        let wire = WireRequest {
            model: spec.api_model,
            messages,
            max_tokens: (!spec.uses_completion_tokens_field).then_some(cap),
            max_completion_tokens: spec.uses_completion_tokens_field.then_some(cap),
            temperature: spec.temperature,
            reasoning_effort: spec.reasoning_effort,
        };
        let url = format!("{}/chat/completions", endpoint.base_url.trim_end_matches('/'));
        debug!("provider call: {} -> {}", spec.id, url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&endpoint.api_key)
            .timeout(Duration::from_millis(request.timeout_ms))
            .json(&wire)
            .send()
            .await
            .map_err(CallFailure::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallFailure::from_status(status.as_u16(), body));
        }

        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|e| CallFailure::terminal(format!("unparseable provider response: {}", e)))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CallFailure::terminal("provider returned no choices"))?;
        let message = choice
            .message
            .ok_or_else(|| CallFailure::terminal("provider choice carried no message"))?;

        Ok(CompletionResponse {
            content: message.content.unwrap_or_default(),
            usage: parsed.usage,
            finish_reason: choice.finish_reason,
            reasoning_content: message.reasoning_content.filter(|s| !s.is_empty()),
            response_time_ms: 0,
        })
    }
}

impl Default for ProviderClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the outgoing message list, honouring the model's system-prompt
/// support. Models without a system role get the prompt folded into the
/// first user turn.
fn shape_messages(spec: &ModelSpec, request: &CompletionRequest) -> Vec<ChatTurn> {
    let Some(prompt) = request
        .system_prompt
        .as_deref()
        .filter(|p| !p.is_empty())
    else {
        return request.messages.clone();
    };

    if spec.supports_system_prompt {
        let mut out = Vec::with_capacity(request.messages.len() + 1);
        out.push(ChatTurn::new("system", prompt));
        out.extend(request.messages.iter().cloned());
        return out;
    }

    let mut out = request.messages.clone();
    if let Some(first_user) = out.iter_mut().find(|turn| turn.role == "user") {
        first_user.content = merge_system_prompt(prompt, &first_user.content);
    } else {
        out.insert(0, ChatTurn::new("user", prompt));
    }
    out
}

pub fn merge_system_prompt(prompt: &str, user_content: &str) -> String {
    format!(
        "[System Instructions]\n{}\n\n[User Query]\n{}",
        prompt, user_content
    )
}

struct CallFailure {
    message: String,
    retryable: bool,
    timeout: bool,
    auth: bool,
}

impl CallFailure {
    fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            timeout: false,
            auth: false,
        }
    }

    fn from_status(status: u16, body: String) -> Self {
        let message = format!("provider returned {}: {}", status, truncate(&body, 300));
        Self {
            retryable: is_retryable_status(status) || is_retryable_message(&message),
            timeout: false,
            auth: status == 401 || status == 403,
            message,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        let timeout = err.is_timeout();
        let message = err.to_string();
        Self {
            retryable: timeout || is_retryable_message(&message),
            timeout,
            auth: false,
            message,
        }
    }

    fn into_error(self) -> DaemonError {
        if self.timeout {
            DaemonError::Timeout(self.message)
        } else if self.auth {
            DaemonError::Auth(self.message)
        } else {
            DaemonError::ExternalUnavailable(self.message)
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

fn is_retryable_message(message: &str) -> bool {
    message.to_lowercase().contains("timeout") || message.contains("ETIMEDOUT")
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::model_spec;

    fn request_with(system_prompt: Option<&str>) -> CompletionRequest {
        CompletionRequest {
            messages: vec![ChatTurn::new("user", "what broke?")],
            system_prompt: system_prompt.map(str::to_string),
            max_tokens: 1024,
            timeout_ms: 180_000,
        }
    }

    #[test]
    fn test_retryable_classification() {
        for status in [429u16, 500, 501, 502, 503, 504, 599] {
            assert!(is_retryable_status(status), "status {} should retry", status);
        }
        for status in [400u16, 401, 403, 404, 422] {
            assert!(!is_retryable_status(status), "status {} should not retry", status);
        }
        assert!(is_retryable_message("connection Timeout while reading body"));
        assert!(is_retryable_message("code ETIMEDOUT"));
        assert!(!is_retryable_message("invalid request"));
    }

    #[test]
    fn test_system_prompt_as_system_turn_when_supported() {
        let spec = model_spec("deepseek-chat").unwrap();
        let shaped = shape_messages(spec, &request_with(Some("be brief")));
        assert_eq!(shaped.len(), 2);
        assert_eq!(shaped[0].role, "system");
        assert_eq!(shaped[0].content, "be brief");
        assert_eq!(shaped[1].role, "user");
    }

    #[test]
    fn test_system_prompt_merged_for_reasoner() {
        let spec = model_spec("deepseek-reasoner").unwrap();
        let shaped = shape_messages(spec, &request_with(Some("be brief")));
        assert_eq!(shaped.len(), 1);
        assert_eq!(shaped[0].role, "user");
        assert_eq!(
            shaped[0].content,
            "[System Instructions]\nbe brief\n\n[User Query]\nwhat broke?"
        );
    }

    #[test]
    fn test_no_prompt_leaves_messages_untouched() {
        let spec = model_spec("deepseek-reasoner").unwrap();
        let shaped = shape_messages(spec, &request_with(None));
        assert_eq!(shaped.len(), 1);
        assert_eq!(shaped[0].content, "what broke?");
    }

    #[test]
    fn test_wire_request_field_selection() {
        let spec = model_spec("deepseek-reasoner").unwrap();
        let wire = WireRequest {
            model: spec.api_model,
            messages: &[],
            max_tokens: (!spec.uses_completion_tokens_field).then_some(100),
            max_completion_tokens: spec.uses_completion_tokens_field.then_some(100),
            temperature: spec.temperature,
            reasoning_effort: spec.reasoning_effort,
        };
        let json = serde_json::to_value(&wire).unwrap();
        assert!(json.get("max_tokens").is_none());
        assert_eq!(json["max_completion_tokens"], 100);
        assert_eq!(json["temperature"], 0.0);
        assert!(json.get("reasoning_effort").is_none());
    }

    #[test]
    fn test_cap_applies_model_maximum() {
        let spec = model_spec("deepseek-chat").unwrap();
        assert_eq!(20_000u32.min(spec.max_output_tokens), 8_192);
    }
}
