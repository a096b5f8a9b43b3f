//! Provider adapters for the two external chat-completion APIs.
//!
//! "Provider" is a closed sum: DeepSeek-compatible and OpenAI-compatible,
//! selected by model prefix. Adding a model means editing the catalogue
//! table, nothing else.

pub mod client;

pub use client::{ChatTurn, CompletionRequest, CompletionResponse, ProviderClient, Usage};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Deepseek,
    Openai,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deepseek => "deepseek",
            Self::Openai => "openai",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deepseek" => Some(Self::Deepseek),
            "openai" => Some(Self::Openai),
            _ => None,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::Deepseek => "https://api.deepseek.com/v1",
            Self::Openai => "https://api.openai.com/v1",
        }
    }
}

/// Per-model request shaping flags.
#[derive(Debug, Clone, Copy)]
pub struct ModelSpec {
    pub id: &'static str,
    pub api_model: &'static str,
    pub provider: ProviderId,
    pub max_output_tokens: u32,
    pub is_reasoning: bool,
    pub supports_system_prompt: bool,
    /// Pinned temperature, if the model requires one.
    pub temperature: Option<f32>,
    /// `reasoning_effort` request field, where the API takes one.
    pub reasoning_effort: Option<&'static str>,
    /// Send the output cap as `max_completion_tokens` instead of `max_tokens`.
    pub uses_completion_tokens_field: bool,
}

/// The fixed model catalogue. Changing it is a change-controlled table edit.
pub const MODEL_CATALOGUE: &[ModelSpec] = &[
    ModelSpec {
        id: "deepseek-chat",
        api_model: "deepseek-chat",
        provider: ProviderId::Deepseek,
        max_output_tokens: 8_192,
        is_reasoning: false,
        supports_system_prompt: true,
        temperature: None,
        reasoning_effort: None,
        uses_completion_tokens_field: false,
    },
    ModelSpec {
        id: "deepseek-reasoner",
        api_model: "deepseek-reasoner",
        provider: ProviderId::Deepseek,
        max_output_tokens: 64_000,
        is_reasoning: true,
        supports_system_prompt: false,
        temperature: Some(0.0),
        reasoning_effort: None,
        uses_completion_tokens_field: true,
    },
    ModelSpec {
        id: "gpt-5.2",
        api_model: "gpt-5.2",
        provider: ProviderId::Openai,
        max_output_tokens: 400_000,
        is_reasoning: true,
        supports_system_prompt: true,
        temperature: None,
        reasoning_effort: Some("medium"),
        uses_completion_tokens_field: false,
    },
    ModelSpec {
        id: "gpt-5.2-pro",
        api_model: "gpt-5.2-pro",
        provider: ProviderId::Openai,
        max_output_tokens: 400_000,
        is_reasoning: true,
        supports_system_prompt: true,
        temperature: None,
        reasoning_effort: Some("high"),
        uses_completion_tokens_field: false,
    },
];

pub fn model_spec(model: &str) -> Option<&'static ModelSpec> {
    MODEL_CATALOGUE.iter().find(|spec| spec.id == model)
}

pub fn model_ids() -> Vec<&'static str> {
    MODEL_CATALOGUE.iter().map(|spec| spec.id).collect()
}

/// Dispatch by model prefix.
pub fn provider_for_model(model: &str) -> Option<ProviderId> {
    if model.starts_with("deepseek-") {
        Some(ProviderId::Deepseek)
    } else if model.starts_with("gpt-") {
        Some(ProviderId::Openai)
    } else {
        None
    }
}
