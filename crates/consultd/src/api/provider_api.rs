//! /api/providers - provider credential management and connectivity test.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::api::AppState;
use crate::config::ProviderSettings;
use crate::error::{DaemonError, Result};
use crate::provider::client::{ChatTurn, CompletionRequest, ProviderEndpoint};
use crate::provider::{ProviderClient, ProviderId, MODEL_CATALOGUE};
use crate::secrets::mask_key;

fn parse_provider(id: &str) -> Result<ProviderId> {
    ProviderId::parse(id).ok_or_else(|| DaemonError::not_found(format!("provider {}", id)))
}

fn provider_view(id: ProviderId, settings: &ProviderSettings) -> Value {
    let models: Vec<&str> = MODEL_CATALOGUE
        .iter()
        .filter(|spec| spec.provider == id)
        .map(|spec| spec.id)
        .collect();
    json!({
        "id": id.as_str(),
        "enabled": settings.enabled,
        "hasKey": settings.api_key.is_some(),
        "apiKey": settings.api_key.as_deref().map(mask_key),
        "baseUrl": settings.base_url,
        "models": models,
    })
}

pub async fn list_providers(State(state): State<AppState>) -> Result<Json<Value>> {
    let config = state.config.load()?;
    Ok(Json(json!({
        "providers": [
            provider_view(ProviderId::Deepseek, &config.providers.deepseek),
            provider_view(ProviderId::Openai, &config.providers.openai),
        ]
    })))
}

pub async fn get_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let provider = parse_provider(&id)?;
    let config = state.config.load()?;
    Ok(Json(provider_view(provider, config.providers.get(provider))))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PutProviderBody {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

pub async fn put_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PutProviderBody>,
) -> Result<Json<Value>> {
    let provider = parse_provider(&id)?;
    // PUT without a key keeps the existing one so re-enabling does not
    // force re-entry.
    let current = state.config.load()?;
    let api_key = body.api_key.or_else(|| {
        current.providers.get(provider).api_key.clone()
    });
    let config = state.config.put_provider(
        provider,
        ProviderSettings {
            enabled: body.enabled,
            api_key,
            base_url: body.base_url,
        },
    )?;
    info!("provider {} updated", provider.as_str());
    Ok(Json(provider_view(provider, config.providers.get(provider))))
}

/// Clear credentials and disable.
pub async fn delete_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let provider = parse_provider(&id)?;
    state.config.put_provider(provider, ProviderSettings::default())?;
    info!("provider {} cleared", provider.as_str());
    Ok(Json(json!({"success": true, "id": provider.as_str()})))
}

/// Fire a one-token completion at the provider and report round-trip health.
pub async fn test_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let provider = parse_provider(&id)?;
    let config = state.config.load()?;
    let settings = config.providers.get(provider);
    let api_key = settings
        .api_key
        .clone()
        .ok_or_else(|| DaemonError::auth(format!("no API key for provider '{}'", id)))?;
    let spec = MODEL_CATALOGUE
        .iter()
        .find(|spec| spec.provider == provider)
        .ok_or_else(|| DaemonError::internal("provider has no catalogue model"))?;

    let endpoint = ProviderEndpoint {
        api_key,
        base_url: settings
            .base_url
            .clone()
            .unwrap_or_else(|| provider.default_base_url().to_string()),
    };
    let client = ProviderClient::new();
    let response = client
        .complete(
            &endpoint,
            spec,
            CompletionRequest {
                messages: vec![ChatTurn::new("user", "ping")],
                system_prompt: None,
                max_tokens: 1,
                timeout_ms: 15_000,
            },
        )
        .await?;

    Ok(Json(json!({
        "success": true,
        "id": provider.as_str(),
        "model": spec.id,
        "responseTimeMs": response.response_time_ms,
    })))
}
