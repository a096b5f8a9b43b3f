//! Configuration service: defaults composed with stored overrides,
//! schema-checked writes, credential sealing, change broadcast.
//!
//! Single writer, read from anywhere. Every successful write re-broadcasts
//! the effective (masked) config to the hub.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::error::{DaemonError, Result};
use crate::hub::{Event, EventHub};
use crate::provider::{model_spec, ProviderId};
use crate::secrets;
use crate::store::Store;

pub const DEFAULT_MODEL: &str = "deepseek-reasoner";
pub const DEFAULT_MAX_MESSAGES: u32 = 5;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 180_000;
pub const MAX_MESSAGES_RANGE: (u32, u32) = (1, 50);
pub const REQUEST_TIMEOUT_RANGE_MS: (u64, u64) = (30_000, 600_000);

const CONFIG_KEYS: [&str; 5] = [
    "defaultModel",
    "maxMessages",
    "requestTimeout",
    "autoOpenWebUI",
    "providers",
];

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProviderSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub deepseek: ProviderSettings,
    #[serde(default)]
    pub openai: ProviderSettings,
}

impl ProvidersConfig {
    pub fn get(&self, id: ProviderId) -> &ProviderSettings {
        match id {
            ProviderId::Deepseek => &self.deepseek,
            ProviderId::Openai => &self.openai,
        }
    }

    pub fn get_mut(&mut self, id: ProviderId) -> &mut ProviderSettings {
        match id {
            ProviderId::Deepseek => &mut self.deepseek,
            ProviderId::Openai => &mut self.openai,
        }
    }
}

/// Effective daemon configuration. `providers.*.api_key` holds plaintext in
/// memory; it is sealed before it touches the store and masked before it
/// touches any wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    pub default_model: String,
    pub max_messages: u32,
    pub request_timeout: u64,
    pub auto_open_web_ui: bool,
    pub providers: ProvidersConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
            max_messages: DEFAULT_MAX_MESSAGES,
            request_timeout: DEFAULT_REQUEST_TIMEOUT_MS,
            auto_open_web_ui: false,
            providers: ProvidersConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Hard cap on persisted messages per conversation.
    pub fn message_cap(&self) -> usize {
        (self.max_messages as usize) * 2
    }
}

pub struct ConfigService {
    store: Arc<Store>,
    hub: Arc<EventHub>,
}

impl ConfigService {
    pub fn new(store: Arc<Store>, hub: Arc<EventHub>) -> Self {
        Self { store, hub }
    }

    /// Compose defaults with stored overrides, decrypting credentials.
    pub fn load(&self) -> Result<DaemonConfig> {
        let mut config = DaemonConfig::default();

        if let Some(raw) = self.store.config.get("defaultModel")? {
            if let Ok(value) = serde_json::from_str::<String>(&raw) {
                config.default_model = value;
            }
        }
        if let Some(raw) = self.store.config.get("maxMessages")? {
            if let Ok(value) = serde_json::from_str::<u32>(&raw) {
                config.max_messages = value;
            }
        }
        if let Some(raw) = self.store.config.get("requestTimeout")? {
            if let Ok(value) = serde_json::from_str::<u64>(&raw) {
                config.request_timeout = value;
            }
        }
        if let Some(raw) = self.store.config.get("autoOpenWebUI")? {
            if let Ok(value) = serde_json::from_str::<bool>(&raw) {
                config.auto_open_web_ui = value;
            }
        }
        if let Some(raw) = self.store.config.get("providers")? {
            let mut providers: ProvidersConfig = serde_json::from_str(&raw)
                .map_err(|e| DaemonError::validation("providers", e.to_string()))?;
            for id in [ProviderId::Deepseek, ProviderId::Openai] {
                let settings = providers.get_mut(id);
                if let Some(sealed) = settings.api_key.take() {
                    settings.api_key = Some(secrets::decrypt_credential(&sealed)?);
                }
            }
            config.providers = providers;
        }

        Ok(config)
    }

    /// Validate and persist a partial update, then broadcast the new
    /// effective config. Returns the effective config after the write.
    pub fn apply_patch(&self, patch: Value) -> Result<DaemonConfig> {
        let Value::Object(patch) = patch else {
            return Err(DaemonError::validation("config", "patch must be an object"));
        };
        if patch.is_empty() {
            return Err(DaemonError::validation("config", "empty patch"));
        }
        for key in patch.keys() {
            if !CONFIG_KEYS.contains(&key.as_str()) {
                return Err(DaemonError::validation(key.clone(), "unknown config key"));
            }
        }

        let mut config = self.load()?;

        if let Some(value) = patch.get("defaultModel") {
            let model: String = serde_json::from_value(value.clone())
                .map_err(|_| DaemonError::validation("defaultModel", "must be a string"))?;
            if model_spec(&model).is_none() {
                return Err(DaemonError::validation(
                    "defaultModel",
                    format!("unknown model '{}'", model),
                ));
            }
            config.default_model = model;
        }
        if let Some(value) = patch.get("maxMessages") {
            let max: u32 = serde_json::from_value(value.clone())
                .map_err(|_| DaemonError::validation("maxMessages", "must be an integer"))?;
            let (lo, hi) = MAX_MESSAGES_RANGE;
            if max < lo || max > hi {
                return Err(DaemonError::validation(
                    "maxMessages",
                    format!("must be within {}..{}", lo, hi),
                ));
            }
            config.max_messages = max;
        }
        if let Some(value) = patch.get("requestTimeout") {
            let timeout: u64 = serde_json::from_value(value.clone())
                .map_err(|_| DaemonError::validation("requestTimeout", "must be an integer"))?;
            let (lo, hi) = REQUEST_TIMEOUT_RANGE_MS;
            if timeout < lo || timeout > hi {
                return Err(DaemonError::validation(
                    "requestTimeout",
                    format!("must be within {}..{} ms", lo, hi),
                ));
            }
            config.request_timeout = timeout;
        }
        if let Some(value) = patch.get("autoOpenWebUI") {
            config.auto_open_web_ui = serde_json::from_value(value.clone())
                .map_err(|_| DaemonError::validation("autoOpenWebUI", "must be a boolean"))?;
        }
        if let Some(value) = patch.get("providers") {
            let Value::Object(provider_patch) = value else {
                return Err(DaemonError::validation("providers", "must be an object"));
            };
            for (name, entry) in provider_patch {
                let id = ProviderId::parse(name).ok_or_else(|| {
                    DaemonError::validation("providers", format!("unknown provider '{}'", name))
                })?;
                let incoming: ProviderSettings = serde_json::from_value(entry.clone())
                    .map_err(|e| DaemonError::validation("providers", e.to_string()))?;
                let current = config.providers.get_mut(id);
                current.enabled = incoming.enabled;
                if incoming.api_key.is_some() {
                    current.api_key = incoming.api_key;
                }
                if incoming.base_url.is_some() {
                    current.base_url = incoming.base_url;
                }
            }
        }

        self.persist(&config)?;
        info!("config updated");
        self.hub.publish(Event::ConfigUpdated {
            config: masked_snapshot(&config),
        });
        Ok(config)
    }

    /// Replace one provider's settings wholesale (PUT semantics).
    pub fn put_provider(&self, id: ProviderId, settings: ProviderSettings) -> Result<DaemonConfig> {
        let mut config = self.load()?;
        *config.providers.get_mut(id) = settings;
        self.persist(&config)?;
        self.hub.publish(Event::ConfigUpdated {
            config: masked_snapshot(&config),
        });
        Ok(config)
    }

    fn persist(&self, config: &DaemonConfig) -> Result<()> {
        let mut sealed = config.providers.clone();
        for id in [ProviderId::Deepseek, ProviderId::Openai] {
            let settings = sealed.get_mut(id);
            if let Some(plain) = settings.api_key.take() {
                settings.api_key = Some(secrets::encrypt_credential(&plain)?);
            }
        }
        let entries = vec![
            (
                "defaultModel".to_string(),
                serde_json::to_string(&config.default_model).map_err(anyhow::Error::new)?,
            ),
            ("maxMessages".to_string(), config.max_messages.to_string()),
            (
                "requestTimeout".to_string(),
                config.request_timeout.to_string(),
            ),
            (
                "autoOpenWebUI".to_string(),
                config.auto_open_web_ui.to_string(),
            ),
            (
                "providers".to_string(),
                serde_json::to_string(&sealed).map_err(anyhow::Error::new)?,
            ),
        ];
        self.store.config.set_many(&entries)?;
        Ok(())
    }
}

/// Snapshot for broadcast and REST: never ciphertext, never plaintext.
pub fn masked_snapshot(config: &DaemonConfig) -> Value {
    let provider_view = |settings: &ProviderSettings| {
        json!({
            "enabled": settings.enabled,
            "hasKey": settings.api_key.is_some(),
            "apiKey": settings.api_key.as_deref().map(secrets::mask_key),
            "baseUrl": settings.base_url,
        })
    };
    json!({
        "defaultModel": config.default_model,
        "maxMessages": config.max_messages,
        "requestTimeout": config.request_timeout,
        "autoOpenWebUI": config.auto_open_web_ui,
        "providers": {
            "deepseek": provider_view(&config.providers.deepseek),
            "openai": provider_view(&config.providers.openai),
        },
    })
}
