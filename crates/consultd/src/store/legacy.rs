//! One-shot import of legacy JSON state files.
//!
//! Pre-database builds kept `config.json` and `conversations.json` beside
//! the lock file. On first open the files are copied into a timestamped
//! `backup/` directory, imported, and the `.migrated` flag makes every later
//! start skip this path entirely. Per-file failures are logged and
//! swallowed; a half-readable legacy file must not block the daemon.

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::ConfigService;
use crate::paths::DaemonPaths;
use crate::store::schema::Role;
use crate::store::Store;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyConversation {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    messages: Vec<LegacyMessage>,
}

#[derive(Debug, Deserialize)]
struct LegacyMessage {
    role: String,
    content: String,
}

const LEGACY_FILES: [&str; 2] = ["config.json", "conversations.json"];

pub fn import_legacy(
    paths: &DaemonPaths,
    store: &Store,
    config: &ConfigService,
) -> anyhow::Result<()> {
    let flag = paths.migrated_flag();
    if flag.exists() {
        return Ok(());
    }

    let present: Vec<_> = LEGACY_FILES
        .iter()
        .map(|name| paths.root().join(name))
        .filter(|p| p.exists())
        .collect();

    if !present.is_empty() {
        let backup_dir = paths
            .backup_dir()
            .join(Utc::now().format("%Y%m%dT%H%M%SZ").to_string());
        std::fs::create_dir_all(&backup_dir)?;

        for path in &present {
            let name = path.file_name().unwrap_or_default();
            if let Err(e) = std::fs::copy(path, backup_dir.join(name)) {
                warn!("legacy backup of {} failed: {}", path.display(), e);
                continue;
            }
            let result = match name.to_string_lossy().as_ref() {
                "config.json" => import_config(path, config),
                "conversations.json" => import_conversations(path, store),
                _ => Ok(()),
            };
            match result {
                Ok(()) => {
                    info!("imported legacy {}", path.display());
                    let _ = std::fs::remove_file(path);
                }
                Err(e) => warn!("legacy import of {} failed: {}", path.display(), e),
            }
        }
    }

    std::fs::write(&flag, b"")?;
    Ok(())
}

/// Replay legacy keys through the config service one at a time, so each
/// value runs the same validation and credential sealing as a live PATCH.
/// Keys the current schema no longer knows are skipped, not fatal.
fn import_config(path: &std::path::Path, config: &ConfigService) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)?;
    let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)?;
    for (key, value) in map {
        let mut patch = serde_json::Map::new();
        patch.insert(key.clone(), value);
        if let Err(e) = config.apply_patch(serde_json::Value::Object(patch)) {
            warn!("legacy config key '{}' skipped: {}", key, e);
        }
    }
    Ok(())
}

fn import_conversations(path: &std::path::Path, store: &Store) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)?;
    let conversations: Vec<LegacyConversation> = serde_json::from_str(&raw)?;
    for legacy in conversations {
        let model = legacy.model.as_deref().unwrap_or("deepseek-reasoner");
        let conv = store
            .conversations
            .create(model, legacy.system_prompt.as_deref())?;
        for message in legacy.messages {
            let Some(role) = Role::parse(&message.role) else {
                continue;
            };
            if role == Role::System {
                continue;
            }
            store
                .conversations
                .append_message(&conv.id, role, &message.content)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::EventHub;
    use std::sync::Arc;

    fn store_and_config() -> (Arc<Store>, ConfigService) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = ConfigService::new(Arc::clone(&store), Arc::new(EventHub::new()));
        (store, config)
    }

    #[test]
    fn test_import_is_one_shot_and_backs_up() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::at(dir.path()).unwrap();
        std::fs::write(
            paths.root().join("conversations.json"),
            r#"[{"model":"deepseek-chat","messages":[
                {"role":"user","content":"q"},
                {"role":"assistant","content":"a"}]}]"#,
        )
        .unwrap();
        std::fs::write(paths.root().join("config.json"), r#"{"maxMessages":3}"#).unwrap();

        let (store, config) = store_and_config();
        import_legacy(&paths, &store, &config).unwrap();

        assert!(paths.migrated_flag().exists());
        assert!(!paths.root().join("conversations.json").exists());
        assert_eq!(store.conversations.list_active().unwrap().len(), 1);
        assert_eq!(config.load().unwrap().max_messages, 3);
        // A backup copy exists under a timestamped directory.
        let backups: Vec<_> = std::fs::read_dir(paths.backup_dir()).unwrap().collect();
        assert_eq!(backups.len(), 1);

        // Running again with the flag set touches nothing.
        import_legacy(&paths, &store, &config).unwrap();
        assert_eq!(store.conversations.list_active().unwrap().len(), 1);
    }

    #[test]
    fn test_legacy_provider_keys_are_sealed_on_import() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::at(dir.path()).unwrap();
        std::fs::write(
            paths.root().join("config.json"),
            r#"{"providers":{"deepseek":{"enabled":true,"apiKey":"sk-legacy-1234"}}}"#,
        )
        .unwrap();

        let (store, config) = store_and_config();
        import_legacy(&paths, &store, &config).unwrap();

        // The stored row never carries the plaintext key.
        let stored = store.config.get("providers").unwrap().unwrap();
        assert!(!stored.contains("sk-legacy-1234"));
        // And the effective config decrypts back to it, so every later
        // load() keeps working.
        let loaded = config.load().unwrap();
        assert_eq!(
            loaded.providers.deepseek.api_key.as_deref(),
            Some("sk-legacy-1234")
        );
        assert!(loaded.providers.deepseek.enabled);
    }

    #[test]
    fn test_unknown_legacy_keys_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::at(dir.path()).unwrap();
        std::fs::write(
            paths.root().join("config.json"),
            r#"{"repoScanDepth":4,"maxMessages":7}"#,
        )
        .unwrap();

        let (store, config) = store_and_config();
        import_legacy(&paths, &store, &config).unwrap();

        // The dead key is dropped, the live one lands.
        assert!(store.config.get("repoScanDepth").unwrap().is_none());
        assert_eq!(config.load().unwrap().max_messages, 7);
        assert!(paths.migrated_flag().exists());
    }

    #[test]
    fn test_no_legacy_files_just_sets_flag() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::at(dir.path()).unwrap();
        let (store, config) = store_and_config();
        import_legacy(&paths, &store, &config).unwrap();
        assert!(paths.migrated_flag().exists());
    }
}
