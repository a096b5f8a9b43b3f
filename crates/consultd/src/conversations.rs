//! Conversation service: CRUD and state transitions over the store, with
//! hub events emitted strictly after each commit.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use crate::config::ConfigService;
use crate::error::{DaemonError, Result};
use crate::hub::{Event, EventHub};
use crate::store::schema::{Conversation, EndReason, Role, StoredMessage};
use crate::store::Store;

/// Idle window after which the sweeper archives an active conversation.
pub const STALE_AFTER_MINUTES: i64 = 5;
/// Sweep cadence.
pub const SWEEP_INTERVAL_SECS: u64 = 60;

pub struct ConversationService {
    store: Arc<Store>,
    config: Arc<ConfigService>,
    hub: Arc<EventHub>,
}

impl ConversationService {
    pub fn new(store: Arc<Store>, config: Arc<ConfigService>, hub: Arc<EventHub>) -> Self {
        Self { store, config, hub }
    }

    pub fn create(&self, model: &str, system_prompt: Option<&str>) -> Result<Conversation> {
        let conversation = self.store.conversations.create(model, system_prompt)?;
        self.hub.publish(Event::ConversationCreated {
            conversation: conversation.clone(),
        });
        Ok(conversation)
    }

    pub fn get(&self, id: &str) -> Result<(Conversation, Vec<StoredMessage>)> {
        let conversation = self
            .store
            .conversations
            .get(id)?
            .ok_or_else(|| DaemonError::not_found(format!("conversation {}", id)))?;
        let messages = self.store.conversations.messages(id)?;
        Ok((conversation, messages))
    }

    pub fn list_active(&self) -> Result<Vec<Conversation>> {
        Ok(self.store.conversations.list_active()?)
    }

    pub fn list_archived(&self) -> Result<Vec<Conversation>> {
        Ok(self.store.conversations.list_archived()?)
    }

    pub fn message_count(&self, id: &str) -> Result<usize> {
        Ok(self.store.conversations.message_count(id)?)
    }

    /// Append one turn. Fails LIMIT_EXCEEDED at the cap, NOT_FOUND for an
    /// unknown id; the broadcast follows the commit.
    pub fn add_message(&self, id: &str, role: Role, content: &str) -> Result<StoredMessage> {
        let conversation = self
            .store
            .conversations
            .get(id)?
            .ok_or_else(|| DaemonError::not_found(format!("conversation {}", id)))?;

        let cap = self.config.load()?.message_cap();
        let count = self.store.conversations.message_count(id)?;
        if count >= cap {
            return Err(DaemonError::LimitExceeded(format!(
                "conversation {} reached its {}-message cap",
                conversation.id, cap
            )));
        }

        let message = self.store.conversations.append_message(id, role, content)?;
        self.hub.publish(Event::ConversationMessage {
            conversation_id: id.to_string(),
            message: message.clone(),
        });
        Ok(message)
    }

    /// Archive with a reason. Returns false when already archived; the event
    /// fires only on an actual transition.
    pub fn archive(&self, id: &str, reason: EndReason) -> Result<bool> {
        if self.store.conversations.get(id)?.is_none() {
            return Err(DaemonError::not_found(format!("conversation {}", id)));
        }
        let changed = self.store.conversations.archive(id, reason)?;
        if changed {
            self.hub.publish(Event::ConversationEnded {
                conversation_id: id.to_string(),
                reason: reason.as_str().to_string(),
            });
        }
        Ok(changed)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let deleted = self.store.conversations.delete(id)?;
        if deleted == 0 {
            return Err(DaemonError::not_found(format!("conversation {}", id)));
        }
        self.hub.publish(Event::ConversationDeleted {
            conversation_id: id.to_string(),
        });
        Ok(())
    }

    pub fn delete_archived(&self) -> Result<usize> {
        let ids: Vec<String> = self
            .store
            .conversations
            .list_archived()?
            .into_iter()
            .map(|c| c.id)
            .collect();
        let deleted = self.store.conversations.delete_archived()?;
        for id in ids {
            self.hub.publish(Event::ConversationDeleted {
                conversation_id: id,
            });
        }
        Ok(deleted)
    }

    /// One sweep pass: archive conversations idle past the window, then
    /// emit one ended event per affected id. Errors are the caller's to log
    /// and swallow.
    pub fn sweep_stale(&self) -> Result<Vec<String>> {
        let cutoff = Utc::now() - ChronoDuration::minutes(STALE_AFTER_MINUTES);
        let swept = self.store.conversations.archive_stale(cutoff)?;
        if !swept.is_empty() {
            info!("stale sweep archived {} conversation(s)", swept.len());
        }
        for id in &swept {
            self.hub.publish(Event::ConversationEnded {
                conversation_id: id.clone(),
                reason: EndReason::Timeout.as_str().to_string(),
            });
        }
        Ok(swept)
    }

    /// Background sweep loop; runs once per interval until the daemon stops.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_stale() {
                        warn!("stale sweep failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
