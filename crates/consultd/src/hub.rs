//! Process-wide pub/sub hub.
//!
//! State changes fan out to every connected client over a tokio broadcast
//! channel; the hub itself holds no per-subscriber backlog. A subscriber
//! that falls behind is dropped by the channel's overflow policy and
//! rehydrates over REST. Ordering is per-emitter FIFO only.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::store::schema::{Conversation, StoredMessage};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Proxy,
    Webui,
    Unknown,
}

impl ClientKind {
    pub fn from_query(value: Option<&str>) -> Self {
        match value {
            Some("proxy") => Self::Proxy,
            Some("webui") => Self::Webui,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistration {
    pub id: String,
    pub kind: ClientKind,
    pub connected_at: DateTime<Utc>,
}

/// Broadcast events. Wire frames are `{"event": <name>, "payload": <data>}`.
#[derive(Debug, Clone)]
pub enum Event {
    ConfigUpdated { config: Value },
    ConversationCreated { conversation: Conversation },
    ConversationMessage { conversation_id: String, message: StoredMessage },
    ConversationEnded { conversation_id: String, reason: String },
    ConversationDeleted { conversation_id: String },
    ClientsCount { count: usize },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConfigUpdated { .. } => "config:updated",
            Self::ConversationCreated { .. } => "conversation:created",
            Self::ConversationMessage { .. } => "conversation:message",
            Self::ConversationEnded { .. } => "conversation:ended",
            Self::ConversationDeleted { .. } => "conversation:deleted",
            Self::ClientsCount { .. } => "clients:count",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::ConfigUpdated { config } => config.clone(),
            Self::ConversationCreated { conversation } => {
                serde_json::to_value(conversation).unwrap_or(Value::Null)
            }
            Self::ConversationMessage {
                conversation_id,
                message,
            } => json!({
                "conversationId": conversation_id,
                "message": message,
            }),
            Self::ConversationEnded {
                conversation_id,
                reason,
            } => json!({
                "conversationId": conversation_id,
                "reason": reason,
            }),
            Self::ConversationDeleted { conversation_id } => json!({
                "conversationId": conversation_id,
            }),
            Self::ClientsCount { count } => json!(count),
        }
    }

    pub fn to_frame(&self) -> Value {
        json!({ "event": self.name(), "payload": self.payload() })
    }
}

pub struct EventHub {
    tx: broadcast::Sender<Event>,
    clients: DashMap<String, ClientRegistration>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            clients: DashMap::new(),
        }
    }

    /// Fire-and-forget. A send with no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        debug!("event {}", event.name());
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Track a new connection and re-broadcast the client count.
    pub fn register(&self, kind: ClientKind) -> String {
        let id = Uuid::new_v4().to_string();
        self.clients.insert(
            id.clone(),
            ClientRegistration {
                id: id.clone(),
                kind,
                connected_at: Utc::now(),
            },
        );
        self.publish(Event::ClientsCount {
            count: self.client_count(),
        });
        id
    }

    pub fn unregister(&self, id: &str) {
        if self.clients.remove(id).is_some() {
            self.publish(Event::ClientsCount {
                count: self.client_count(),
            });
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn clients(&self) -> Vec<ClientRegistration> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let hub = EventHub::new();
        let mut rx_a = hub.subscribe();
        let mut rx_b = hub.subscribe();

        hub.publish(Event::ConversationDeleted {
            conversation_id: "c1".into(),
        });

        for rx in [&mut rx_a, &mut rx_b] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.name(), "conversation:deleted");
            assert_eq!(event.payload()["conversationId"], "c1");
        }
    }

    #[tokio::test]
    async fn test_register_broadcasts_count() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();

        let id = hub.register(ClientKind::Webui);
        assert_eq!(hub.client_count(), 1);
        match rx.recv().await.unwrap() {
            Event::ClientsCount { count } => assert_eq!(count, 1),
            other => panic!("unexpected event {}", other.name()),
        }

        hub.unregister(&id);
        assert_eq!(hub.client_count(), 0);
        match rx.recv().await.unwrap() {
            Event::ClientsCount { count } => assert_eq!(count, 0),
            other => panic!("unexpected event {}", other.name()),
        }

        // Unregistering twice does not emit again.
        hub.unregister(&id);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_client_kind_from_query() {
        assert_eq!(ClientKind::from_query(Some("proxy")), ClientKind::Proxy);
        assert_eq!(ClientKind::from_query(Some("webui")), ClientKind::Webui);
        assert_eq!(ClientKind::from_query(Some("other")), ClientKind::Unknown);
        assert_eq!(ClientKind::from_query(None), ClientKind::Unknown);
    }

    #[test]
    fn test_frame_shape() {
        let frame = Event::ClientsCount { count: 3 }.to_frame();
        assert_eq!(frame["event"], "clients:count");
        assert_eq!(frame["payload"], 3);
    }
}
