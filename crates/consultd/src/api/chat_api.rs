//! /api/chat - conversation history and deletion.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use crate::api::AppState;
use crate::error::Result;
use crate::store::schema::Conversation;

fn history_entry(state: &AppState, conversation: &Conversation) -> Value {
    let message_count = state
        .conversations
        .message_count(&conversation.id)
        .unwrap_or(0);
    let mut entry = serde_json::to_value(conversation).unwrap_or(Value::Null);
    if let Value::Object(ref mut map) = entry {
        map.insert("messageCount".to_string(), json!(message_count));
    }
    entry
}

pub async fn history(State(state): State<AppState>) -> Result<Json<Value>> {
    let active: Vec<Value> = state
        .conversations
        .list_active()?
        .iter()
        .map(|c| history_entry(&state, c))
        .collect();
    let archived: Vec<Value> = state
        .conversations
        .list_archived()?
        .iter()
        .map(|c| history_entry(&state, c))
        .collect();
    Ok(Json(json!({ "active": active, "archived": archived })))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    state.conversations.delete(&id)?;
    Ok(Json(json!({"success": true, "conversationId": id})))
}

pub async fn delete_archived(State(state): State<AppState>) -> Result<Json<Value>> {
    let deleted = state.conversations.delete_archived()?;
    Ok(Json(json!({"success": true, "deleted": deleted})))
}
