//! The consult / continue / end flow against a stub provider.

mod helpers;

use helpers::{client, daemon_state, spawn_daemon, spawn_embed_stub, spawn_provider_stub, TEST_TOKEN};
use serde_json::json;

async fn configured_daemon(provider_url: &str) -> String {
    let embed_url = spawn_embed_stub().await;
    let state = daemon_state(&embed_url);
    state
        .config
        .apply_patch(json!({
            "defaultModel": "deepseek-chat",
            "maxMessages": 2,
            "providers": {"deepseek": {
                "enabled": true,
                "apiKey": "X",
                "baseUrl": provider_url,
            }}
        }))
        .unwrap();
    spawn_daemon(state).await
}

#[tokio::test]
async fn consult_continue_end_walks_the_cap() {
    let provider_url = spawn_provider_stub(vec![
        json!({"content": "A1"}),
        json!({"content": "A2"}),
    ])
    .await;
    let base = configured_daemon(&provider_url).await;
    let http = client();

    // consult: 2 messages persisted, room to continue.
    let response = http
        .post(format!("{}/api/consult", base))
        .header("x-daemon-token", TEST_TOKEN)
        .json(&json!({"message": "Q1", "useRag": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["response"], "A1");
    assert_eq!(body["model"], "deepseek-chat");
    let conversation_id = body["conversationId"].as_str().unwrap().to_string();

    let history: serde_json::Value = http
        .get(format!("{}/api/chat/history", base))
        .header("x-daemon-token", TEST_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["active"][0]["id"], conversation_id.as_str());
    assert_eq!(history["active"][0]["messageCount"], 2);

    // An empty question never reaches the provider.
    let response = http
        .post(format!("{}/api/consult", base))
        .header("x-daemon-token", TEST_TOKEN)
        .json(&json!({"message": "", "useRag": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400, "empty question is a validation error");

    // Deleting the conversation over REST clears the history.
    let response = http
        .delete(format!("{}/api/chat/{}", base, conversation_id))
        .header("x-daemon-token", TEST_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn orchestrator_flow_matches_the_state_machine() {
    let provider_url = spawn_provider_stub(vec![
        json!({"content": "A1"}),
        json!({"content": "A2"}),
    ])
    .await;
    let embed_url = spawn_embed_stub().await;
    let state = daemon_state(&embed_url);
    state
        .config
        .apply_patch(json!({
            "defaultModel": "deepseek-chat",
            "maxMessages": 2,
            "providers": {"deepseek": {"enabled": true, "apiKey": "X", "baseUrl": provider_url}}
        }))
        .unwrap();

    // consult
    let outcome = state
        .orchestrator
        .consult(consultd::ConsultOptions {
            mode: Some("debug".to_string()),
            use_rag: false,
            ..consultd::ConsultOptions::question("Q1")
        })
        .await
        .unwrap();
    assert_eq!(outcome.answer, "A1");
    assert_eq!(outcome.message_count, 2);
    assert!(outcome.can_continue);
    assert_eq!(outcome.mode, "debug");

    // continue: reaches the 2x2 cap.
    let outcome2 = state
        .orchestrator
        .continue_conversation(&outcome.conversation_id, "Q2", Default::default())
        .await
        .unwrap();
    assert_eq!(outcome2.answer, "A2");
    assert_eq!(outcome2.message_count, 4);
    assert!(!outcome2.can_continue);

    // continue past the cap: LIMIT_EXCEEDED and auto-archive as timeout.
    let err = state
        .orchestrator
        .continue_conversation(&outcome.conversation_id, "Q3", Default::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "LIMIT_EXCEEDED");
    let (conversation, messages) = state.conversations.get(&outcome.conversation_id).unwrap();
    assert_eq!(
        conversation.status,
        consultd::store::schema::ConversationStatus::Archived
    );
    assert_eq!(
        conversation.end_reason,
        Some(consultd::store::schema::EndReason::Timeout)
    );
    assert_eq!(messages.len(), 4, "failed append persists nothing");

    // end on an archived conversation reports why it cannot end it.
    let err = state.orchestrator.end(&outcome.conversation_id).unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
    assert!(err.to_string().contains("timeout"));
}

#[tokio::test]
async fn end_completes_an_open_conversation() {
    let provider_url = spawn_provider_stub(vec![json!({"content": "A1"})]).await;
    let embed_url = spawn_embed_stub().await;
    let state = daemon_state(&embed_url);
    state
        .config
        .apply_patch(json!({
            "defaultModel": "deepseek-chat",
            "providers": {"deepseek": {"enabled": true, "apiKey": "X", "baseUrl": provider_url}}
        }))
        .unwrap();

    let outcome = state
        .orchestrator
        .consult(consultd::ConsultOptions {
            use_rag: false,
            ..consultd::ConsultOptions::question("Q1")
        })
        .await
        .unwrap();

    let ended = state.orchestrator.end(&outcome.conversation_id).unwrap();
    assert_eq!(ended.status, "ended");
    assert_eq!(ended.total_messages, 2);
    let (conversation, _) = state.conversations.get(&outcome.conversation_id).unwrap();
    assert_eq!(
        conversation.end_reason,
        Some(consultd::store::schema::EndReason::Completed)
    );
}

#[tokio::test]
async fn consult_without_credentials_is_auth_error() {
    let embed_url = spawn_embed_stub().await;
    let state = daemon_state(&embed_url);
    let err = state
        .orchestrator
        .consult(consultd::ConsultOptions::question("Q"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "AUTH_ERROR");
}

#[tokio::test]
async fn reasoning_content_surfaces_as_thinking_summary() {
    let provider_url = spawn_provider_stub(vec![json!({
        "content": "A1",
        "reasoning": "first line of thought\nsecond line of thought",
    })])
    .await;
    let embed_url = spawn_embed_stub().await;
    let state = daemon_state(&embed_url);
    state
        .config
        .apply_patch(json!({
            "defaultModel": "deepseek-reasoner",
            "providers": {"deepseek": {"enabled": true, "apiKey": "X", "baseUrl": provider_url}}
        }))
        .unwrap();

    let outcome = state
        .orchestrator
        .consult(consultd::ConsultOptions {
            use_rag: false,
            ..consultd::ConsultOptions::question("Q1")
        })
        .await
        .unwrap();
    let thinking = outcome.metadata.thinking.unwrap();
    assert!(thinking.summary.starts_with("first line of thought"));
    assert_eq!(outcome.metadata.tokens_used, Some(15));
}
