//! Shared-token boundary behaviour.

mod helpers;

use helpers::{client, daemon_state, spawn_daemon, TEST_TOKEN};

#[tokio::test]
async fn health_requires_the_daemon_token() {
    let state = daemon_state("http://127.0.0.1:9/embed");
    let base = spawn_daemon(state).await;

    // No token: 401, no side effects.
    let response = client()
        .get(format!("{}/api/health", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Wrong token: still 401.
    let response = client()
        .get(format!("{}/api/health", base))
        .header("x-daemon-token", "wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Header token: 200 with the health shape.
    let response = client()
        .get(format!("{}/api/health", base))
        .header("x-daemon-token", TEST_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["clients"].is_number());
    assert!(body["uptime"].is_number());
    assert!(body["embedService"]["available"].is_boolean());
}

#[tokio::test]
async fn query_token_works_too() {
    let state = daemon_state("http://127.0.0.1:9/embed");
    let base = spawn_daemon(state).await;

    let response = client()
        .get(format!("{}/api/config?token={}", base, TEST_TOKEN))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["defaultModel"], "deepseek-reasoner");
}

#[tokio::test]
async fn failed_auth_has_no_side_effects() {
    let state = daemon_state("http://127.0.0.1:9/embed");
    let conversations = state.conversations.clone();
    let base = spawn_daemon(state).await;

    // An unauthenticated delete must not touch the store.
    let conversation = conversations.create("deepseek-chat", None).unwrap();
    let response = client()
        .delete(format!("{}/api/chat/{}", base, conversation.id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert!(conversations.get(&conversation.id).is_ok());
}

#[tokio::test]
async fn static_ui_is_open_and_carries_security_headers() {
    let state = daemon_state("http://127.0.0.1:9/embed");
    let base = spawn_daemon(state).await;

    let response = client().get(format!("{}/", base)).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-frame-options"], "DENY");
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    assert_eq!(response.headers()["cache-control"], "no-store");
    assert!(response
        .headers()
        .get("content-security-policy")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("'self'"));

    // SPA fallback: extensionless path answers like the root.
    let response = client()
        .get(format!("{}/settings/providers", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}
