//! Shared fixtures: a daemon router over an in-memory store, plus stub
//! embedding and chat-completion servers on ephemeral loopback ports.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use consultd::api::{build_router, AppState};
use consultd::config::ConfigService;
use consultd::consult::ConsultationOrchestrator;
use consultd::conversations::ConversationService;
use consultd::hub::EventHub;
use consultd::rag::{EmbedClient, RagPipeline};
use consultd::store::Store;

pub const TEST_TOKEN: &str = "test-token-0123456789abcdef";

/// Deterministic 26-dim letter-frequency embedding. Stable across calls so
/// similarity comparisons behave.
pub fn letter_embedding(text: &str) -> Vec<f32> {
    let mut counts = [0f32; 26];
    for c in text.to_lowercase().chars() {
        if c.is_ascii_lowercase() {
            counts[(c as u8 - b'a') as usize] += 1.0;
        }
    }
    counts.to_vec()
}

async fn embed_handler(Json(body): Json<Value>) -> Json<Value> {
    let texts: Vec<String> = body["texts"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let vectors: Vec<Vec<f32>> = texts.iter().map(|t| letter_embedding(t)).collect();
    Json(json!({
        "vectors": vectors,
        "dim": 26,
        "model": "letter-stub",
    }))
}

/// Serve a stub /embed endpoint; returns its base URL.
pub async fn spawn_embed_stub() -> String {
    let app = Router::new().route("/embed", post(embed_handler));
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://127.0.0.1:{}/embed", port)
}

#[derive(Clone)]
struct ProviderStubState {
    answers: Arc<Mutex<VecDeque<Value>>>,
}

async fn completions_handler(
    State(state): State<ProviderStubState>,
    Json(_body): Json<Value>,
) -> Json<Value> {
    let next = state
        .answers
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| json!({"content": "stub answer"}));
    let content = next["content"].as_str().unwrap_or("stub answer");
    let reasoning = next.get("reasoning").and_then(|v| v.as_str());
    Json(json!({
        "choices": [{
            "message": {
                "content": content,
                "reasoning_content": reasoning,
            },
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15},
    }))
}

/// Serve a stub OpenAI-compatible /chat/completions endpoint that replays
/// the queued answers in order. Returns its base URL.
pub async fn spawn_provider_stub(answers: Vec<Value>) -> String {
    let state = ProviderStubState {
        answers: Arc::new(Mutex::new(answers.into_iter().collect())),
    };
    let app = Router::new()
        .route("/chat/completions", post(completions_handler))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://127.0.0.1:{}", port)
}

/// Fully wired daemon state over an in-memory store.
pub fn daemon_state(embed_url: &str) -> AppState {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let hub = Arc::new(EventHub::new());
    let config = Arc::new(ConfigService::new(Arc::clone(&store), Arc::clone(&hub)));
    let conversations = Arc::new(ConversationService::new(
        Arc::clone(&store),
        Arc::clone(&config),
        Arc::clone(&hub),
    ));
    let rag = Arc::new(RagPipeline::new(
        Arc::clone(&store),
        EmbedClient::new(embed_url),
    ));
    let orchestrator = Arc::new(ConsultationOrchestrator::new(
        Arc::clone(&conversations),
        Arc::clone(&config),
        Arc::clone(&rag),
    ));
    AppState {
        store,
        config,
        conversations,
        orchestrator,
        rag,
        hub,
        token: Arc::new(TEST_TOKEN.to_string()),
        started_at: Instant::now(),
        webui_dir: std::env::temp_dir().join("consultd-test-webui"),
    }
}

/// Serve the real router over the given state; returns `http://...:port`.
pub async fn spawn_daemon(state: AppState) -> String {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://127.0.0.1:{}", port)
}

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}
