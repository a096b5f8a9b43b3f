//! GET /api/health

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::api::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let embed = state.rag.embed_client().health().await;
    Json(json!({
        "status": "ok",
        "clients": state.hub.client_count(),
        "uptime": state.started_at.elapsed().as_secs(),
        "embedService": embed,
    }))
}
