//! GET / PATCH /api/config

use axum::extract::State;
use axum::Json;
use serde_json::Value;

use crate::api::AppState;
use crate::config::masked_snapshot;
use crate::error::Result;

pub async fn get_config(State(state): State<AppState>) -> Result<Json<Value>> {
    let config = state.config.load()?;
    Ok(Json(masked_snapshot(&config)))
}

/// Partial update; unknown keys and empty patches are 400s. The broadcast
/// rides on the config service.
pub async fn patch_config(
    State(state): State<AppState>,
    Json(patch): Json<Value>,
) -> Result<Json<Value>> {
    let config = state.config.apply_patch(patch)?;
    Ok(Json(masked_snapshot(&config)))
}
