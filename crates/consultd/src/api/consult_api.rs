//! POST /api/consult - one-shot consultation over REST.
//!
//! Runs through the same orchestrator as the socket-driven consult, so it
//! writes the same rows and emits the same events.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::AppState;
use crate::consult::ConsultOptions;
use crate::error::Result;

fn default_use_rag() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsultBody {
    pub message: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_use_rag")]
    pub use_rag: bool,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

pub async fn consult(
    State(state): State<AppState>,
    Json(body): Json<ConsultBody>,
) -> Result<Json<Value>> {
    // An explicit model wins; a bare provider name selects that provider's
    // first catalogue model.
    let model = body.model.or_else(|| {
        let provider = crate::provider::ProviderId::parse(body.provider.as_deref()?)?;
        crate::provider::MODEL_CATALOGUE
            .iter()
            .find(|spec| spec.provider == provider)
            .map(|spec| spec.id.to_string())
    });
    let options = ConsultOptions {
        question: body.message,
        model,
        system_prompt: body.system_prompt,
        use_rag: body.use_rag,
        ..Default::default()
    };
    let outcome = state.orchestrator.consult(options).await?;
    Ok(Json(json!({
        "response": outcome.answer,
        "model": outcome.model,
        "usage": outcome.metadata.tokens_used,
        "ragContext": outcome.rag_context,
        "conversationId": outcome.conversation_id,
    })))
}
