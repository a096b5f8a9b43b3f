//! HTTP + WebSocket boundary.
//!
//! Everything under `/api` requires the daemon token, the event transport
//! authenticates at handshake, and the rest of the path space serves the
//! browser UI with SPA fallback.

pub mod chat_api;
pub mod config_api;
pub mod consult_api;
pub mod events_ws;
pub mod health_api;
pub mod provider_api;
pub mod rag_api;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderValue, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::ConfigService;
use crate::consult::ConsultationOrchestrator;
use crate::conversations::ConversationService;
use crate::error::DaemonError;
use crate::hub::EventHub;
use crate::rag::RagPipeline;
use crate::store::Store;

pub const TOKEN_HEADER: &str = "x-daemon-token";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub config: Arc<ConfigService>,
    pub conversations: Arc<ConversationService>,
    pub orchestrator: Arc<ConsultationOrchestrator>,
    pub rag: Arc<RagPipeline>,
    pub hub: Arc<EventHub>,
    pub token: Arc<String>,
    pub started_at: Instant,
    pub webui_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
    pub kind: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::PATCH,
            axum::http::Method::DELETE,
        ])
        .allow_headers(Any);

    let api = Router::new()
        .route("/health", get(health_api::health))
        .route("/config", get(config_api::get_config).patch(config_api::patch_config))
        .route("/providers", get(provider_api::list_providers))
        .route(
            "/providers/:id",
            get(provider_api::get_provider)
                .put(provider_api::put_provider)
                .delete(provider_api::delete_provider),
        )
        .route("/providers/:id/test", post(provider_api::test_provider))
        .route("/chat/history", get(chat_api::history))
        .route("/chat/archived/all", delete(chat_api::delete_archived))
        .route("/chat/:id", delete(chat_api::delete_conversation))
        .route("/consult", post(consult_api::consult))
        .route("/rag/documents", get(rag_api::list_documents))
        .route("/rag/documents/:id", delete(rag_api::delete_document))
        .route("/rag/documents/:id/chunks", get(rag_api::document_chunks))
        .route("/rag/upload", post(rag_api::upload))
        .route("/rag/folders", get(rag_api::list_folders).post(rag_api::create_folder))
        .route("/rag/folders/:name", delete(rag_api::delete_folder))
        .route("/rag/search", post(rag_api::search))
        .route("/rag/reindex", post(rag_api::reindex))
        .route("/rag/memory", post(rag_api::add_memory))
        .layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .nest("/api", api)
        .route("/ws", get(events_ws::ws_handler))
        .fallback(serve_static)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(600)))
        .with_state(state)
}

/// Shared-token gate for every /api route. Header or `?token=`; a miss is a
/// 401 before any handler side effect.
async fn require_token(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    request: Request,
    next: Next,
) -> Response {
    let header_token = request
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let presented = header_token.or(query.token);

    match presented {
        Some(token) if token == *state.token => next.run(request).await,
        _ => DaemonError::auth("missing or invalid daemon token").into_response(),
    }
}

/// Static UI with SPA fallback: extensionless non-API paths get the root
/// document. UI responses carry the locked-down header set.
async fn serve_static(State(state): State<AppState>, uri: Uri) -> Response {
    let path = uri.path().trim_start_matches('/');
    if path.starts_with("api/") {
        return StatusCode::NOT_FOUND.into_response();
    }

    let has_extension = path.rsplit('/').next().is_some_and(|seg| seg.contains('.'));
    let candidate = if path.is_empty() || !has_extension {
        state.webui_dir.join("index.html")
    } else {
        // Normalize out any traversal segments before touching disk.
        let mut safe = PathBuf::new();
        for segment in path.split('/') {
            if segment == ".." || segment.is_empty() {
                continue;
            }
            safe.push(segment);
        }
        state.webui_dir.join(safe)
    };

    let body = match tokio::fs::read(&candidate).await {
        Ok(bytes) => bytes,
        Err(_) if !has_extension => {
            // No UI bundle installed; keep the endpoint alive.
            b"consultd is running".to_vec()
        }
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    let mime = static_mime(&candidate);
    let mut response = Response::new(Body::from(body));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(mime));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(
            "default-src 'self'; \
             script-src 'self' https://cdn.jsdelivr.net https://unpkg.com; \
             style-src 'self' 'unsafe-inline' https://cdn.jsdelivr.net https://unpkg.com; \
             connect-src 'self' ws: wss:",
        ),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn static_mime(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "application/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::rag::EmbedClient;

    /// A fully wired state over an in-memory store, pointed at the given
    /// embed URL. Tests exercise handlers through the real router.
    pub fn state_with_embed(embed_url: &str, token: &str) -> AppState {
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
            token: Arc::new(token.to_string()),
            started_at: Instant::now(),
            webui_dir: std::env::temp_dir().join("consultd-webui-missing"),
        }
    }
}
