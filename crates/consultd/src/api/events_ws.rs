//! WebSocket event transport and request/response operations.
//!
//! One socket per client: the daemon pushes `{"event", "payload"}` frames
//! as state changes, answers `{"type":"ping"}` with `{"type":"pong"}`, and
//! serves named operations `{"type":"request","id","op","payload"}` with a
//! single `{"type":"response","id",...}` ack each. Failed operations answer
//! `{success:false, error}` on their ack; the hub itself never emits error
//! events.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::api::{AppState, TokenQuery};
use crate::consult::ConsultOptions;
use crate::error::{DaemonError, Result};
use crate::hub::ClientKind;
use crate::rag::RetrieveFilters;

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if query.token.as_deref() != Some(state.token.as_str()) {
        return DaemonError::auth("missing or invalid daemon token").into_response();
    }
    let kind = ClientKind::from_query(query.kind.as_deref());
    ws.on_upgrade(move |socket| handle_socket(state, socket, kind))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    Ping,
    Request {
        id: Value,
        op: String,
        #[serde(default)]
        payload: Value,
    },
}

async fn handle_socket(state: AppState, socket: WebSocket, kind: ClientKind) {
    let client_id = state.hub.register(kind);
    info!("client {} connected ({:?})", client_id, kind);

    let mut events = state.hub.subscribe();
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let frame = event.to_frame().to_string();
                        if sink.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        // Overflow policy: a subscriber that cannot keep up
                        // is cut loose and resyncs over REST.
                        warn!("client {} lagged {} events, disconnecting", client_id, skipped);
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
                            debug!("client {} sent an unparseable frame", client_id);
                            continue;
                        };
                        match frame {
                            ClientFrame::Ping => {
                                let pong = json!({"type": "pong"}).to_string();
                                if sink.send(Message::Text(pong)).await.is_err() {
                                    break;
                                }
                            }
                            ClientFrame::Request { id, op, payload } => {
                                let reply = match dispatch(&state, &op, payload).await {
                                    Ok(data) => json!({
                                        "type": "response",
                                        "id": id,
                                        "success": true,
                                        "data": data,
                                    }),
                                    Err(e) => json!({
                                        "type": "response",
                                        "id": id,
                                        "success": false,
                                        "error": e.public_message(),
                                        "code": e.code(),
                                    }),
                                };
                                if sink.send(Message::Text(reply.to_string())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("client {} socket error: {}", client_id, e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.hub.unregister(&client_id);
    info!("client {} disconnected", client_id);
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsultPayload {
    question: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    doc_ids: Option<Vec<String>>,
    #[serde(default)]
    doc_titles: Option<Vec<String>>,
    #[serde(default)]
    folder: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContinuePayload {
    conversation_id: String,
    message: String,
    #[serde(default)]
    doc_ids: Option<Vec<String>>,
    #[serde(default)]
    doc_titles: Option<Vec<String>>,
    #[serde(default)]
    folder: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationIdPayload {
    conversation_id: String,
}

/// Named operations on the shared socket.
async fn dispatch(state: &AppState, op: &str, payload: Value) -> Result<Value> {
    match op {
        "config:get" => {
            let config = state.config.load()?;
            Ok(crate::config::masked_snapshot(&config))
        }
        "config:update" => {
            let config = state.config.apply_patch(payload)?;
            Ok(crate::config::masked_snapshot(&config))
        }
        "conversation:list" => {
            let active = state.conversations.list_active()?;
            let archived = state.conversations.list_archived()?;
            Ok(json!({"active": active, "archived": archived}))
        }
        "conversation:get" => {
            let args: ConversationIdPayload = parse_payload(payload)?;
            let (conversation, messages) = state.conversations.get(&args.conversation_id)?;
            Ok(json!({"conversation": conversation, "messages": messages}))
        }
        "conversation:delete" => {
            let args: ConversationIdPayload = parse_payload(payload)?;
            state.conversations.delete(&args.conversation_id)?;
            Ok(json!({"conversationId": args.conversation_id}))
        }
        "consult" => {
            let args: ConsultPayload = parse_payload(payload)?;
            let outcome = state
                .orchestrator
                .consult(ConsultOptions {
                    question: args.question,
                    mode: args.mode,
                    context: args.context,
                    doc_ids: args.doc_ids,
                    doc_titles: args.doc_titles,
                    folder: args.folder,
                    model: args.model,
                    system_prompt: None,
                    use_rag: true,
                })
                .await?;
            Ok(serde_json::to_value(outcome).map_err(anyhow::Error::new)?)
        }
        "consult:continue" => {
            let args: ContinuePayload = parse_payload(payload)?;
            let outcome = state
                .orchestrator
                .continue_conversation(
                    &args.conversation_id,
                    &args.message,
                    RetrieveFilters {
                        doc_ids: args.doc_ids,
                        doc_titles: args.doc_titles,
                        folder: args.folder,
                        ..Default::default()
                    },
                )
                .await?;
            Ok(serde_json::to_value(outcome).map_err(anyhow::Error::new)?)
        }
        "consult:end" => {
            let args: ConversationIdPayload = parse_payload(payload)?;
            let outcome = state.orchestrator.end(&args.conversation_id)?;
            Ok(serde_json::to_value(outcome).map_err(anyhow::Error::new)?)
        }
        other => Err(DaemonError::validation(
            "op",
            format!("unknown operation '{}'", other),
        )),
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| DaemonError::validation("payload", e.to_string()))
}
