//! /api/rag - corpus management, search, reindex, memories.

use axum::extract::{Multipart, Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::api::AppState;
use crate::error::{DaemonError, Result};
use crate::rag::{IfExists, RetrieveFilters, UploadInput};
use crate::store::schema::MemoryCategory;

const SNIPPET_LIMIT: usize = 240;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub folder: Option<String>,
}

pub async fn list_documents(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>> {
    let documents = state.store.documents.list_documents(query.folder.as_deref())?;
    Ok(Json(json!({ "documents": documents })))
}

pub async fn delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let deleted = state.store.documents.delete_document(&id)?;
    if deleted == 0 {
        return Err(DaemonError::not_found(format!("document {}", id)));
    }
    Ok(Json(json!({"success": true, "documentId": id})))
}

pub async fn document_chunks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let document = state
        .store
        .documents
        .get_document(&id)?
        .ok_or_else(|| DaemonError::not_found(format!("document {}", id)))?;
    let chunks = state.store.documents.chunks_for_document(&id)?;
    Ok(Json(json!({ "document": document, "chunks": chunks })))
}

/// Multipart upload: `files[]` parts plus optional `folder` and `ifExists`
/// form fields. An embedding outage fails the whole batch with 503.
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>> {
    let mut inputs: Vec<UploadInput> = Vec::new();
    let mut folder: Option<String> = None;
    let mut if_exists = IfExists::Skip;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| DaemonError::validation("multipart", e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "folder" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| DaemonError::validation("folder", e.to_string()))?;
                if !value.trim().is_empty() {
                    folder = Some(value.trim().to_string());
                }
            }
            "ifExists" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| DaemonError::validation("ifExists", e.to_string()))?;
                if_exists = match value.trim() {
                    "skip" | "" => IfExists::Skip,
                    "allow" => IfExists::Allow,
                    "replace" => IfExists::Replace,
                    other => {
                        return Err(DaemonError::validation(
                            "ifExists",
                            format!("unknown mode '{}'", other),
                        ))
                    }
                };
            }
            _ => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| name.clone());
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| DaemonError::validation("files", e.to_string()))?;
                inputs.push(UploadInput {
                    file_name,
                    bytes: bytes.to_vec(),
                });
            }
        }
    }

    if inputs.is_empty() {
        return Err(DaemonError::validation("files", "no files in upload"));
    }

    info!("upload: {} file(s), ifExists={:?}", inputs.len(), if_exists);
    let reports = state
        .rag
        .ingest_batch(inputs, if_exists, folder.as_deref())
        .await?;
    Ok(Json(json!({ "results": reports })))
}

pub async fn list_folders(State(state): State<AppState>) -> Result<Json<Value>> {
    let folders = state.store.documents.list_folders()?;
    Ok(Json(json!({ "folders": folders })))
}

#[derive(Debug, Deserialize)]
pub struct CreateFolderBody {
    pub name: String,
}

/// Folders exist only as document labels; creating one just validates the
/// name so the UI can show it immediately.
pub async fn create_folder(
    State(_state): State<AppState>,
    Json(body): Json<CreateFolderBody>,
) -> Result<Json<Value>> {
    let name = body.name.trim();
    if name.is_empty() || name.contains('/') {
        return Err(DaemonError::validation("name", "invalid folder name"));
    }
    Ok(Json(json!({"success": true, "folder": name})))
}

pub async fn delete_folder(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    let moved = state.store.documents.clear_folder(&name)?;
    Ok(Json(json!({"success": true, "folder": name, "documentsMoved": moved})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchBody {
    pub query: String,
    #[serde(flatten)]
    pub filters: RetrieveFilters,
}

pub async fn search(
    State(state): State<AppState>,
    Json(body): Json<SearchBody>,
) -> Result<Json<Value>> {
    if body.query.trim().is_empty() {
        return Err(DaemonError::validation("query", "must not be empty"));
    }
    let retrieval = state.rag.retrieve(&body.query, &body.filters).await?;
    let hits: Vec<Value> = retrieval
        .hits
        .iter()
        .map(|hit| {
            json!({
                "score": hit.score,
                "title": hit.title,
                "sourceType": hit.source_type,
                "chunkIndex": hit.chunk_index,
                "snippet": snippet(&hit.content),
            })
        })
        .collect();
    Ok(Json(json!({
        "query": body.query,
        "contextPreview": retrieval.context,
        "hits": hits,
    })))
}

pub async fn reindex(State(state): State<AppState>) -> Result<Json<Value>> {
    let count = state.rag.reindex().await?;
    Ok(Json(json!({"success": true, "chunks": count})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMemoryBody {
    pub category: String,
    pub title: String,
    pub content: String,
}

pub async fn add_memory(
    State(state): State<AppState>,
    Json(body): Json<AddMemoryBody>,
) -> Result<Json<Value>> {
    let category = MemoryCategory::parse(&body.category)
        .ok_or_else(|| DaemonError::validation("category", format!("unknown category '{}'", body.category)))?;
    if body.title.trim().is_empty() {
        return Err(DaemonError::validation("title", "must not be empty"));
    }
    if body.content.trim().is_empty() {
        return Err(DaemonError::validation("content", "must not be empty"));
    }
    let note = state
        .rag
        .add_memory(category, body.title.trim(), &body.content)
        .await?;
    Ok(Json(json!({"success": true, "memory": note})))
}

/// Trim hit content for the search response.
fn snippet(content: &str) -> String {
    if content.chars().count() <= SNIPPET_LIMIT {
        return content.to_string();
    }
    let cut: String = content.chars().take(SNIPPET_LIMIT).collect();
    format!("{}\u{2026}", cut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snippet_trims_past_240() {
        let short = "a".repeat(240);
        assert_eq!(snippet(&short), short);

        let long = "b".repeat(300);
        let cut = snippet(&long);
        assert_eq!(cut.chars().count(), 241);
        assert!(cut.ends_with('\u{2026}'));
    }
}
