//! RAG pipeline: ingest files into documents/chunks/vectors, serve top-K
//! cosine retrieval, mirror memory notes into the same corpus.

pub mod chunker;
pub mod embed_client;
pub mod similarity;

pub use chunker::{chunk_text, estimate_tokens, normalize_whitespace, ChunkConfig};
pub use embed_client::{EmbedClient, EmbedHealth, EmbedResponse};
pub use similarity::{cosine_similarity, decode_vector, encode_vector};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DaemonError, Result};
use crate::store::schema::{Document, MemoryCategory, MemoryNote, SourceType};
use crate::store::Store;

/// Chunks per embedding call during ingest and reindex.
pub const EMBED_BATCH_SIZE: usize = 50;
pub const DEFAULT_TOP_K: usize = 4;
pub const DEFAULT_MIN_SCORE: f32 = 0.35;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IfExists {
    #[default]
    Skip,
    Allow,
    Replace,
}

#[derive(Debug, Clone)]
pub struct UploadInput {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub chunk_count: usize,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveFilters {
    #[serde(default)]
    pub doc_ids: Option<Vec<String>>,
    #[serde(default)]
    pub doc_titles: Option<Vec<String>>,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub min_score: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedChunk {
    pub score: f32,
    pub title: String,
    pub source_type: SourceType,
    pub chunk_index: i32,
    pub content: String,
    pub document_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Retrieval {
    pub hits: Vec<RetrievedChunk>,
    /// Rendered context paragraph, absent when nothing cleared the score bar.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

pub struct RagPipeline {
    store: Arc<Store>,
    embed: EmbedClient,
    chunking: ChunkConfig,
}

impl RagPipeline {
    pub fn new(store: Arc<Store>, embed: EmbedClient) -> Self {
        Self {
            store,
            embed,
            chunking: ChunkConfig::default(),
        }
    }

    pub fn embed_client(&self) -> &EmbedClient {
        &self.embed
    }

    /// Ingest a batch of uploaded files under one duplicate policy.
    pub async fn ingest_batch(
        &self,
        inputs: Vec<UploadInput>,
        if_exists: IfExists,
        folder: Option<&str>,
    ) -> Result<Vec<IngestReport>> {
        let mut reports = Vec::with_capacity(inputs.len());
        // Within-batch duplicate tracking for skip/replace, by normalised
        // title.
        let mut seen_titles: Vec<String> = Vec::new();

        for input in inputs {
            let title = input.file_name.clone();
            let normalized = title.trim().to_lowercase();

            if if_exists != IfExists::Allow {
                if seen_titles.contains(&normalized) {
                    reports.push(IngestReport {
                        title,
                        document_id: None,
                        chunk_count: 0,
                        skipped: true,
                        error: None,
                    });
                    continue;
                }
                seen_titles.push(normalized.clone());
            }

            let existing = self.store.documents.find_by_title(&title)?;
            match if_exists {
                IfExists::Skip if !existing.is_empty() => {
                    reports.push(IngestReport {
                        title,
                        document_id: None,
                        chunk_count: 0,
                        skipped: true,
                        error: None,
                    });
                    continue;
                }
                IfExists::Replace => {
                    for doc in &existing {
                        self.store.documents.delete_document(&doc.id)?;
                    }
                }
                _ => {}
            }

            let report = match self.ingest_file(input, folder).await {
                Ok((document, chunk_count)) => IngestReport {
                    title,
                    document_id: Some(document.id),
                    chunk_count,
                    skipped: false,
                    error: None,
                },
                Err(DaemonError::ExternalUnavailable(message)) => {
                    // Embedding outage fails the whole upload; callers map
                    // this to 503.
                    return Err(DaemonError::ExternalUnavailable(message));
                }
                Err(e) => {
                    warn!("ingest of '{}' failed: {}", title, e);
                    IngestReport {
                        title,
                        document_id: None,
                        chunk_count: 0,
                        skipped: false,
                        error: Some(e.public_message()),
                    }
                }
            };
            reports.push(report);
        }
        Ok(reports)
    }

    async fn ingest_file(
        &self,
        input: UploadInput,
        folder: Option<&str>,
    ) -> Result<(Document, usize)> {
        let mime = infer_mime(&input.file_name);
        let file_name = input.file_name.clone();
        let text = tokio::task::spawn_blocking(move || extract_text(&input.file_name, &input.bytes))
            .await
            .map_err(|e| DaemonError::internal(format!("extraction task failed: {}", e)))??;

        self.ingest_text(&file_name, &text, SourceType::Upload, None, Some(mime), folder)
            .await
    }

    /// Shared document -> chunks -> vectors path.
    pub async fn ingest_text(
        &self,
        title: &str,
        text: &str,
        source_type: SourceType,
        source_uri: Option<&str>,
        mime_type: Option<&str>,
        folder: Option<&str>,
    ) -> Result<(Document, usize)> {
        let pieces = chunk_text(text, self.chunking);
        if pieces.is_empty() {
            return Err(DaemonError::validation("file", "no extractable text"));
        }

        let document = self.store.documents.create_document(
            title,
            source_type,
            source_uri,
            mime_type,
            folder,
        )?;
        let contents: Vec<(String, i32)> = pieces
            .iter()
            .map(|piece| (piece.clone(), estimate_tokens(piece)))
            .collect();
        let chunks = self.store.documents.insert_chunks(&document.id, &contents)?;

        match self.embed_chunks(&chunks.iter().map(|c| (c.id.clone(), c.content.clone())).collect::<Vec<_>>()).await {
            Ok(()) => {}
            Err(e) => {
                // Keep the store consistent: no document without vectors.
                let _ = self.store.documents.delete_document(&document.id);
                return Err(e);
            }
        }

        info!("ingested '{}' as {} chunk(s)", title, chunks.len());
        Ok((document, chunks.len()))
    }

    async fn embed_chunks(&self, chunks: &[(String, String)]) -> Result<()> {
        for batch in chunks.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|(_, content)| content.clone()).collect();
            let response = self.embed.embed(&texts).await?;
            if response.vectors.len() != batch.len() {
                return Err(DaemonError::unavailable(format!(
                    "embedding service returned {} vectors for {} texts",
                    response.vectors.len(),
                    batch.len()
                )));
            }
            for ((chunk_id, _), vector) in batch.iter().zip(response.vectors.iter()) {
                self.store.documents.upsert_embedding(
                    chunk_id,
                    &encode_vector(vector),
                    vector.len() as i32,
                    &response.model,
                )?;
            }
        }
        Ok(())
    }

    /// Top-K cosine retrieval over the stored corpus.
    pub async fn retrieve(&self, query: &str, filters: &RetrieveFilters) -> Result<Retrieval> {
        let top_k = filters.top_k.unwrap_or(DEFAULT_TOP_K);
        let min_score = filters.min_score.unwrap_or(DEFAULT_MIN_SCORE);

        let Some(query_vector) = self.embed.embed_one(query).await? else {
            return Ok(Retrieval {
                hits: Vec::new(),
                context: None,
            });
        };

        let candidates = self.store.documents.embedded_chunks(
            filters.doc_ids.as_deref(),
            filters.folder.as_deref(),
        )?;

        let title_needles: Option<Vec<String>> = filters
            .doc_titles
            .as_ref()
            .map(|titles| titles.iter().map(|t| t.trim().to_lowercase()).collect());

        let mut hits: Vec<RetrievedChunk> = candidates
            .into_iter()
            .filter(|candidate| match &title_needles {
                Some(needles) => {
                    let hay = candidate.title.to_lowercase();
                    needles.iter().any(|needle| hay.contains(needle))
                }
                None => true,
            })
            .map(|candidate| {
                let stored = decode_vector(&candidate.vector);
                let score = cosine_similarity(&query_vector, &stored);
                RetrievedChunk {
                    score,
                    title: candidate.title,
                    source_type: candidate.source_type,
                    chunk_index: candidate.chunk_index,
                    content: candidate.content,
                    document_id: candidate.document_id,
                }
            })
            .filter(|hit| hit.score >= min_score)
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);

        debug!("retrieve: {} hit(s) for query ({} chars)", hits.len(), query.len());
        let context = (!hits.is_empty()).then(|| render_context(&hits));
        Ok(Retrieval { hits, context })
    }

    /// Persist a memory note and mirror it as a retrievable document.
    pub async fn add_memory(
        &self,
        category: MemoryCategory,
        title: &str,
        content: &str,
    ) -> Result<MemoryNote> {
        let note = self.store.memories.create(category, title, content)?;
        let mirror_title = format!("Memory: {}", title);
        self.ingest_text(&mirror_title, content, SourceType::Manual, None, None, None)
            .await?;
        Ok(note)
    }

    /// Re-embed every stored chunk. Returns how many chunks were reindexed.
    pub async fn reindex(&self) -> Result<usize> {
        let chunks = self.store.documents.all_chunks()?;
        let pairs: Vec<(String, String)> = chunks
            .iter()
            .map(|chunk| (chunk.id.clone(), chunk.content.clone()))
            .collect();
        self.embed_chunks(&pairs).await?;
        info!("reindexed {} chunk(s)", pairs.len());
        Ok(pairs.len())
    }
}

/// Render the context paragraph handed to the model.
pub fn render_context(hits: &[RetrievedChunk]) -> String {
    let mut out = String::from("Relevant Context (RAG):");
    for hit in hits {
        out.push_str(&format!(
            "\n- [{} | {} | chunk #{}] {}",
            hit.title,
            hit.source_type.as_str(),
            hit.chunk_index,
            hit.content
        ));
    }
    out
}

/// Extension-driven MIME inference for uploads.
pub fn infer_mime(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit('.')
        .next()
        .map(str::to_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "md" => "text/markdown",
        "txt" => "text/plain",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "docx" => "officedocument.wordprocessingml.document",
        "csv" => "text/csv",
        "yaml" | "yml" => "application/x-yaml",
        _ => "application/octet-stream",
    }
}

/// Decode an upload to plain text. PDF and DOCX go through their parsers;
/// anything else is treated as UTF-8.
pub fn extract_text(file_name: &str, bytes: &[u8]) -> Result<String> {
    let lower = file_name.to_lowercase();
    if lower.ends_with(".pdf") {
        return pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| DaemonError::validation("file", format!("pdf parse failed: {}", e)));
    }
    if lower.ends_with(".docx") {
        return extract_docx_text(bytes);
    }
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn extract_docx_text(bytes: &[u8]) -> Result<String> {
    use docx_rs::{DocumentChild, ParagraphChild, RunChild};

    let docx = docx_rs::read_docx(bytes)
        .map_err(|e| DaemonError::validation("file", format!("docx parse failed: {:?}", e)))?;
    let mut out = String::new();
    for child in docx.document.children {
        if let DocumentChild::Paragraph(paragraph) = child {
            for pc in paragraph.children {
                if let ParagraphChild::Run(run) = pc {
                    for rc in run.children {
                        if let RunChild::Text(text) = rc {
                            out.push_str(&text.text);
                        }
                    }
                }
            }
            out.push('\n');
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_inference_table() {
        assert_eq!(infer_mime("notes.md"), "text/markdown");
        assert_eq!(infer_mime("a.TXT"), "text/plain");
        assert_eq!(infer_mime("data.json"), "application/json");
        assert_eq!(infer_mime("paper.pdf"), "application/pdf");
        assert_eq!(infer_mime("spec.docx"), "officedocument.wordprocessingml.document");
        assert_eq!(infer_mime("rows.csv"), "text/csv");
        assert_eq!(infer_mime("conf.yaml"), "application/x-yaml");
        assert_eq!(infer_mime("conf.yml"), "application/x-yaml");
        assert_eq!(infer_mime("binary.bin"), "application/octet-stream");
        assert_eq!(infer_mime("no-extension"), "application/octet-stream");
    }

    #[test]
    fn test_plain_text_extraction() {
        let text = extract_text("notes.txt", "alpha beta".as_bytes()).unwrap();
        assert_eq!(text, "alpha beta");
    }

    #[test]
    fn test_context_render_shape() {
        let hits = vec![
            RetrievedChunk {
                score: 0.9,
                title: "notes.md".into(),
                source_type: SourceType::Upload,
                chunk_index: 2,
                content: "beta gamma".into(),
                document_id: "d1".into(),
            },
            RetrievedChunk {
                score: 0.5,
                title: "Memory: wal".into(),
                source_type: SourceType::Manual,
                chunk_index: 0,
                content: "store runs WAL".into(),
                document_id: "d2".into(),
            },
        ];
        let context = render_context(&hits);
        assert!(context.starts_with("Relevant Context (RAG):"));
        assert!(context.contains("- [notes.md | upload | chunk #2] beta gamma"));
        assert!(context.contains("- [Memory: wal | manual | chunk #0] store runs WAL"));
    }

    // Pipeline tests against a stub embedding server live in api::rag_api
    // and the end-to-end consult tests, where an axum listener provides the
    // /embed endpoint.
}
