//! Thin client for the external embedding service.
//!
//! The service accepts `POST {"texts": [..]}` and answers
//! `{"vectors": [[f32]], "dim": n, "model": name}`. Where it lives comes
//! from `RAG_EMBED_URL`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DaemonError, Result};

pub const EMBED_URL_ENV: &str = "RAG_EMBED_URL";
pub const DEFAULT_EMBED_URL: &str = "http://127.0.0.1:7999/embed";

const EMBED_TIMEOUT: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbedResponse {
    pub vectors: Vec<Vec<f32>>,
    #[serde(default)]
    pub dim: usize,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedHealth {
    pub available: bool,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct EmbedClient {
    http: reqwest::Client,
    url: String,
}

impl EmbedClient {
    pub fn from_env() -> Self {
        let url = std::env::var(EMBED_URL_ENV).unwrap_or_else(|_| DEFAULT_EMBED_URL.to_string());
        Self::new(url)
    }

    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn embed(&self, texts: &[String]) -> Result<EmbedResponse> {
        if texts.is_empty() {
            return Ok(EmbedResponse {
                vectors: Vec::new(),
                dim: 0,
                model: String::new(),
            });
        }
        debug!("embedding {} text(s)", texts.len());
        let response = self
            .http
            .post(&self.url)
            .timeout(EMBED_TIMEOUT)
            .json(&EmbedRequest { texts })
            .send()
            .await
            .map_err(|e| DaemonError::unavailable(format!("embedding service: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DaemonError::unavailable(format!(
                "embedding service returned {}: {}",
                status, body
            )));
        }

        response
            .json::<EmbedResponse>()
            .await
            .map_err(|e| DaemonError::unavailable(format!("embedding response: {}", e)))
    }

    /// Single-vector convenience for query embedding.
    pub async fn embed_one(&self, text: &str) -> Result<Option<Vec<f32>>> {
        let response = self.embed(&[text.to_string()]).await?;
        Ok(response.vectors.into_iter().next())
    }

    /// Cheap availability probe for the health endpoint.
    pub async fn health(&self) -> EmbedHealth {
        let probe = self
            .http
            .post(&self.url)
            .timeout(PROBE_TIMEOUT)
            .json(&EmbedRequest {
                texts: &["ping".to_string()],
            })
            .send()
            .await;
        match probe {
            Ok(response) if response.status().is_success() => EmbedHealth {
                available: true,
                url: self.url.clone(),
                error: None,
            },
            Ok(response) => EmbedHealth {
                available: false,
                url: self.url.clone(),
                error: Some(format!("status {}", response.status())),
            },
            Err(e) => EmbedHealth {
                available: false,
                url: self.url.clone(),
                error: Some(e.to_string()),
            },
        }
    }
}
