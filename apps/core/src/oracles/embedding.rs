//! Embedding oracles: an in-process fastembed model and an OpenAI-compatible HTTP client.

use crate::error::AppError;
use crate::oracles::traits::Embedder;
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, info, instrument};

/// Maps a configured model name to the fastembed model and its vector length.
pub fn resolve_local_model(name: &str) -> Result<(EmbeddingModel, usize), AppError> {
    let resolved = match name {
        "all-MiniLM-L6-v2" | "AllMiniLML6V2" => (EmbeddingModel::AllMiniLML6V2, 384),
        "all-MiniLM-L12-v2" | "AllMiniLML12V2" => (EmbeddingModel::AllMiniLML12V2, 384),
        "bge-small-en-v1.5" | "BGESmallENV15" => (EmbeddingModel::BGESmallENV15, 384),
        "bge-base-en-v1.5" | "BGEBaseENV15" => (EmbeddingModel::BGEBaseENV15, 768),
        "paraphrase-multilingual-MiniLM-L12-v2" | "ParaphraseMLMiniLML12V2" => {
            (EmbeddingModel::ParaphraseMLMiniLML12V2, 384)
        }
        "multilingual-e5-small" | "MultilingualE5Small" => (EmbeddingModel::MultilingualE5Small, 384),
        "multilingual-e5-base" | "MultilingualE5Base" => (EmbeddingModel::MultilingualE5Base, 768),
        "multilingual-e5-large" | "MultilingualE5Large" => {
            (EmbeddingModel::MultilingualE5Large, 1024)
        }
        other => {
            return Err(AppError::Config(format!(
                "Unknown embedding model '{}'",
                other
            )))
        }
    };
    Ok(resolved)
}

/// fastembed model loaded on first use; inference runs on the blocking pool.
pub struct LocalEmbedder {
    model_name: EmbeddingModel,
    dimension: usize,
    cache_dir: PathBuf,
    model: OnceCell<Arc<TextEmbedding>>,
}

impl LocalEmbedder {
    pub fn new(model: &str, cache_dir: PathBuf) -> Result<Self, AppError> {
        let (model_name, dimension) = resolve_local_model(model)?;
        Ok(Self {
            model_name,
            dimension,
            cache_dir,
            model: OnceCell::new(),
        })
    }

    async fn model(&self) -> Result<Arc<TextEmbedding>, AppError> {
        self.model
            .get_or_try_init(|| async {
                let mut options = InitOptions::new(self.model_name.clone());
                options.show_download_progress = false;
                options.cache_dir = self.cache_dir.clone();

                let model = tokio::task::spawn_blocking(move || TextEmbedding::try_new(options))
                    .await
                    .map_err(|e| AppError::Internal(format!("Embedding loader panicked: {}", e)))?
                    .map_err(|e| AppError::Oracle(format!("Failed to load embedding model: {}", e)))?;

                info!(model = ?self.model_name, "Embedding model loaded");
                Ok::<_, AppError>(Arc::new(model))
            })
            .await
            .cloned()
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    #[instrument(skip_all, fields(chars = text.len()))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let model = self.model().await?;
        let input = text.to_string();

        let mut vectors = tokio::task::spawn_blocking(move || model.embed(vec![input], None))
            .await
            .map_err(|e| AppError::Internal(format!("Embedding task panicked: {}", e)))?
            .map_err(|e| AppError::Oracle(format!("Embedding failed: {}", e)))?;

        vectors
            .pop()
            .ok_or_else(|| AppError::Oracle("No embedding generated".to_string()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Embedding oracle backed by an OpenAI-compatible `/v1/embeddings` endpoint.
pub struct HttpEmbedder {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
    request_timeout: Duration,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>, dimension: usize) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            dimension,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    #[instrument(skip_all, fields(model = %self.model, chars = text.len()))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let mut request = self.client.post(&url).json(&EmbeddingRequest {
            model: &self.model,
            input: text,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = timeout(self.request_timeout, request.send()).await??;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Oracle(format!(
                "Embedding endpoint returned {}: {}",
                status, body
            )));
        }

        let parsed = timeout(self.request_timeout, response.json::<EmbeddingResponse>()).await??;
        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| AppError::Oracle("Embedding response had no data".to_string()))?;

        if vector.len() != self.dimension {
            return Err(AppError::Oracle(format!(
                "Expected {}-dim embedding, got {}",
                self.dimension,
                vector.len()
            )));
        }

        debug!(dimension = vector.len(), "Embedding received");
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
