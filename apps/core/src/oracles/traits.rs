use crate::error::AppError;
use crate::models::{SolutionMetadata, ThreadMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Turns text into a fixed-length vector.
///
/// Implementations must return vectors of the same length for every input.
#[async_trait]
pub trait Embedder: Send + Sync + 'static {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError>;

    /// Length of every vector this embedder returns.
    fn dimension(&self) -> usize;
}

/// Produces free text from a system prompt and a user prompt.
#[async_trait]
pub trait Generator: Send + Sync + 'static {
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String, AppError>;
}

/// Pulls the full, ordered message list of a thread from the chat platform.
#[async_trait]
pub trait MessageSource: Send + Sync + 'static {
    async fn fetch_thread(
        &self,
        channel_id: &str,
        thread_id: &str,
    ) -> Result<Vec<ThreadMessage>, AppError>;
}

/// One stored vector with its display data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub document: String,
    pub metadata: SolutionMetadata,
}

/// A nearest-neighbour result. `distance` is cosine distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexHit {
    pub id: String,
    pub distance: f32,
    pub document: String,
    pub metadata: SolutionMetadata,
}

/// Equality filters over indexed metadata. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub category: Option<String>,
    pub machine_type: Option<String>,
}

impl MetadataFilter {
    pub fn is_empty(&self) -> bool {
        self.category.is_none() && self.machine_type.is_none()
    }

    pub fn matches(&self, metadata: &SolutionMetadata) -> bool {
        let category_ok = match &self.category {
            Some(wanted) => metadata.category.as_deref() == Some(wanted.as_str()),
            None => true,
        };
        let machine_ok = match &self.machine_type {
            Some(wanted) => metadata.machine_type.as_deref() == Some(wanted.as_str()),
            None => true,
        };
        category_ok && machine_ok
    }
}

/// Similarity store for solution documents.
#[async_trait]
pub trait VectorIndex: Send + Sync + 'static {
    async fn add(&self, entry: IndexEntry) -> Result<(), AppError>;

    /// Replaces the entry with the same id.
    async fn update(&self, entry: IndexEntry) -> Result<(), AppError>;

    /// Removing an unknown id is not an error.
    async fn delete(&self, id: &str) -> Result<(), AppError>;

    /// Up to `k` entries, nearest first.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexHit>, AppError>;

    async fn count(&self) -> Result<usize, AppError>;
}
