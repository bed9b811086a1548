use crate::brain::text::truncate_chars;
use crate::error::AppError;
use crate::models::{Solution, SolutionMetadata};
use crate::oracles::traits::{Embedder, IndexEntry, MetadataFilter, VectorIndex};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument};

/// Characters of the solution text kept in vector metadata.
pub const PREVIEW_CHARS: usize = 500;
/// Characters of conversation context appended to a query.
pub const CONTEXT_CHARS: usize = 500;
const ERROR_PATTERN_RESULTS: usize = 5;

/// A solution found by similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedSolution {
    pub id: String,
    /// `1 - cosine distance`.
    pub similarity: f32,
    pub document: String,
    pub metadata: SolutionMetadata,
}

pub fn similarity_from_distance(distance: f32) -> f32 {
    1.0 - distance
}

/// Text that gets embedded for a stored solution.
pub fn solution_document(error_pattern: &str, solution_text: &str) -> String {
    format!("Error: {}\n\nSolution: {}", error_pattern, solution_text)
}

pub fn solution_metadata(solution: &Solution) -> SolutionMetadata {
    SolutionMetadata {
        error_pattern: truncate_chars(&solution.error_pattern, PREVIEW_CHARS).to_string(),
        solution_preview: truncate_chars(&solution.full_text, PREVIEW_CHARS).to_string(),
        category: solution.category.clone(),
        machine_type: solution.machine_type.clone(),
        success_rate: solution.success_rate(),
    }
}

/// Similarity search over stored solutions.
///
/// Query embeddings are cached by exact text; document embeddings never are.
pub struct RetrievalEngine {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    similarity_threshold: f32,
    context_threshold_ratio: f32,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl RetrievalEngine {
    const CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(1000) {
        Some(size) => size,
        None => panic!("Cache size must be non-zero"),
    };

    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        similarity_threshold: f32,
        context_threshold_ratio: f32,
    ) -> Self {
        Self {
            embedder,
            index,
            similarity_threshold,
            context_threshold_ratio,
            query_cache: Mutex::new(LruCache::new(Self::CACHE_SIZE)),
        }
    }

    pub fn similarity_threshold(&self) -> f32 {
        self.similarity_threshold
    }

    /// Threshold used when conversation context is mixed into the query.
    pub fn context_threshold(&self, base: f32) -> f32 {
        base * self.context_threshold_ratio
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let cached = self
            .query_cache
            .lock()
            .map_err(|_| AppError::Internal("Query cache lock poisoned".to_string()))?
            .get(text)
            .cloned();
        if let Some(hit) = cached {
            debug!("Query embedding cache hit");
            return Ok(hit);
        }

        let vector = self.embedder.embed(text).await?;
        self.query_cache
            .lock()
            .map_err(|_| AppError::Internal("Query cache lock poisoned".to_string()))?
            .put(text.to_string(), vector.clone());
        Ok(vector)
    }

    /// Up to `n` solutions at or above `min_similarity`, nearest first.
    #[instrument(skip(self, filter), fields(query_chars = query.len()))]
    pub async fn retrieve(
        &self,
        query: &str,
        n: usize,
        min_similarity: f32,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievedSolution>, AppError> {
        if query.trim().is_empty() || n == 0 {
            return Ok(Vec::new());
        }

        let vector = self.embed_query(query).await?;
        let filter = filter.filter(|f| !f.is_empty());
        let hits = self.index.query(&vector, n, filter).await?;

        let results: Vec<RetrievedSolution> = hits
            .into_iter()
            .map(|hit| RetrievedSolution {
                similarity: similarity_from_distance(hit.distance),
                id: hit.id,
                document: hit.document,
                metadata: hit.metadata,
            })
            .filter(|r| r.similarity >= min_similarity)
            .collect();

        debug!(count = results.len(), min_similarity, "Retrieval finished");
        Ok(results)
    }

    /// Mixes conversation context into the query and relaxes the threshold to match.
    pub async fn retrieve_with_context(
        &self,
        query: &str,
        context: &str,
        n: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<RetrievedSolution>, AppError> {
        let augmented = if context.trim().is_empty() {
            query.to_string()
        } else {
            format!(
                "{}\n\nContext:\n{}",
                query,
                truncate_chars(context, CONTEXT_CHARS)
            )
        };
        let threshold = self.context_threshold(self.similarity_threshold);
        self.retrieve(&augmented, n, threshold, filter).await
    }

    pub async fn retrieve_by_error_pattern(
        &self,
        error_pattern: &str,
        machine_type: Option<&str>,
    ) -> Result<Vec<RetrievedSolution>, AppError> {
        let filter = MetadataFilter {
            category: None,
            machine_type: machine_type.map(String::from),
        };
        self.retrieve(
            error_pattern,
            ERROR_PATTERN_RESULTS,
            self.similarity_threshold,
            Some(&filter),
        )
        .await
    }

    /// Document text and its vector, computed before the solution row exists.
    pub async fn embed_document(
        &self,
        error_pattern: &str,
        solution_text: &str,
    ) -> Result<(String, Vec<f32>), AppError> {
        let document = solution_document(error_pattern, solution_text);
        let vector = self.embedder.embed(&document).await?;
        Ok((document, vector))
    }

    /// Stores a pre-computed vector under the solution's id.
    #[instrument(skip_all, fields(solution_id = %solution.id))]
    pub async fn store_embedded(
        &self,
        solution: &Solution,
        document: String,
        vector: Vec<f32>,
    ) -> Result<(), AppError> {
        self.index
            .add(IndexEntry {
                id: solution.id.clone(),
                vector,
                document,
                metadata: solution_metadata(solution),
            })
            .await
    }

    /// Embeds a stored solution and writes it, replacing any entry with the same id.
    pub async fn reindex_solution(&self, solution: &Solution) -> Result<(), AppError> {
        let (document, vector) = self
            .embed_document(&solution.error_pattern, &solution.full_text)
            .await?;
        self.index
            .update(IndexEntry {
                id: solution.id.clone(),
                vector,
                document,
                metadata: solution_metadata(solution),
            })
            .await
    }

    pub async fn remove_solution(&self, solution_id: &str) -> Result<(), AppError> {
        self.index.delete(solution_id).await
    }

    pub async fn indexed_count(&self) -> Result<usize, AppError> {
        self.index.count().await
    }
}
