use crate::error::AppError;
use crate::oracles::traits::{IndexEntry, IndexHit, MetadataFilter, VectorIndex};
use async_trait::async_trait;
use tokio::sync::RwLock;

/// In-process vector index. A linear cosine scan; fine for small corpora and tests.
#[derive(Default)]
pub struct MemoryIndex {
    entries: RwLock<Vec<IndexEntry>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

/// `1 - cos(a, b)`. Zero vectors are maximally distant.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn add(&self, entry: IndexEntry) -> Result<(), AppError> {
        let mut entries = self.entries.write().await;
        if entries.iter().any(|e| e.id == entry.id) {
            return Err(AppError::VectorIndex(format!(
                "Entry {} already exists",
                entry.id
            )));
        }
        entries.push(entry);
        Ok(())
    }

    async fn update(&self, entry: IndexEntry) -> Result<(), AppError> {
        let mut entries = self.entries.write().await;
        match entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), AppError> {
        self.entries.write().await.retain(|e| e.id != id);
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexHit>, AppError> {
        let entries = self.entries.read().await;
        let mut hits: Vec<IndexHit> = entries
            .iter()
            .filter(|e| filter.map_or(true, |f| f.matches(&e.metadata)))
            .map(|e| IndexHit {
                id: e.id.clone(),
                distance: cosine_distance(vector, &e.vector),
                document: e.document.clone(),
                metadata: e.metadata.clone(),
            })
            .collect();

        // stable: equal distances keep insertion order
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k);
        Ok(hits)
    }

    async fn count(&self) -> Result<usize, AppError> {
        Ok(self.entries.read().await.len())
    }
}
