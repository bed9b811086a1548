//! # Oracles
//!
//! External collaborators behind `#[async_trait]` seams. Every service takes
//! these as `Arc<dyn Trait>` so tests can swap in fakes.

pub mod embedding;
pub mod llm;
pub mod memory;
pub mod rag;
pub mod traits;

pub use embedding::{HttpEmbedder, LocalEmbedder};
pub use llm::OpenAiGenerator;
pub use memory::MemoryIndex;
pub use rag::LanceIndex;
pub use traits::{
    Embedder, Generator, IndexEntry, IndexHit, MessageSource, MetadataFilter, VectorIndex,
};
