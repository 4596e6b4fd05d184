//! Storage-agnostic vector store interface.
use async_trait::async_trait;

use crate::metadata::VectorMetadata;

/// One stored vector. Writes are idempotent by `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: VectorMetadata,
}

/// A query hit. `metadata` is empty unless requested.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    pub metadata: VectorMetadata,
}

/// Equality filter over metadata fields; all pairs must match.
pub type VectorFilter = VectorMetadata;

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub top_k: usize,
    pub filter: Option<VectorFilter>,
    pub return_metadata: bool,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, entries: &[VectorEntry]) -> anyhow::Result<()>;
    /// Delete by id; unknown ids are ignored. Returns the number removed.
    async fn delete_by_ids(&self, ids: &[String]) -> anyhow::Result<u64>;
    /// Nearest neighbours by cosine similarity, best first.
    async fn query(
        &self,
        vector: &[f32],
        options: &QueryOptions,
    ) -> anyhow::Result<Vec<VectorMatch>>;
}
