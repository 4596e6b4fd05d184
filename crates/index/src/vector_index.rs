//! Embeds chunks and keeps their vectors in the store.

use std::{collections::HashSet, sync::Arc};

use tracing::debug;

use crate::{
    chunker::Chunk,
    embeddings::{EmbeddingError, EmbeddingProvider},
    metadata::{ChunkMetadata, FIELD_DOCUMENT_ID},
    vector_store::{QueryOptions, VectorEntry, VectorFilter, VectorStore},
};

/// A semantic hit with its decoded chunk metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticMatch {
    pub id: String,
    pub score: f32,
    pub metadata: ChunkMetadata,
}

pub struct VectorIndexAdapter {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    metadata_byte_budget: usize,
    stale_scan_limit: usize,
}

impl VectorIndexAdapter {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            embedder,
            store,
            metadata_byte_budget: 64,
            stale_scan_limit: 500,
        }
    }

    pub fn with_metadata_byte_budget(mut self, budget: usize) -> Self {
        self.metadata_byte_budget = budget;
        self
    }

    pub fn with_stale_scan_limit(mut self, limit: usize) -> Self {
        self.stale_scan_limit = limit;
        self
    }

    pub fn embedder(&self) -> &dyn EmbeddingProvider {
        self.embedder.as_ref()
    }

    /// Embed every chunk in one provider call, then upsert all vectors.
    ///
    /// There is no partial success: if the batch embedding fails nothing is written.
    pub async fn upsert_chunks(&self, chunks: &[Chunk]) -> anyhow::Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        if vectors.len() != chunks.len() {
            return Err(EmbeddingError::Decode(format!(
                "expected {} embeddings, got {}",
                chunks.len(),
                vectors.len()
            ))
            .into());
        }

        let entries: Vec<VectorEntry> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorEntry {
                id: chunk.id.clone(),
                vector,
                metadata: chunk.metadata.encode(self.metadata_byte_budget),
            })
            .collect();
        self.store.upsert(&entries).await
    }

    /// Delete every chunk of `document_id` whose id is not in `keep_ids`.
    ///
    /// Candidates are discovered with a zero-vector query filtered on the
    /// document, capped at the stale scan limit.
    pub async fn delete_stale_chunks(
        &self,
        document_id: &str,
        keep_ids: &[String],
    ) -> anyhow::Result<Vec<String>> {
        let dims = self.embedder.dimensions().max(1);
        let mut filter = VectorFilter::new();
        filter.insert(FIELD_DOCUMENT_ID.into(), document_id.to_string());
        let candidates = self
            .store
            .query(&vec![0.0; dims], &QueryOptions {
                top_k: self.stale_scan_limit,
                filter: Some(filter),
                return_metadata: false,
            })
            .await?;

        let keep: HashSet<&str> = keep_ids.iter().map(String::as_str).collect();
        let stale: Vec<String> = candidates
            .into_iter()
            .map(|m| m.id)
            .filter(|id| !keep.contains(id.as_str()))
            .collect();
        if stale.is_empty() {
            debug!(document_id, "no stale chunks");
            return Ok(stale);
        }
        self.store.delete_by_ids(&stale).await?;
        debug!(document_id, removed = stale.len(), "deleted stale chunks");
        Ok(stale)
    }

    /// Remove every chunk of a document.
    pub async fn delete_document(&self, document_id: &str) -> anyhow::Result<Vec<String>> {
        self.delete_stale_chunks(document_id, &[]).await
    }

    /// Embed `query` and return the `top_k` nearest chunks.
    ///
    /// Matches whose metadata cannot be decoded are skipped.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<VectorFilter>,
    ) -> anyhow::Result<Vec<SemanticMatch>> {
        let vector = self.embedder.embed(query).await?;
        let matches = self
            .store
            .query(&vector, &QueryOptions {
                top_k,
                filter,
                return_metadata: true,
            })
            .await?;

        Ok(matches
            .into_iter()
            .filter_map(|m| match ChunkMetadata::decode(&m.metadata) {
                Ok(metadata) => Some(SemanticMatch {
                    id: m.id,
                    score: m.score,
                    metadata,
                }),
                Err(e) => {
                    debug!(id = %m.id, error = %e, "skipping match with undecodable metadata");
                    None
                },
            })
            .collect())
    }
}
