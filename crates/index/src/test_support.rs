//! Shared fixtures for unit tests.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::{
    Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use {
    async_trait::async_trait,
    sqlx::{SqlitePool, sqlite::SqlitePoolOptions},
};

use crate::{embeddings::EmbeddingProvider, rag::Generator, schema::run_migrations};

/// Single-connection in-memory pool; every connection of a larger pool would
/// see its own empty database.
pub async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}

pub async fn migrated_pool() -> SqlitePool {
    let pool = memory_pool().await;
    run_migrations(&pool).await.unwrap();
    crate::vector_store_sqlite::SqliteVectorStore::init(&pool)
        .await
        .unwrap();
    pool
}

pub const KEYWORDS: [&str; 8] = [
    "rust", "deploy", "database", "budget", "search", "network", "hiring", "incident",
];

/// One dimension per keyword: 1.0 when the text mentions it.
pub fn keyword_embedding(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    KEYWORDS
        .iter()
        .map(|kw| if lower.contains(kw) { 1.0 } else { 0.0 })
        .collect()
}

/// Deterministic embedder that can be switched into a failing mode.
#[derive(Default)]
pub struct MockEmbedder {
    pub failing: AtomicBool,
    pub batch_calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("mock embedder offline");
        }
        Ok(keyword_embedding(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("mock embedder offline");
        }
        Ok(texts.iter().map(|t| keyword_embedding(t)).collect())
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }

    fn dimensions(&self) -> usize {
        KEYWORDS.len()
    }
}

/// Generator that records prompts and echoes a fixed answer.
#[derive(Default)]
pub struct RecordingGenerator {
    pub prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl Generator for RecordingGenerator {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok("generated answer".into())
    }
}
