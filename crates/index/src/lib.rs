//! Work-note indexing: notes → chunked → embedded → hybrid (FTS5 + vector) search and RAG.

pub mod chunker;
pub mod config;
pub mod embeddings;
pub mod embeddings_openai;
pub mod hybrid;
pub mod lexical;
pub mod metadata;
pub mod rag;
pub mod retry_queue;
pub mod schema;
pub mod store;
pub mod store_sqlite;
pub mod sync;
pub mod vector_index;
pub mod vector_store;
pub mod vector_store_sqlite;

#[cfg(test)]
pub(crate) mod test_support;

/// Current wall-clock time in unix milliseconds.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
