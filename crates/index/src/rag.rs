//! Scoped retrieval feeding an external text generator.
//!
//! Snippets are rebuilt from the current note text with [`Chunker::chunk_text`];
//! nothing but vectors and metadata lives in the vector store.

use std::{
    collections::{HashMap, HashSet},
    fmt::Write as _,
    sync::Arc,
};

use {async_trait::async_trait, serde::Serialize, tracing::debug};

use crate::{
    chunker::{Chunker, ChunkerConfig, full_text},
    config::IndexConfig,
    metadata::{FIELD_DOCUMENT_ID, FIELD_OWNER_GROUP, truncate_utf8},
    store::{PrimaryStore, WorkNote},
    vector_index::VectorIndexAdapter,
    vector_store::VectorFilter,
};

/// Answer returned without calling the generator when nothing relevant survives.
pub const NO_RESULTS_ANSWER: &str =
    "No relevant work notes were found for this question, so no answer was generated.";

/// Produces an answer from a prompt.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RagScope {
    Global,
    /// One note.
    Work(String),
    /// Notes whose first owner belongs to this department.
    Department(String),
    /// Notes this person owns, checked against the current owner list.
    Person(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RagContext {
    pub document_id: String,
    pub title: String,
    pub chunk_index: usize,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RagAnswer {
    pub answer: String,
    pub contexts: Vec<RagContext>,
}

pub struct RagRetriever {
    index: Arc<VectorIndexAdapter>,
    store: Arc<dyn PrimaryStore>,
    generator: Arc<dyn Generator>,
    chunker: Chunker,
    similarity_threshold: f32,
    overfetch_factor: usize,
    top_k: usize,
    metadata_byte_budget: usize,
}

impl RagRetriever {
    pub fn new(
        index: Arc<VectorIndexAdapter>,
        store: Arc<dyn PrimaryStore>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            index,
            store,
            generator,
            chunker: Chunker::default(),
            similarity_threshold: 0.5,
            overfetch_factor: 3,
            top_k: 5,
            metadata_byte_budget: 64,
        }
    }

    /// Apply the chunking and `rag_*` settings from `config`.
    pub fn with_config(self, config: &IndexConfig) -> Self {
        self.with_chunker(Chunker::new(ChunkerConfig {
            chunk_size_tokens: config.chunk_size_tokens,
            overlap_ratio: config.chunk_overlap_ratio,
        }))
        .with_similarity_threshold(config.rag_similarity_threshold)
        .with_overfetch_factor(config.rag_overfetch_factor)
        .with_top_k(config.rag_top_k)
        .with_metadata_byte_budget(config.metadata_byte_budget)
    }

    /// Must match the chunker the notes were embedded with.
    pub fn with_chunker(mut self, chunker: Chunker) -> Self {
        self.chunker = chunker;
        self
    }

    pub fn with_similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn with_overfetch_factor(mut self, factor: usize) -> Self {
        self.overfetch_factor = factor.max(1);
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_metadata_byte_budget(mut self, budget: usize) -> Self {
        self.metadata_byte_budget = budget;
        self
    }

    /// Retrieve contexts for `query` within `scope` and hand them to the generator.
    pub async fn query(
        &self,
        query: &str,
        scope: &RagScope,
        top_k: Option<usize>,
    ) -> anyhow::Result<RagAnswer> {
        let top_k = top_k.unwrap_or(self.top_k);
        let contexts = self.retrieve(query, scope, top_k).await?;
        if contexts.is_empty() {
            debug!(scope = ?scope, "no contexts above threshold, skipping generation");
            return Ok(RagAnswer {
                answer: NO_RESULTS_ANSWER.to_string(),
                contexts,
            });
        }
        let prompt = build_prompt(query, &contexts);
        let answer = self.generator.complete(&prompt).await?;
        Ok(RagAnswer { answer, contexts })
    }

    /// Scoped, thresholded contexts, best first, at most `top_k`.
    pub async fn retrieve(
        &self,
        query: &str,
        scope: &RagScope,
        top_k: usize,
    ) -> anyhow::Result<Vec<RagContext>> {
        if top_k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut filter = VectorFilter::new();
        let mut fetch = top_k;
        let mut required_owner = None;
        match scope {
            RagScope::Global => {},
            RagScope::Work(id) => {
                filter.insert(FIELD_DOCUMENT_ID.into(), id.clone());
            },
            RagScope::Department(name) => {
                filter.insert(
                    FIELD_OWNER_GROUP.into(),
                    truncate_utf8(name, self.metadata_byte_budget).to_string(),
                );
            },
            // Owner lists are multi-valued and truncated in metadata, so
            // membership is checked against the primary store instead.
            RagScope::Person(id) => {
                fetch = top_k.saturating_mul(self.overfetch_factor);
                required_owner = Some(id.as_str());
            },
        }

        let matches: Vec<_> = self
            .index
            .search(query, fetch, (!filter.is_empty()).then_some(filter))
            .await?
            .into_iter()
            .filter(|m| m.score >= self.similarity_threshold)
            .collect();
        if matches.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = matches
            .iter()
            .map(|m| m.metadata.document_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let notes: HashMap<String, WorkNote> = self
            .store
            .find_by_ids(&ids)
            .await?
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();

        let mut contexts = Vec::new();
        for m in matches {
            let Some(note) = notes.get(&m.metadata.document_id) else {
                continue;
            };
            if let Some(owner) = required_owner
                && !note.person_ids.iter().any(|p| p == owner)
            {
                continue;
            }
            let text = full_text(&note.title, &note.content);
            let Some(snippet) = self.chunker.chunk_text(&text, m.metadata.chunk_index) else {
                debug!(id = %m.id, "chunk no longer exists in note text");
                continue;
            };
            contexts.push(RagContext {
                document_id: note.id.clone(),
                title: note.title.clone(),
                chunk_index: m.metadata.chunk_index,
                text: snippet.to_string(),
                score: m.score,
            });
            if contexts.len() == top_k {
                break;
            }
        }
        Ok(contexts)
    }
}

/// Numbered context block followed by the question.
pub fn build_prompt(query: &str, contexts: &[RagContext]) -> String {
    let mut prompt = String::from(
        "Answer the question using only the work notes below. \
         If they do not contain the answer, say so.\n\n",
    );
    for (i, ctx) in contexts.iter().enumerate() {
        let _ = writeln!(
            prompt,
            "[{}] {} (note {}, part {})\n{}\n",
            i + 1,
            ctx.title,
            ctx.document_id,
            ctx.chunk_index + 1,
            ctx.text
        );
    }
    let _ = write!(prompt, "Question: {query}");
    prompt
}
