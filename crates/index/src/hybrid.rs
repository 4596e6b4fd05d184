//! Hybrid search: lexical and semantic engines merged with Reciprocal Rank Fusion.
//!
//! Each engine's list contributes `1 / (k + rank)` per note, where `rank` is the
//! 1-indexed position. Ties on the fused score are broken by note id ascending.
//! Either engine failing degrades to the other engine's results.

use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
    sync::Arc,
};

use {
    serde::Serialize,
    tracing::{debug, warn},
};

use crate::{
    lexical::{LexicalSearch, SearchFilters},
    metadata::{FIELD_CATEGORY, FIELD_OWNER_GROUP, truncate_utf8},
    store::{PrimaryStore, WorkNote},
    vector_index::VectorIndexAdapter,
    vector_store::VectorFilter,
};

/// Standard RRF smoothing constant.
pub const DEFAULT_RRF_K: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SearchSource {
    Lexical,
    Semantic,
    Hybrid,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub entity: WorkNote,
    pub score: f64,
    pub source: SearchSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct HybridSearchResponse {
    pub results: Vec<SearchResultItem>,
    pub count: usize,
    pub query: String,
}

/// A fused id before the entity join.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub id: String,
    pub score: f64,
    pub source: SearchSource,
}

/// RRF contribution of a 1-indexed rank.
pub fn rrf_contribution(rank: usize, k: u32) -> f64 {
    1.0 / (f64::from(k) + rank as f64)
}

/// Fuse two best-first id lists. Duplicate ids within one list count once, at
/// their first position.
pub fn reciprocal_rank_fusion(lexical: &[String], semantic: &[String], k: u32) -> Vec<FusedHit> {
    let mut scores: HashMap<&str, (f64, bool, bool)> = HashMap::new();

    for (position, id) in dedup_in_order(lexical).into_iter().enumerate() {
        let entry = scores.entry(id).or_insert((0.0, false, false));
        entry.0 += rrf_contribution(position + 1, k);
        entry.1 = true;
    }
    for (position, id) in dedup_in_order(semantic).into_iter().enumerate() {
        let entry = scores.entry(id).or_insert((0.0, false, false));
        entry.0 += rrf_contribution(position + 1, k);
        entry.2 = true;
    }

    let mut fused: Vec<FusedHit> = scores
        .into_iter()
        .map(|(id, (score, in_lexical, in_semantic))| FusedHit {
            id: id.to_string(),
            score,
            source: match (in_lexical, in_semantic) {
                (true, true) => SearchSource::Hybrid,
                (true, false) => SearchSource::Lexical,
                _ => SearchSource::Semantic,
            },
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    fused
}

fn dedup_in_order(ids: &[String]) -> Vec<&str> {
    let mut seen = HashSet::new();
    ids.iter()
        .map(String::as_str)
        .filter(|id| seen.insert(*id))
        .collect()
}

pub struct HybridMerger {
    lexical: Arc<dyn LexicalSearch>,
    vectors: Arc<VectorIndexAdapter>,
    store: Arc<dyn PrimaryStore>,
    rrf_k: u32,
    overfetch_factor: usize,
    default_limit: usize,
    metadata_byte_budget: usize,
}

impl HybridMerger {
    pub fn new(
        lexical: Arc<dyn LexicalSearch>,
        vectors: Arc<VectorIndexAdapter>,
        store: Arc<dyn PrimaryStore>,
    ) -> Self {
        Self {
            lexical,
            vectors,
            store,
            rrf_k: DEFAULT_RRF_K,
            overfetch_factor: 2,
            default_limit: 10,
            metadata_byte_budget: 64,
        }
    }

    pub fn with_rrf_k(mut self, k: u32) -> Self {
        self.rrf_k = k;
        self
    }

    pub fn with_overfetch_factor(mut self, factor: usize) -> Self {
        self.overfetch_factor = factor.max(1);
        self
    }

    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit;
        self
    }

    pub fn with_metadata_byte_budget(mut self, budget: usize) -> Self {
        self.metadata_byte_budget = budget;
        self
    }

    /// Run both engines concurrently, fuse, truncate, then join note rows.
    ///
    /// The join drops notes that vanished or fail filters the vector store
    /// cannot express, so fewer than `limit` results is expected.
    pub async fn hybrid_search(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> anyhow::Result<HybridSearchResponse> {
        let query = query.trim();
        let limit = filters.limit.unwrap_or(self.default_limit);
        if query.is_empty() || limit == 0 {
            return Ok(HybridSearchResponse {
                results: Vec::new(),
                count: 0,
                query: query.to_string(),
            });
        }
        let fetch = limit.saturating_mul(self.overfetch_factor);

        let (lexical, semantic) = tokio::join!(
            self.lexical.search(query, filters, fetch),
            self.vectors
                .search(query, fetch, self.vector_filter(filters))
        );

        let lexical_ids: Vec<String> = match lexical {
            Ok(hits) => hits.into_iter().map(|h| h.id).collect(),
            Err(e) => {
                warn!(error = %e, "lexical search failed, continuing with semantic results");
                Vec::new()
            },
        };
        // Several chunks of one note collapse onto the note's best position.
        let semantic_ids: Vec<String> = match semantic {
            Ok(matches) => matches.into_iter().map(|m| m.metadata.document_id).collect(),
            Err(e) => {
                warn!(error = %e, "semantic search failed, continuing with lexical results");
                Vec::new()
            },
        };

        let mut fused = reciprocal_rank_fusion(&lexical_ids, &semantic_ids, self.rrf_k);
        fused.truncate(limit);
        debug!(
            lexical = lexical_ids.len(),
            semantic = semantic_ids.len(),
            fused = fused.len(),
            "fused search results"
        );

        let ids: Vec<String> = fused.iter().map(|f| f.id.clone()).collect();
        let mut notes: HashMap<String, WorkNote> = self
            .store
            .find_by_ids(&ids)
            .await?
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();

        let results: Vec<SearchResultItem> = fused
            .into_iter()
            .filter_map(|hit| {
                let note = notes.remove(&hit.id)?;
                passes_post_filters(&note, filters).then_some(SearchResultItem {
                    entity: note,
                    score: hit.score,
                    source: hit.source,
                })
            })
            .collect();

        Ok(HybridSearchResponse {
            count: results.len(),
            results,
            query: query.to_string(),
        })
    }

    /// Filters the vector store can evaluate as single-field equality.
    fn vector_filter(&self, filters: &SearchFilters) -> Option<VectorFilter> {
        let mut filter = VectorFilter::new();
        if let Some(category) = &filters.category {
            filter.insert(
                FIELD_CATEGORY.into(),
                truncate_utf8(category, self.metadata_byte_budget).to_string(),
            );
        }
        if let Some(department) = &filters.department {
            filter.insert(
                FIELD_OWNER_GROUP.into(),
                truncate_utf8(department, self.metadata_byte_budget).to_string(),
            );
        }
        (!filter.is_empty()).then_some(filter)
    }
}

/// Predicates checked against the joined row: owner membership and date range.
fn passes_post_filters(note: &WorkNote, filters: &SearchFilters) -> bool {
    if let Some(person_id) = &filters.person_id
        && !note.person_ids.iter().any(|p| p == person_id)
    {
        return false;
    }
    if let Some(category) = &filters.category
        && note.category.as_ref() != Some(category)
    {
        return false;
    }
    if filters.created_from.is_some_and(|from| note.created_at < from) {
        return false;
    }
    if filters.created_to.is_some_and(|to| note.created_at > to) {
        return false;
    }
    true
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            chunker::Chunker,
            lexical::{LexicalHit, LexicalSearcher},
            metadata::{DocumentMetadata, date_bucket},
            store::{NewWorkNote, Person},
            store_sqlite::SqliteWorkNoteStore,
            test_support::{MockEmbedder, migrated_pool},
            vector_store_sqlite::SqliteVectorStore,
        },
        async_trait::async_trait,
    };

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn contribution_decreases_with_rank() {
        for rank in 1..100 {
            assert!(rrf_contribution(rank, 60) > rrf_contribution(rank + 1, 60));
        }
        assert!((rrf_contribution(1, 60) - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn fusion_matches_worked_example() {
        let fused = reciprocal_rank_fusion(&ids(&["A", "B"]), &ids(&["C", "A"]), 60);
        let order: Vec<&str> = fused.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(order, vec!["A", "C", "B"]);

        assert!((fused[0].score - (1.0 / 61.0 + 1.0 / 62.0)).abs() < 1e-12);
        assert!((fused[0].score - 0.03252).abs() < 1e-5);
        assert_eq!(fused[0].source, SearchSource::Hybrid);
        assert!((fused[1].score - 1.0 / 61.0).abs() < 1e-12);
        assert_eq!(fused[1].source, SearchSource::Semantic);
        assert!((fused[2].score - 1.0 / 62.0).abs() < 1e-12);
        assert_eq!(fused[2].source, SearchSource::Lexical);
    }

    #[test]
    fn equal_scores_break_ties_by_id() {
        let fused = reciprocal_rank_fusion(&ids(&["Z"]), &ids(&["M"]), 60);
        let order: Vec<&str> = fused.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(order, vec!["M", "Z"]);
    }

    #[test]
    fn duplicate_ids_count_once_at_first_position() {
        let fused = reciprocal_rank_fusion(&[], &ids(&["A", "A", "B"]), 60);
        assert_eq!(fused.len(), 2);
        assert!((fused[0].score - 1.0 / 61.0).abs() < 1e-12);
        assert!((fused[1].score - 1.0 / 62.0).abs() < 1e-12);
    }

    #[test]
    fn empty_inputs_fuse_to_nothing() {
        assert!(reciprocal_rank_fusion(&[], &[], 60).is_empty());
    }

    struct FailingLexical;

    #[async_trait]
    impl LexicalSearch for FailingLexical {
        async fn search(
            &self,
            _query: &str,
            _filters: &SearchFilters,
            _limit: usize,
        ) -> anyhow::Result<Vec<LexicalHit>> {
            anyhow::bail!("fts index corrupted")
        }
    }

    struct Fixture {
        store: Arc<SqliteWorkNoteStore>,
        vectors: Arc<VectorIndexAdapter>,
        embedder: Arc<MockEmbedder>,
        pool: sqlx::SqlitePool,
    }

    async fn fixture() -> Fixture {
        let pool = migrated_pool().await;
        let store = Arc::new(SqliteWorkNoteStore::new(pool.clone()));
        let embedder = Arc::new(MockEmbedder::default());
        let vectors = Arc::new(VectorIndexAdapter::new(
            embedder.clone(),
            Arc::new(SqliteVectorStore::new(pool.clone())),
        ));
        for (id, dept) in [("P-1", "Platform"), ("P-2", "Finance")] {
            store
                .upsert_person(&Person {
                    id: id.into(),
                    name: id.into(),
                    department: Some(dept.into()),
                })
                .await
                .unwrap();
        }
        let notes = [
            ("W-1", "Rust deploy", "rollout of the rust service", "ops", "P-1"),
            ("W-2", "Database deploy", "schema migration for the database", "ops", "P-2"),
            ("W-3", "Budget", "budget planning for next quarter", "finance", "P-2"),
        ];
        let chunker = Chunker::default();
        for (id, title, content, category, owner) in notes {
            let note = store
                .create_note(NewWorkNote {
                    id: Some(id.into()),
                    title: title.into(),
                    content: content.into(),
                    category: Some(category.into()),
                    person_ids: vec![owner.into()],
                })
                .await
                .unwrap();
            let meta = DocumentMetadata {
                person_ids: note.person_ids.clone(),
                owner_group: store.resolve_group_for_owner(owner).await.unwrap(),
                category: note.category.clone(),
                date_bucket: date_bucket(note.created_at),
                ..Default::default()
            };
            vectors
                .upsert_chunks(&chunker.chunk(id, title, content, &meta))
                .await
                .unwrap();
        }
        Fixture {
            store,
            vectors,
            embedder,
            pool,
        }
    }

    #[tokio::test]
    async fn merges_both_engines() {
        let f = fixture().await;
        let merger = HybridMerger::new(
            Arc::new(LexicalSearcher::new(f.pool.clone())),
            f.vectors.clone(),
            f.store.clone(),
        );
        let resp = merger
            .hybrid_search("deploy", &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(resp.query, "deploy");
        assert_eq!(resp.count, resp.results.len());
        let top: Vec<&str> = resp.results.iter().map(|r| r.entity.id.as_str()).collect();
        assert!(top.contains(&"W-1") && top.contains(&"W-2"));
        assert!(
            resp.results
                .iter()
                .filter(|r| r.entity.id == "W-1" || r.entity.id == "W-2")
                .all(|r| r.source == SearchSource::Hybrid)
        );
        for pair in resp.results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn lexical_failure_degrades_to_semantic() {
        let f = fixture().await;
        let merger = HybridMerger::new(Arc::new(FailingLexical), f.vectors.clone(), f.store.clone());
        let resp = merger
            .hybrid_search("budget", &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(resp.results[0].entity.id, "W-3");
        assert!(resp.results.iter().all(|r| r.source == SearchSource::Semantic));
    }

    #[tokio::test]
    async fn semantic_failure_degrades_to_lexical() {
        let f = fixture().await;
        f.embedder.set_failing(true);
        let merger = HybridMerger::new(
            Arc::new(LexicalSearcher::new(f.pool.clone())),
            f.vectors.clone(),
            f.store.clone(),
        );
        let resp = merger
            .hybrid_search("budget", &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(resp.count, 1);
        assert_eq!(resp.results[0].entity.id, "W-3");
        assert_eq!(resp.results[0].source, SearchSource::Lexical);
    }

    #[tokio::test]
    async fn person_filter_applied_after_join() {
        let f = fixture().await;
        let merger = HybridMerger::new(
            Arc::new(LexicalSearcher::new(f.pool.clone())),
            f.vectors.clone(),
            f.store.clone(),
        );
        let filters = SearchFilters {
            person_id: Some("P-1".into()),
            ..Default::default()
        };
        let resp = merger.hybrid_search("deploy", &filters).await.unwrap();
        assert!(!resp.results.is_empty());
        assert!(
            resp.results
                .iter()
                .all(|r| r.entity.person_ids.contains(&"P-1".to_string()))
        );
    }

    #[tokio::test]
    async fn limit_truncates_and_blank_query_short_circuits() {
        let f = fixture().await;
        let merger = HybridMerger::new(
            Arc::new(LexicalSearcher::new(f.pool.clone())),
            f.vectors.clone(),
            f.store.clone(),
        );
        let filters = SearchFilters {
            limit: Some(1),
            ..Default::default()
        };
        let resp = merger.hybrid_search("deploy", &filters).await.unwrap();
        assert_eq!(resp.count, 1);

        let resp = merger
            .hybrid_search("   ", &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(resp.count, 0);
    }
}
