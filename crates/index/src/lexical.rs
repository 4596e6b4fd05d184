//! Keyword search over the FTS5 index.
//!
//! Substring matching is left to the trigram tokenizer; this module only
//! builds the MATCH expression, composes the optional filters and maps the
//! native bm25 rank onto a unit score.

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

/// Optional predicates shared by the lexical and semantic engines.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilters {
    pub category: Option<String>,
    /// Only notes owned by this person.
    pub person_id: Option<String>,
    /// Only notes whose primary (first) owner is in this department. This is
    /// the same group the semantic side stores as `owner_group`, so both
    /// engines agree on membership.
    pub department: Option<String>,
    /// Inclusive lower bound on creation time, unix ms.
    pub created_from: Option<i64>,
    /// Inclusive upper bound on creation time, unix ms.
    pub created_to: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexicalHit {
    pub id: String,
    /// Native bm25 rank; more negative is more relevant.
    pub rank: f64,
    pub score: f64,
}

#[async_trait]
pub trait LexicalSearch: Send + Sync {
    /// Best-first keyword hits, one per note.
    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> anyhow::Result<Vec<LexicalHit>>;
}

/// Map a bm25 rank (roughly `[-10, 0]`) to `[0, 1]`.
pub fn normalize_rank(rank: f64) -> f64 {
    (1.0 + rank / 10.0).clamp(0.0, 1.0)
}

/// Build an FTS5 expression: every whitespace-separated term quoted, all required.
pub fn build_match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" "))
}

pub struct LexicalSearcher {
    pool: SqlitePool,
}

impl LexicalSearcher {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LexicalSearch for LexicalSearcher {
    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> anyhow::Result<Vec<LexicalHit>> {
        let Some(expression) = build_match_expression(query.trim()) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT n.id, work_notes_fts.rank FROM work_notes_fts \
             JOIN work_notes n ON n.rowid = work_notes_fts.rowid \
             WHERE work_notes_fts MATCH ",
        );
        qb.push_bind(expression);
        if let Some(category) = &filters.category {
            qb.push(" AND n.category = ").push_bind(category);
        }
        if let Some(from) = filters.created_from {
            qb.push(" AND n.created_at >= ").push_bind(from);
        }
        if let Some(to) = filters.created_to {
            qb.push(" AND n.created_at <= ").push_bind(to);
        }
        if let Some(person_id) = &filters.person_id {
            qb.push(
                " AND EXISTS (SELECT 1 FROM work_note_persons wp \
                 WHERE wp.note_id = n.id AND wp.person_id = ",
            )
            .push_bind(person_id)
            .push(")");
        }
        if let Some(department) = &filters.department {
            qb.push(
                " AND EXISTS (SELECT 1 FROM work_note_persons wp \
                 JOIN persons p ON p.id = wp.person_id \
                 WHERE wp.note_id = n.id AND wp.position = 0 AND p.department = ",
            )
            .push_bind(department)
            .push(")");
        }
        qb.push(" ORDER BY work_notes_fts.rank LIMIT ")
            .push_bind(limit as i64);

        let rows: Vec<(String, f64)> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(id, rank)| LexicalHit {
                id,
                rank,
                score: normalize_rank(rank),
            })
            .collect())
    }
}
