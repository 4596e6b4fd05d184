//! SQLite-backed [`VectorStore`] with in-process cosine similarity.
//!
//! Rows are pre-filtered with `json_extract` equality on the metadata column,
//! then scored by a brute-force scan. Fine for the few thousand chunks a team's
//! work notes produce.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::{
    metadata::VectorMetadata,
    vector_store::{QueryOptions, VectorEntry, VectorMatch, VectorStore},
};

pub struct SqliteVectorStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct VectorRow {
    id: String,
    vector: Vec<u8>,
    metadata: String,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the backing table.
    pub async fn init(pool: &SqlitePool) -> anyhow::Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS vector_entries (
                id          TEXT PRIMARY KEY,
                vector      BLOB NOT NULL,
                dimensions  INTEGER NOT NULL,
                metadata    TEXT NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn count(&self) -> anyhow::Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM vector_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(&self, entries: &[VectorEntry]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                r#"INSERT INTO vector_entries (id, vector, dimensions, metadata)
                   VALUES (?, ?, ?, ?)
                   ON CONFLICT(id) DO UPDATE SET
                       vector = excluded.vector,
                       dimensions = excluded.dimensions,
                       metadata = excluded.metadata"#,
            )
            .bind(&entry.id)
            .bind(f32_vec_to_bytes(&entry.vector))
            .bind(entry.vector.len() as i64)
            .bind(serde_json::to_string(&entry.metadata)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_by_ids(&self, ids: &[String]) -> anyhow::Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM vector_entries WHERE id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn query(
        &self,
        vector: &[f32],
        options: &QueryOptions,
    ) -> anyhow::Result<Vec<VectorMatch>> {
        if options.top_k == 0 {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, vector, metadata FROM vector_entries WHERE 1 = 1");
        if let Some(filter) = &options.filter {
            for (field, value) in filter {
                qb.push(" AND json_extract(metadata, ")
                    .push_bind(format!("$.{field}"))
                    .push(") = ")
                    .push_bind(value);
            }
        }
        let rows: Vec<VectorRow> = qb.build_query_as().fetch_all(&self.pool).await?;

        let query_norm = norm(vector);
        let mut scored = Vec::with_capacity(rows.len());
        for row in rows {
            let score = if query_norm == 0.0 {
                0.0
            } else {
                cosine_similarity(vector, query_norm, &bytes_to_f32_vec(&row.vector))
            };
            scored.push((row, score));
        }

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
        scored.truncate(options.top_k);

        scored
            .into_iter()
            .map(|(row, score)| -> anyhow::Result<VectorMatch> {
                let metadata = if options.return_metadata {
                    serde_json::from_str::<VectorMetadata>(&row.metadata)?
                } else {
                    VectorMetadata::new()
                };
                Ok(VectorMatch {
                    id: row.id,
                    score,
                    metadata,
                })
            })
            .collect()
    }
}

fn f32_vec_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_f32_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity; mismatched dimensions and zero vectors score 0.
fn cosine_similarity(query: &[f32], query_norm: f32, stored: &[f32]) -> f32 {
    if query.len() != stored.len() {
        return 0.0;
    }
    let stored_norm = norm(stored);
    if stored_norm == 0.0 {
        return 0.0;
    }
    let dot: f32 = query.iter().zip(stored).map(|(a, b)| a * b).sum();
    dot / (query_norm * stored_norm)
}
