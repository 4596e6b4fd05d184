//! Durable retry queue for failed embedding syncs.
//!
//! Entry lifecycle:
//!
//! ```text
//!   (enqueue) ──► pending ──claim──► retrying ──success──► (deleted)
//!                   ▲                  │   │
//!                   └────backoff───────┘   └─attempts exhausted─► dead_letter
//!                   ▲                                                │
//!                   └────────────── manual retry ────────────────────┘
//! ```
//!
//! Every status write is guarded by the expected current status, so a row that
//! moved underneath a caller surfaces as a [`TransitionError`] instead of being
//! silently overwritten.

use std::{fmt, time::Duration};

use {
    serde::Serialize,
    sqlx::SqlitePool,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::{embeddings::FailureKind, now_ms};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Claims older than this are assumed to belong to a crashed sweep.
pub const STALLED_CLAIM_AFTER: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Pending,
    Retrying,
    DeadLetter,
}

impl RetryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "retrying" => Some(Self::Retrying),
            "dead_letter" => Some(Self::DeadLetter),
            _ => None,
        }
    }

    /// Validate a move from `from` (`None` for a new entry) to `to`.
    pub fn check_transition(from: Option<Self>, to: Self) -> Result<(), TransitionError> {
        let legal = matches!(
            (from, to),
            (None, Self::Pending)
                | (Some(Self::Pending), Self::Retrying)
                | (Some(Self::Retrying), Self::Pending)
                | (Some(Self::Retrying), Self::DeadLetter)
                | (Some(Self::DeadLetter), Self::Pending)
        );
        if legal {
            Ok(())
        } else {
            Err(TransitionError { from, to })
        }
    }
}

impl fmt::Display for RetryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal retry queue transition {} -> {to}", .from.map_or("(new)", RetryStatus::as_str))]
pub struct TransitionError {
    pub from: Option<RetryStatus>,
    pub to: RetryStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOperation {
    Create,
    Update,
    Delete,
}

impl RetryOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryQueueEntry {
    pub id: String,
    pub document_id: String,
    pub operation_type: RetryOperation,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: i64,
    pub status: RetryStatus,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    /// Metadata overrides of the failed write, replayed on retry.
    pub overrides: Option<serde_json::Value>,
    pub created_at: i64,
    pub updated_at: i64,
    pub dead_letter_at: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    id: String,
    document_id: String,
    operation_type: String,
    attempt_count: i64,
    max_attempts: i64,
    next_retry_at: i64,
    status: String,
    error_message: Option<String>,
    error_details: Option<String>,
    overrides: Option<String>,
    created_at: i64,
    updated_at: i64,
    dead_letter_at: Option<i64>,
}

impl TryFrom<EntryRow> for RetryQueueEntry {
    type Error = anyhow::Error;

    fn try_from(row: EntryRow) -> anyhow::Result<Self> {
        let status = RetryStatus::parse(&row.status)
            .ok_or_else(|| anyhow::anyhow!("unknown retry status {:?}", row.status))?;
        let operation_type = RetryOperation::parse(&row.operation_type).ok_or_else(|| {
            anyhow::anyhow!("unknown retry operation {:?}", row.operation_type)
        })?;
        Ok(Self {
            id: row.id,
            document_id: row.document_id,
            operation_type,
            attempt_count: u32::try_from(row.attempt_count)?,
            max_attempts: u32::try_from(row.max_attempts)?,
            next_retry_at: row.next_retry_at,
            status,
            error_message: row.error_message,
            // Details are diagnostic; an unparsable blob is not worth failing a listing.
            error_details: row
                .error_details
                .and_then(|raw| serde_json::from_str(&raw).ok()),
            overrides: row
                .overrides
                .map(|raw| serde_json::from_str(&raw))
                .transpose()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            dead_letter_at: row.dead_letter_at,
        })
    }
}

/// Outcome of a manual dead-letter retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReset {
    /// Back to `pending` with a fresh attempt budget.
    Requeued,
    /// A live entry already covers the document; the dead-letter row was dropped.
    Superseded,
    NotFound,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryQueueStats {
    pub pending: u64,
    pub retrying: u64,
    pub dead_letter: u64,
}

/// Exponential backoff: `2^attempt` seconds.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(32))
}

/// Structured failure context stored next to the display message.
pub fn error_details(operation: RetryOperation, err: &anyhow::Error) -> serde_json::Value {
    serde_json::json!({
        "kind": FailureKind::classify(err).as_str(),
        "operation": operation.as_str(),
        "chain": err.chain().map(ToString::to_string).collect::<Vec<_>>(),
    })
}

const SELECT_ENTRY: &str = "SELECT id, document_id, operation_type, attempt_count, max_attempts, \
     next_retry_at, status, error_message, error_details, overrides, created_at, updated_at, \
     dead_letter_at FROM embedding_retry_queue";

pub struct RetryQueue {
    pool: SqlitePool,
    max_attempts: u32,
}

impl RetryQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Record a failed sync. Returns `false` when a live entry for the
    /// document already exists; the existing entry is left untouched.
    pub async fn enqueue_retry(
        &self,
        document_id: &str,
        operation: RetryOperation,
        err: &anyhow::Error,
    ) -> anyhow::Result<bool> {
        self.enqueue_retry_with_overrides(document_id, operation, err, None)
            .await
    }

    /// Like [`Self::enqueue_retry`], also storing the write's metadata
    /// overrides. When a live entry already exists only its overrides are
    /// replaced, so the retry replays the most recent write.
    pub async fn enqueue_retry_with_overrides(
        &self,
        document_id: &str,
        operation: RetryOperation,
        err: &anyhow::Error,
        overrides: Option<&serde_json::Value>,
    ) -> anyhow::Result<bool> {
        RetryStatus::check_transition(None, RetryStatus::Pending)?;
        let now = now_ms();
        let details = error_details(operation, err).to_string();
        let overrides = overrides.map(ToString::to_string);
        let result = sqlx::query(
            "INSERT OR IGNORE INTO embedding_retry_queue \
             (id, document_id, operation_type, attempt_count, max_attempts, next_retry_at, \
              status, error_message, error_details, overrides, created_at, updated_at) \
             VALUES (?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(document_id)
        .bind(operation.as_str())
        .bind(i64::from(self.max_attempts))
        .bind(now)
        .bind(RetryStatus::Pending.as_str())
        .bind(err.to_string())
        .bind(details)
        .bind(overrides.as_deref())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        if inserted {
            info!(document_id, operation = operation.as_str(), error = %err, "enqueued embedding retry");
            #[cfg(feature = "metrics")]
            counter!("worknotes_retry_enqueued_total", "operation" => operation.as_str())
                .increment(1);
        } else if let Some(overrides) = overrides {
            sqlx::query(
                "UPDATE embedding_retry_queue SET overrides = ?, updated_at = ? \
                 WHERE document_id = ? AND status != ?",
            )
            .bind(overrides)
            .bind(now)
            .bind(document_id)
            .bind(RetryStatus::DeadLetter.as_str())
            .execute(&self.pool)
            .await?;
            debug!(document_id, "retry already queued for document; overrides replaced");
        } else {
            debug!(document_id, "retry already queued for document");
        }
        Ok(inserted)
    }

    pub async fn get_retryable_items(&self, limit: usize) -> anyhow::Result<Vec<RetryQueueEntry>> {
        self.get_retryable_items_at(limit, now_ms()).await
    }

    /// Pending entries due at `now`, oldest due first.
    pub async fn get_retryable_items_at(
        &self,
        limit: usize,
        now: i64,
    ) -> anyhow::Result<Vec<RetryQueueEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "{SELECT_ENTRY} WHERE status = ? AND next_retry_at <= ? \
             ORDER BY next_retry_at, created_at LIMIT ?"
        ))
        .bind(RetryStatus::Pending.as_str())
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RetryQueueEntry::try_from).collect()
    }

    pub async fn get(&self, id: &str) -> anyhow::Result<Option<RetryQueueEntry>> {
        let row: Option<EntryRow> = sqlx::query_as(&format!("{SELECT_ENTRY} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(RetryQueueEntry::try_from).transpose()
    }

    /// Claim a pending entry for processing. Returns `false` if the entry is
    /// gone (e.g. its note was deleted).
    pub async fn mark_retrying(&self, id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE embedding_retry_queue SET status = ?, updated_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(RetryStatus::Retrying.as_str())
        .bind(now_ms())
        .bind(id)
        .bind(RetryStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;
        self.guarded(id, result.rows_affected(), RetryStatus::Retrying)
            .await
    }

    /// Reschedule a claimed entry after a failed attempt.
    pub async fn update_retry_attempt(
        &self,
        id: &str,
        attempt: u32,
        err: &anyhow::Error,
    ) -> anyhow::Result<bool> {
        let now = now_ms();
        let delay_ms = i64::try_from(backoff_delay(attempt).as_millis()).unwrap_or(i64::MAX);
        let next_retry_at = now.saturating_add(delay_ms);
        let entry = self.get(id).await?;
        let operation = entry.map_or(RetryOperation::Update, |e| e.operation_type);

        let result = sqlx::query(
            "UPDATE embedding_retry_queue \
             SET status = ?, attempt_count = ?, next_retry_at = ?, error_message = ?, \
                 error_details = ?, updated_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(RetryStatus::Pending.as_str())
        .bind(i64::from(attempt))
        .bind(next_retry_at)
        .bind(err.to_string())
        .bind(error_details(operation, err).to_string())
        .bind(now)
        .bind(id)
        .bind(RetryStatus::Retrying.as_str())
        .execute(&self.pool)
        .await?;
        let updated = self
            .guarded(id, result.rows_affected(), RetryStatus::Pending)
            .await?;
        if updated {
            debug!(id, attempt, next_retry_at, "rescheduled embedding retry");
        }
        Ok(updated)
    }

    /// Park a claimed entry whose attempts are exhausted.
    pub async fn move_to_dead_letter(
        &self,
        id: &str,
        attempt: u32,
        err: &anyhow::Error,
    ) -> anyhow::Result<bool> {
        let now = now_ms();
        let entry = self.get(id).await?;
        let operation = entry.map_or(RetryOperation::Update, |e| e.operation_type);

        let result = sqlx::query(
            "UPDATE embedding_retry_queue \
             SET status = ?, attempt_count = ?, error_message = ?, error_details = ?, \
                 dead_letter_at = ?, updated_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(RetryStatus::DeadLetter.as_str())
        .bind(i64::from(attempt))
        .bind(err.to_string())
        .bind(error_details(operation, err).to_string())
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(RetryStatus::Retrying.as_str())
        .execute(&self.pool)
        .await?;
        let moved = self
            .guarded(id, result.rows_affected(), RetryStatus::DeadLetter)
            .await?;
        if moved {
            warn!(id, attempt, error = %err, "embedding retry moved to dead letter");
            #[cfg(feature = "metrics")]
            counter!("worknotes_retry_dead_letter_total").increment(1);
        }
        Ok(moved)
    }

    pub async fn delete_retry_item(&self, id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM embedding_retry_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Most recently dead-lettered first.
    pub async fn list_dead_letter(
        &self,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<Vec<RetryQueueEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "{SELECT_ENTRY} WHERE status = ? ORDER BY dead_letter_at DESC, id LIMIT ? OFFSET ?"
        ))
        .bind(RetryStatus::DeadLetter.as_str())
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RetryQueueEntry::try_from).collect()
    }

    /// Manually re-arm a dead-lettered entry with a fresh attempt budget.
    pub async fn retry_dead_letter_item(&self, id: &str) -> anyhow::Result<DeadLetterReset> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(String, String)> =
            sqlx::query_as("SELECT status, document_id FROM embedding_retry_queue WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((status, document_id)) = row else {
            return Ok(DeadLetterReset::NotFound);
        };
        let current = RetryStatus::parse(&status);
        if current != Some(RetryStatus::DeadLetter) {
            return Err(TransitionError {
                from: current,
                to: RetryStatus::Pending,
            }
            .into());
        }

        let live: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM embedding_retry_queue WHERE document_id = ? AND status != ?",
        )
        .bind(&document_id)
        .bind(RetryStatus::DeadLetter.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = if live.is_some() {
            sqlx::query("DELETE FROM embedding_retry_queue WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            DeadLetterReset::Superseded
        } else {
            let now = now_ms();
            sqlx::query(
                "UPDATE embedding_retry_queue \
                 SET status = ?, attempt_count = 0, next_retry_at = ?, dead_letter_at = NULL, \
                     updated_at = ? \
                 WHERE id = ?",
            )
            .bind(RetryStatus::Pending.as_str())
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            DeadLetterReset::Requeued
        };
        tx.commit().await?;

        info!(id, document_id = %document_id, outcome = ?outcome, "dead-letter entry retried");
        Ok(outcome)
    }

    /// Return claims abandoned by a crashed sweep to `pending`.
    pub async fn release_stalled_claims(&self, stalled_after: Duration) -> anyhow::Result<u64> {
        let cutoff = now_ms()
            .saturating_sub(i64::try_from(stalled_after.as_millis()).unwrap_or(i64::MAX));
        let result = sqlx::query(
            "UPDATE embedding_retry_queue SET status = ?, updated_at = ? \
             WHERE status = ? AND updated_at < ?",
        )
        .bind(RetryStatus::Pending.as_str())
        .bind(now_ms())
        .bind(RetryStatus::Retrying.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let released = result.rows_affected();
        if released > 0 {
            warn!(released, "released stalled retry claims");
        }
        Ok(released)
    }

    pub async fn stats(&self) -> anyhow::Result<RetryQueueStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM embedding_retry_queue GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut stats = RetryQueueStats::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            match RetryStatus::parse(&status) {
                Some(RetryStatus::Pending) => stats.pending = count,
                Some(RetryStatus::Retrying) => stats.retrying = count,
                Some(RetryStatus::DeadLetter) => stats.dead_letter = count,
                None => warn!(status = %status, "unknown status in retry queue"),
            }
        }
        Ok(stats)
    }

    /// Interpret the row count of a status-guarded update: `Ok(true)` when it
    /// applied, `Ok(false)` when the row is gone, and a [`TransitionError`]
    /// when the row sits in a status the move is not legal from.
    async fn guarded(&self, id: &str, rows_affected: u64, to: RetryStatus) -> anyhow::Result<bool> {
        if rows_affected > 0 {
            return Ok(true);
        }
        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM embedding_retry_queue WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        match current {
            None => Ok(false),
            Some((status,)) => Err(TransitionError {
                from: RetryStatus::parse(&status),
                to,
            }
            .into()),
        }
    }
}
