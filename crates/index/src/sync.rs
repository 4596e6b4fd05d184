//! Keeps the vector index in step with the primary store.
//!
//! Writes to the primary store commit first; embedding runs afterwards on a
//! spawned task and can never roll the write back. A failed sync lands in the
//! [`RetryQueue`], which [`EmbeddingSyncCoordinator::process_retry_queue`]
//! drains with exponential backoff until the entry succeeds or is dead-lettered.

use std::{sync::Arc, time::Duration};

use {
    serde::{Deserialize, Deserializer, Serialize},
    tokio::task::JoinHandle,
    tracing::{debug, info, warn},
};

use crate::{
    chunker::Chunker,
    metadata::{DocumentMetadata, date_bucket},
    now_ms,
    retry_queue::{
        DeadLetterReset, RetryOperation, RetryQueue, RetryQueueEntry, RetryQueueStats,
        STALLED_CLAIM_AFTER,
    },
    store::{NewWorkNote, PrimaryStore, WorkNote, WorkNoteUpdate},
    vector_index::VectorIndexAdapter,
};

/// Metadata supplied by the caller instead of derived from current owners.
///
/// Stored with a retry entry so the sweep re-embeds with the same metadata
/// the failed write asked for. `owner_group: Some(None)` clears the group and
/// is kept distinct from an absent override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person_ids: Option<Vec<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_option"
    )]
    pub owner_group: Option<Option<String>>,
}

/// A present key (even `null`) is `Some`; `default` covers the absent key.
fn present_option<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

impl SyncOverrides {
    pub fn is_empty(&self) -> bool {
        self.person_ids.is_none() && self.owner_group.is_none()
    }

    /// JSON form persisted on a retry entry; `None` when nothing is overridden.
    pub fn to_stored(&self) -> anyhow::Result<Option<serde_json::Value>> {
        if self.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::to_value(self)?))
    }

    pub fn from_stored(stored: Option<&serde_json::Value>) -> anyhow::Result<Self> {
        match stored {
            Some(value) => Ok(Self::deserialize(value)?),
            None => Ok(Self::default()),
        }
    }
}

/// A committed primary-store write plus its background embedding task.
#[derive(Debug)]
pub struct Committed<T> {
    pub record: T,
    pub sync: JoinHandle<()>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub document_id: String,
    pub chunks: usize,
    pub stale_removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    /// Entries that vanished or were claimed elsewhere.
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReindexReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct EmbeddingSyncCoordinator {
    store: Arc<dyn PrimaryStore>,
    index: Arc<VectorIndexAdapter>,
    queue: Arc<RetryQueue>,
    chunker: Chunker,
}

impl EmbeddingSyncCoordinator {
    pub fn new(
        store: Arc<dyn PrimaryStore>,
        index: Arc<VectorIndexAdapter>,
        queue: Arc<RetryQueue>,
    ) -> Self {
        Self {
            store,
            index,
            queue,
            chunker: Chunker::default(),
        }
    }

    pub fn with_chunker(mut self, chunker: Chunker) -> Self {
        self.chunker = chunker;
        self
    }

    pub fn queue(&self) -> &RetryQueue {
        &self.queue
    }

    pub async fn create_note(
        self: &Arc<Self>,
        note: NewWorkNote,
    ) -> anyhow::Result<Committed<WorkNote>> {
        let record = self.store.create_note(note).await?;
        let sync = self.spawn_sync(
            record.id.clone(),
            RetryOperation::Create,
            SyncOverrides::default(),
        );
        Ok(Committed { record, sync })
    }

    /// Returns `None` when the note does not exist; nothing is spawned then.
    pub async fn update_note(
        self: &Arc<Self>,
        id: &str,
        update: WorkNoteUpdate,
        overrides: SyncOverrides,
    ) -> anyhow::Result<Option<Committed<WorkNote>>> {
        let Some(record) = self.store.update_note(id, update).await? else {
            return Ok(None);
        };
        let sync = self.spawn_sync(record.id.clone(), RetryOperation::Update, overrides);
        Ok(Some(Committed { record, sync }))
    }

    /// Delete the note (its retry entry cascades), then drop its chunks in the
    /// background. Chunks left behind by a failed vector delete are orphaned.
    pub async fn delete_note(self: &Arc<Self>, id: &str) -> anyhow::Result<Committed<bool>> {
        let deleted = self.store.delete_note(id).await?;
        let this = Arc::clone(self);
        let document_id = id.to_string();
        let sync = tokio::spawn(async move {
            match this.index.delete_document(&document_id).await {
                Ok(removed) => {
                    debug!(document_id = %document_id, removed = removed.len(), "deleted note chunks");
                },
                Err(e) => {
                    warn!(document_id = %document_id, error = %e, "failed to delete note chunks, leaving orphans");
                },
            }
        });
        Ok(Committed {
            record: deleted,
            sync,
        })
    }

    fn spawn_sync(
        self: &Arc<Self>,
        document_id: String,
        operation: RetryOperation,
        overrides: SyncOverrides,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.sync_document(&document_id, &overrides).await {
                warn!(document_id = %document_id, operation = operation.as_str(), error = %e, "embedding sync failed");
                let queued = match overrides.to_stored() {
                    Ok(stored) => {
                        this.queue
                            .enqueue_retry_with_overrides(&document_id, operation, &e, stored.as_ref())
                            .await
                    },
                    Err(se) => Err(se),
                };
                if let Err(qe) = queued {
                    warn!(document_id = %document_id, error = %qe, "failed to enqueue embedding retry");
                }
            }
        })
    }

    /// Derive metadata from the note's current state, embed every chunk, and
    /// only then remove chunks the new version no longer produces.
    ///
    /// Returns `None` when the note no longer exists.
    pub async fn sync_document(
        &self,
        document_id: &str,
        overrides: &SyncOverrides,
    ) -> anyhow::Result<Option<SyncSummary>> {
        let Some(details) = self.store.find_by_id_with_details(document_id).await? else {
            debug!(document_id, "note vanished before sync");
            return Ok(None);
        };
        let note = details.note;

        let person_ids = overrides
            .person_ids
            .clone()
            .unwrap_or_else(|| note.person_ids.clone());
        let owner_group = match &overrides.owner_group {
            Some(group) => group.clone(),
            None => match person_ids.first() {
                Some(owner) => self.store.resolve_group_for_owner(owner).await?,
                None => None,
            },
        };
        let metadata = DocumentMetadata {
            person_ids,
            owner_group,
            category: note.category.clone(),
            date_bucket: date_bucket(note.created_at),
            ..Default::default()
        };

        let chunks = self
            .chunker
            .chunk(&note.id, &note.title, &note.content, &metadata);
        self.index.upsert_chunks(&chunks).await?;
        let keep: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        let stale = self.index.delete_stale_chunks(&note.id, &keep).await?;
        self.store.mark_embedded(&note.id, now_ms()).await?;

        info!(document_id, chunks = chunks.len(), stale_removed = stale.len(), "note embedded");
        Ok(Some(SyncSummary {
            document_id: note.id,
            chunks: chunks.len(),
            stale_removed: stale.len(),
        }))
    }

    pub async fn process_retry_queue(&self, limit: usize) -> anyhow::Result<SweepReport> {
        self.process_retry_queue_at(limit, now_ms()).await
    }

    /// One sweep over entries due at `now`. Concurrent sweeps may both pick
    /// an entry; the guarded claim lets only one of them process it.
    pub async fn process_retry_queue_at(
        &self,
        limit: usize,
        now: i64,
    ) -> anyhow::Result<SweepReport> {
        self.queue.release_stalled_claims(STALLED_CLAIM_AFTER).await?;
        let due = self.queue.get_retryable_items_at(limit, now).await?;

        let mut report = SweepReport::default();
        for entry in due {
            match self.queue.mark_retrying(&entry.id).await {
                Ok(true) => report.claimed += 1,
                Ok(false) => {
                    report.skipped += 1;
                    continue;
                },
                Err(e) => {
                    debug!(id = %entry.id, error = %e, "retry entry claimed elsewhere");
                    report.skipped += 1;
                    continue;
                },
            }

            match self.run_entry(&entry).await {
                Ok(()) => {
                    self.queue.delete_retry_item(&entry.id).await?;
                    report.succeeded += 1;
                },
                Err(e) => {
                    let attempt = entry.attempt_count + 1;
                    if attempt >= entry.max_attempts {
                        self.queue.move_to_dead_letter(&entry.id, attempt, &e).await?;
                        report.dead_lettered += 1;
                    } else {
                        self.queue.update_retry_attempt(&entry.id, attempt, &e).await?;
                        report.rescheduled += 1;
                    }
                },
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                succeeded = report.succeeded,
                rescheduled = report.rescheduled,
                dead_lettered = report.dead_lettered,
                "retry sweep finished"
            );
        }
        Ok(report)
    }

    async fn run_entry(&self, entry: &RetryQueueEntry) -> anyhow::Result<()> {
        match entry.operation_type {
            RetryOperation::Delete => {
                self.index.delete_document(&entry.document_id).await?;
            },
            RetryOperation::Create | RetryOperation::Update => {
                let overrides = SyncOverrides::from_stored(entry.overrides.as_ref())?;
                if self
                    .sync_document(&entry.document_id, &overrides)
                    .await?
                    .is_none()
                {
                    debug!(document_id = %entry.document_id, "dropping retry for missing note");
                }
            },
        }
        Ok(())
    }

    /// Run [`Self::process_retry_queue`] every `interval` until the task is aborted.
    pub fn spawn_retry_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        batch_size: usize,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = this.process_retry_queue(batch_size).await {
                    warn!(error = %e, "retry sweep failed");
                }
            }
        })
    }

    /// Re-embed every note, page by page. Failures are queued for retry.
    pub async fn reindex_all(&self, batch_size: usize) -> anyhow::Result<ReindexReport> {
        let batch_size = batch_size.max(1);
        let mut report = ReindexReport::default();
        let mut offset = 0;
        loop {
            let ids = self.store.list_ids(offset, batch_size).await?;
            if ids.is_empty() {
                break;
            }
            offset += ids.len();
            for id in ids {
                self.sync_counted(&id, RetryOperation::Update, &mut report)
                    .await?;
            }
        }
        info!(processed = report.processed, failed = report.failed, "reindex finished");
        Ok(report)
    }

    /// Returns `false` when the note does not exist.
    pub async fn reindex_one(&self, id: &str) -> anyhow::Result<bool> {
        Ok(self
            .sync_document(id, &SyncOverrides::default())
            .await?
            .is_some())
    }

    /// Embed one batch of notes never embedded or edited since.
    pub async fn embed_pending(&self, batch_size: usize) -> anyhow::Result<ReindexReport> {
        let mut report = ReindexReport::default();
        for id in self.store.list_pending_embedding(batch_size.max(1)).await? {
            self.sync_counted(&id, RetryOperation::Create, &mut report)
                .await?;
        }
        Ok(report)
    }

    async fn sync_counted(
        &self,
        id: &str,
        operation: RetryOperation,
        report: &mut ReindexReport,
    ) -> anyhow::Result<()> {
        report.processed += 1;
        match self.sync_document(id, &SyncOverrides::default()).await {
            Ok(_) => report.succeeded += 1,
            Err(e) => {
                warn!(document_id = id, error = %e, "sync failed, queueing retry");
                self.queue.enqueue_retry(id, operation, &e).await?;
                report.failed += 1;
            },
        }
        Ok(())
    }

    pub async fn list_dead_letter(
        &self,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<Vec<RetryQueueEntry>> {
        self.queue.list_dead_letter(limit, offset).await
    }

    pub async fn retry_dead_letter_item(&self, id: &str) -> anyhow::Result<DeadLetterReset> {
        self.queue.retry_dead_letter_item(id).await
    }

    pub async fn retry_queue_stats(&self) -> anyhow::Result<RetryQueueStats> {
        self.queue.stats().await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            chunker::{ChunkerConfig, chunk_id},
            metadata::FIELD_DOCUMENT_ID,
            retry_queue::RetryStatus,
            store::Person,
            store_sqlite::SqliteWorkNoteStore,
            test_support::{MockEmbedder, migrated_pool},
            vector_store::VectorFilter,
            vector_store_sqlite::SqliteVectorStore,
        },
    };

    const FAR_FUTURE: i64 = i64::MAX / 2;

    struct Fixture {
        coordinator: Arc<EmbeddingSyncCoordinator>,
        store: Arc<SqliteWorkNoteStore>,
        vectors: Arc<SqliteVectorStore>,
        index: Arc<VectorIndexAdapter>,
        embedder: Arc<MockEmbedder>,
    }

    async fn fixture() -> Fixture {
        let pool = migrated_pool().await;
        let store = Arc::new(SqliteWorkNoteStore::new(pool.clone()));
        store
            .upsert_person(&Person {
                id: "P-1".into(),
                name: "Kim".into(),
                department: Some("Platform".into()),
            })
            .await
            .unwrap();
        let embedder = Arc::new(MockEmbedder::default());
        let vectors = Arc::new(SqliteVectorStore::new(pool.clone()));
        let index = Arc::new(VectorIndexAdapter::new(embedder.clone(), vectors.clone()));
        let coordinator = Arc::new(
            EmbeddingSyncCoordinator::new(
                store.clone(),
                index.clone(),
                Arc::new(RetryQueue::new(pool)),
            )
            // 16-character windows keep multi-chunk notes small.
            .with_chunker(Chunker::new(ChunkerConfig {
                chunk_size_tokens: 4,
                overlap_ratio: 0.0,
            })),
        );
        Fixture {
            coordinator,
            store,
            vectors,
            index,
            embedder,
        }
    }

    fn note(id: &str, content: &str) -> NewWorkNote {
        NewWorkNote {
            id: Some(id.into()),
            title: String::new(),
            content: content.into(),
            category: Some("ops".into()),
            person_ids: vec!["P-1".into()],
        }
    }

    async fn chunk_ids(f: &Fixture, doc: &str) -> Vec<String> {
        let mut filter = VectorFilter::new();
        filter.insert(FIELD_DOCUMENT_ID.into(), doc.into());
        let mut ids: Vec<String> = f
            .index
            .search("rust", 100, Some(filter))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn create_embeds_in_background() {
        let f = fixture().await;
        let committed = f
            .coordinator
            .create_note(note("W-1", "rust deploy notes for the team"))
            .await
            .unwrap();
        assert_eq!(committed.record.id, "W-1");
        committed.sync.await.unwrap();

        assert!(f.vectors.count().await.unwrap() > 1);
        let stored = f.store.find_by_id("W-1").await.unwrap().unwrap();
        assert!(stored.embedded_at.is_some());

        let hits = f.index.search("deploy", 1, None).await.unwrap();
        assert_eq!(hits[0].metadata.owner_group.as_deref(), Some("Platform"));
        assert_eq!(hits[0].metadata.category.as_deref(), Some("ops"));
        assert_eq!(hits[0].metadata.person_ids, vec!["P-1".to_string()]);
    }

    #[tokio::test]
    async fn failed_create_keeps_note_and_enqueues_retry() {
        let f = fixture().await;
        f.embedder.set_failing(true);
        let committed = f
            .coordinator
            .create_note(note("W-1", "database incident"))
            .await
            .unwrap();
        committed.sync.await.unwrap();

        assert!(f.store.find_by_id("W-1").await.unwrap().is_some());
        assert_eq!(f.vectors.count().await.unwrap(), 0);
        let items = f.coordinator.queue().get_retryable_items(10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].document_id, "W-1");
        assert_eq!(items[0].operation_type, RetryOperation::Create);
    }

    #[tokio::test]
    async fn update_shrinks_chunk_set() {
        let f = fixture().await;
        let long = "rust ".repeat(16);
        f.coordinator
            .create_note(note("W-1", &long))
            .await
            .unwrap()
            .sync
            .await
            .unwrap();
        let before = chunk_ids(&f, "W-1").await;
        assert_eq!(before.len(), 5);

        let committed = f
            .coordinator
            .update_note(
                "W-1",
                WorkNoteUpdate {
                    content: Some("rust rust rust rust rust".into()),
                    ..Default::default()
                },
                SyncOverrides::default(),
            )
            .await
            .unwrap()
            .unwrap();
        committed.sync.await.unwrap();

        assert_eq!(chunk_ids(&f, "W-1").await, vec![
            chunk_id("W-1", 0),
            chunk_id("W-1", 1)
        ]);
    }

    #[tokio::test]
    async fn failed_update_leaves_previous_chunks_queryable() {
        let f = fixture().await;
        f.coordinator
            .create_note(note("W-1", &"rust ".repeat(16)))
            .await
            .unwrap()
            .sync
            .await
            .unwrap();
        let before = chunk_ids(&f, "W-1").await;

        f.embedder.set_failing(true);
        f.coordinator
            .update_note(
                "W-1",
                WorkNoteUpdate {
                    content: Some("rust".into()),
                    ..Default::default()
                },
                SyncOverrides::default(),
            )
            .await
            .unwrap()
            .unwrap()
            .sync
            .await
            .unwrap();

        f.embedder.set_failing(false);
        assert_eq!(chunk_ids(&f, "W-1").await, before);
        let items = f.coordinator.queue().get_retryable_items(10).await.unwrap();
        assert_eq!(items[0].operation_type, RetryOperation::Update);
    }

    #[tokio::test]
    async fn overrides_replace_derived_metadata() {
        let f = fixture().await;
        f.coordinator
            .create_note(note("W-1", "hiring plan"))
            .await
            .unwrap()
            .sync
            .await
            .unwrap();

        f.coordinator
            .update_note("W-1", WorkNoteUpdate::default(), SyncOverrides {
                person_ids: Some(vec!["P-9".into()]),
                owner_group: Some(Some("Recruiting".into())),
            })
            .await
            .unwrap()
            .unwrap()
            .sync
            .await
            .unwrap();

        let hits = f.index.search("hiring", 1, None).await.unwrap();
        assert_eq!(hits[0].metadata.owner_group.as_deref(), Some("Recruiting"));
        assert_eq!(hits[0].metadata.person_ids, vec!["P-9".to_string()]);
    }

    #[tokio::test]
    async fn retried_update_keeps_its_overrides() {
        let f = fixture().await;
        f.coordinator
            .create_note(note("W-1", "hiring plan"))
            .await
            .unwrap()
            .sync
            .await
            .unwrap();

        f.embedder.set_failing(true);
        f.coordinator
            .update_note(
                "W-1",
                WorkNoteUpdate {
                    content: Some("hiring plan for next quarter".into()),
                    ..Default::default()
                },
                SyncOverrides {
                    person_ids: None,
                    owner_group: Some(Some("Recruiting".into())),
                },
            )
            .await
            .unwrap()
            .unwrap()
            .sync
            .await
            .unwrap();
        let queued = f
            .coordinator
            .queue()
            .get_retryable_items_at(10, FAR_FUTURE)
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert!(queued[0].overrides.is_some());

        f.embedder.set_failing(false);
        let report = f
            .coordinator
            .process_retry_queue_at(10, FAR_FUTURE)
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);

        let hits = f.index.search("hiring", 1, None).await.unwrap();
        assert_eq!(hits[0].metadata.owner_group.as_deref(), Some("Recruiting"));
        assert_eq!(hits[0].metadata.person_ids, vec!["P-1".to_string()]);
    }

    #[test]
    fn cleared_owner_group_survives_storage() {
        assert_eq!(SyncOverrides::default().to_stored().unwrap(), None);

        let cleared = SyncOverrides {
            person_ids: None,
            owner_group: Some(None),
        };
        let stored = cleared.to_stored().unwrap().unwrap();
        assert_eq!(stored, serde_json::json!({ "owner_group": null }));
        assert_eq!(SyncOverrides::from_stored(Some(&stored)).unwrap(), cleared);
        assert_eq!(
            SyncOverrides::from_stored(None).unwrap(),
            SyncOverrides::default()
        );
    }

    #[tokio::test]
    async fn delete_removes_chunks_and_queue_entry() {
        let f = fixture().await;
        f.embedder.set_failing(true);
        f.coordinator
            .create_note(note("W-1", "network budget"))
            .await
            .unwrap()
            .sync
            .await
            .unwrap();
        assert_eq!(f.coordinator.retry_queue_stats().await.unwrap().pending, 1);
        f.embedder.set_failing(false);

        let committed = f.coordinator.delete_note("W-1").await.unwrap();
        assert!(committed.record);
        committed.sync.await.unwrap();
        assert_eq!(f.coordinator.retry_queue_stats().await.unwrap().pending, 0);

        let missing = f.coordinator.delete_note("W-1").await.unwrap();
        assert!(!missing.record);
    }

    #[tokio::test]
    async fn sweep_backs_off_then_dead_letters() {
        let f = fixture().await;
        f.embedder.set_failing(true);
        f.coordinator
            .create_note(note("W-1", "search incident"))
            .await
            .unwrap()
            .sync
            .await
            .unwrap();

        for expected_attempt in 1..3 {
            let report = f
                .coordinator
                .process_retry_queue_at(10, FAR_FUTURE)
                .await
                .unwrap();
            assert_eq!(report.rescheduled, 1);
            let entry = f
                .coordinator
                .queue()
                .get_retryable_items_at(10, FAR_FUTURE)
                .await
                .unwrap()
                .remove(0);
            assert_eq!(entry.attempt_count, expected_attempt);
            assert_eq!(entry.status, RetryStatus::Pending);
        }

        let report = f
            .coordinator
            .process_retry_queue_at(10, FAR_FUTURE)
            .await
            .unwrap();
        assert_eq!(report.dead_lettered, 1);
        let dead = f.coordinator.list_dead_letter(10, 0).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempt_count, 3);
        assert!(
            f.coordinator
                .process_retry_queue_at(10, FAR_FUTURE)
                .await
                .unwrap()
                .claimed
                == 0
        );

        // Manual reset, then a healthy provider drains the queue.
        f.embedder.set_failing(false);
        assert_eq!(
            f.coordinator
                .retry_dead_letter_item(&dead[0].id)
                .await
                .unwrap(),
            DeadLetterReset::Requeued
        );
        let report = f.coordinator.process_retry_queue(10).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(
            f.coordinator.retry_queue_stats().await.unwrap(),
            RetryQueueStats::default()
        );
        assert!(f.vectors.count().await.unwrap() > 0);
    }

    #[tokio::test]
    async fn admin_reindex_and_embed_pending() {
        let f = fixture().await;
        for (id, content) in [("W-1", "rust"), ("W-2", "deploy"), ("W-3", "budget")] {
            f.store.create_note(note(id, content)).await.unwrap();
        }

        let report = f.coordinator.embed_pending(2).await.unwrap();
        assert_eq!(report, ReindexReport {
            processed: 2,
            succeeded: 2,
            failed: 0,
        });
        let report = f.coordinator.embed_pending(10).await.unwrap();
        assert_eq!(report.processed, 1);
        assert!(f.store.list_pending_embedding(10).await.unwrap().is_empty());

        let report = f.coordinator.reindex_all(2).await.unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(report.succeeded, 3);

        assert!(f.coordinator.reindex_one("W-2").await.unwrap());
        assert!(!f.coordinator.reindex_one("W-404").await.unwrap());

        f.embedder.set_failing(true);
        let report = f.coordinator.reindex_all(10).await.unwrap();
        assert_eq!(report.failed, 3);
        assert_eq!(f.coordinator.retry_queue_stats().await.unwrap().pending, 3);
    }
}
