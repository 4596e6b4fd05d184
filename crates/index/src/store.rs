//! Primary record store interface consumed by the indexing core.
use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkNote {
    pub id: String,
    pub title: String,
    pub content: String,
    pub category: Option<String>,
    /// Owner person ids, in association order.
    pub person_ids: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub embedded_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Person {
    pub id: String,
    pub name: String,
    pub department: Option<String>,
}

/// A note with its owner rows resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkNoteDetails {
    pub note: WorkNote,
    pub owners: Vec<Person>,
}

#[derive(Debug, Clone, Default)]
pub struct NewWorkNote {
    /// Caller-chosen id; a random one is assigned when `None`.
    pub id: Option<String>,
    pub title: String,
    pub content: String,
    pub category: Option<String>,
    pub person_ids: Vec<String>,
}

/// Partial update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct WorkNoteUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub category: Option<Option<String>>,
    pub person_ids: Option<Vec<String>>,
}

#[async_trait]
pub trait PrimaryStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<WorkNote>>;
    async fn find_by_id_with_details(&self, id: &str) -> anyhow::Result<Option<WorkNoteDetails>>;
    /// Batch fetch. Unknown ids are skipped; order is unspecified.
    async fn find_by_ids(&self, ids: &[String]) -> anyhow::Result<Vec<WorkNote>>;
    async fn resolve_group_for_owner(&self, person_id: &str) -> anyhow::Result<Option<String>>;
    async fn mark_embedded(&self, id: &str, timestamp: i64) -> anyhow::Result<()>;

    /// Page through every note id, oldest first.
    async fn list_ids(&self, offset: usize, limit: usize) -> anyhow::Result<Vec<String>>;
    /// Notes never embedded, or edited since their last embedding.
    async fn list_pending_embedding(&self, limit: usize) -> anyhow::Result<Vec<String>>;

    async fn create_note(&self, note: NewWorkNote) -> anyhow::Result<WorkNote>;
    async fn update_note(&self, id: &str, update: WorkNoteUpdate)
    -> anyhow::Result<Option<WorkNote>>;
    /// Returns `false` when no such note existed.
    async fn delete_note(&self, id: &str) -> anyhow::Result<bool>;
}
