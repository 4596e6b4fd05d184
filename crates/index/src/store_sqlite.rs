use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::{
    now_ms,
    store::{NewWorkNote, Person, PrimaryStore, WorkNote, WorkNoteDetails, WorkNoteUpdate},
};

/// SQLite-backed primary store for work notes and their owners.
pub struct SqliteWorkNoteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct NoteRow {
    id: String,
    title: String,
    content: String,
    category: Option<String>,
    created_at: i64,
    updated_at: i64,
    embedded_at: Option<i64>,
}

impl NoteRow {
    fn into_note(self, person_ids: Vec<String>) -> WorkNote {
        WorkNote {
            id: self.id,
            title: self.title,
            content: self.content,
            category: self.category,
            person_ids,
            created_at: self.created_at,
            updated_at: self.updated_at,
            embedded_at: self.embedded_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PersonRow {
    id: String,
    name: String,
    department: Option<String>,
}

impl SqliteWorkNoteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn upsert_person(&self, person: &Person) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO persons (id, name, department) VALUES (?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET name = excluded.name, department = excluded.department"#,
        )
        .bind(&person.id)
        .bind(&person.name)
        .bind(&person.department)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Owner ids per note, in association order.
    async fn load_person_ids(
        &self,
        note_ids: &[String],
    ) -> anyhow::Result<HashMap<String, Vec<String>>> {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        if note_ids.is_empty() {
            return Ok(map);
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT note_id, person_id FROM work_note_persons WHERE note_id IN (");
        let mut separated = qb.separated(", ");
        for id in note_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(") ORDER BY note_id, position");
        let rows: Vec<(String, String)> = qb.build_query_as().fetch_all(&self.pool).await?;
        for (note_id, person_id) in rows {
            map.entry(note_id).or_default().push(person_id);
        }
        Ok(map)
    }

    async fn fetch_row(&self, id: &str) -> anyhow::Result<Option<NoteRow>> {
        Ok(sqlx::query_as::<_, NoteRow>(
            "SELECT id, title, content, category, created_at, updated_at, embedded_at \
             FROM work_notes WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn replace_owners(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        note_id: &str,
        person_ids: &[String],
    ) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM work_note_persons WHERE note_id = ?")
            .bind(note_id)
            .execute(&mut **tx)
            .await?;
        for (position, person_id) in person_ids.iter().enumerate() {
            sqlx::query(
                "INSERT OR IGNORE INTO work_note_persons (note_id, person_id, position) \
                 VALUES (?, ?, ?)",
            )
            .bind(note_id)
            .bind(person_id)
            .bind(position as i64)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PrimaryStore for SqliteWorkNoteStore {
    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<WorkNote>> {
        let Some(row) = self.fetch_row(id).await? else {
            return Ok(None);
        };
        let mut owners = self.load_person_ids(&[id.to_string()]).await?;
        let person_ids = owners.remove(id).unwrap_or_default();
        Ok(Some(row.into_note(person_ids)))
    }

    async fn find_by_id_with_details(&self, id: &str) -> anyhow::Result<Option<WorkNoteDetails>> {
        let Some(note) = self.find_by_id(id).await? else {
            return Ok(None);
        };
        let rows = sqlx::query_as::<_, PersonRow>(
            "SELECT p.id, p.name, p.department FROM work_note_persons wp \
             JOIN persons p ON p.id = wp.person_id \
             WHERE wp.note_id = ? ORDER BY wp.position",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        let owners = rows
            .into_iter()
            .map(|r| Person {
                id: r.id,
                name: r.name,
                department: r.department,
            })
            .collect();
        Ok(Some(WorkNoteDetails { note, owners }))
    }

    async fn find_by_ids(&self, ids: &[String]) -> anyhow::Result<Vec<WorkNote>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, title, content, category, created_at, updated_at, embedded_at \
             FROM work_notes WHERE id IN (",
        );
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");
        let rows: Vec<NoteRow> = qb.build_query_as().fetch_all(&self.pool).await?;

        let found: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let mut owners = self.load_person_ids(&found).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let person_ids = owners.remove(&row.id).unwrap_or_default();
                row.into_note(person_ids)
            })
            .collect())
    }

    async fn resolve_group_for_owner(&self, person_id: &str) -> anyhow::Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT department FROM persons WHERE id = ?")
                .bind(person_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(department,)| department))
    }

    async fn mark_embedded(&self, id: &str, timestamp: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE work_notes SET embedded_at = ? WHERE id = ?")
            .bind(timestamp)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_ids(&self, offset: usize, limit: usize) -> anyhow::Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM work_notes ORDER BY created_at, id LIMIT ? OFFSET ?")
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn list_pending_embedding(&self, limit: usize) -> anyhow::Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM work_notes \
             WHERE embedded_at IS NULL OR embedded_at < updated_at \
             ORDER BY updated_at, id LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn create_note(&self, note: NewWorkNote) -> anyhow::Result<WorkNote> {
        let id = note
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = now_ms();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO work_notes (id, title, content, category, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&note.title)
        .bind(&note.content)
        .bind(&note.category)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        Self::replace_owners(&mut tx, &id, &note.person_ids).await?;
        tx.commit().await?;

        Ok(WorkNote {
            id,
            title: note.title,
            content: note.content,
            category: note.category,
            person_ids: note.person_ids,
            created_at: now,
            updated_at: now,
            embedded_at: None,
        })
    }

    async fn update_note(
        &self,
        id: &str,
        update: WorkNoteUpdate,
    ) -> anyhow::Result<Option<WorkNote>> {
        let Some(existing) = self.fetch_row(id).await? else {
            return Ok(None);
        };
        let title = update.title.unwrap_or(existing.title);
        let content = update.content.unwrap_or(existing.content);
        let category = update.category.unwrap_or(existing.category);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE work_notes SET title = ?, content = ?, category = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(&title)
        .bind(&content)
        .bind(&category)
        .bind(now_ms())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if let Some(person_ids) = &update.person_ids {
            Self::replace_owners(&mut tx, id, person_ids).await?;
        }
        tx.commit().await?;

        self.find_by_id(id).await
    }

    async fn delete_note(&self, id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM work_notes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
