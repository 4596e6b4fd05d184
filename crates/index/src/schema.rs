//! SQLite schema for work notes, their owners, the FTS5 index and the
//! embedding retry queue.

use sqlx::SqlitePool;

const STATEMENTS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS persons (
        id          TEXT PRIMARY KEY,
        name        TEXT NOT NULL,
        department  TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS work_notes (
        id           TEXT PRIMARY KEY,
        title        TEXT NOT NULL,
        content      TEXT NOT NULL,
        category     TEXT,
        created_at   INTEGER NOT NULL,
        updated_at   INTEGER NOT NULL,
        embedded_at  INTEGER
    )"#,
    r#"CREATE TABLE IF NOT EXISTS work_note_persons (
        note_id    TEXT NOT NULL REFERENCES work_notes(id) ON DELETE CASCADE,
        person_id  TEXT NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
        position   INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (note_id, person_id)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_work_note_persons_person ON work_note_persons(person_id)",
    "CREATE INDEX IF NOT EXISTS idx_work_notes_created ON work_notes(created_at)",
    // Trigram tokenizer gives substring matching for both Latin and CJK text.
    r#"CREATE VIRTUAL TABLE IF NOT EXISTS work_notes_fts USING fts5(
        title,
        content,
        content='work_notes',
        content_rowid='rowid',
        tokenize='trigram'
    )"#,
    r#"CREATE TRIGGER IF NOT EXISTS work_notes_fts_insert AFTER INSERT ON work_notes BEGIN
        INSERT INTO work_notes_fts(rowid, title, content)
        VALUES (new.rowid, new.title, new.content);
    END"#,
    r#"CREATE TRIGGER IF NOT EXISTS work_notes_fts_delete AFTER DELETE ON work_notes BEGIN
        INSERT INTO work_notes_fts(work_notes_fts, rowid, title, content)
        VALUES ('delete', old.rowid, old.title, old.content);
    END"#,
    r#"CREATE TRIGGER IF NOT EXISTS work_notes_fts_update AFTER UPDATE OF title, content ON work_notes BEGIN
        INSERT INTO work_notes_fts(work_notes_fts, rowid, title, content)
        VALUES ('delete', old.rowid, old.title, old.content);
        INSERT INTO work_notes_fts(rowid, title, content)
        VALUES (new.rowid, new.title, new.content);
    END"#,
    r#"CREATE TABLE IF NOT EXISTS embedding_retry_queue (
        id              TEXT PRIMARY KEY,
        document_id     TEXT NOT NULL REFERENCES work_notes(id) ON DELETE CASCADE,
        operation_type  TEXT NOT NULL,
        attempt_count   INTEGER NOT NULL DEFAULT 0,
        max_attempts    INTEGER NOT NULL DEFAULT 3,
        next_retry_at   INTEGER NOT NULL,
        status          TEXT NOT NULL,
        error_message   TEXT,
        error_details   TEXT,
        overrides       TEXT,
        created_at      INTEGER NOT NULL,
        updated_at      INTEGER NOT NULL,
        dead_letter_at  INTEGER
    )"#,
    // At most one live (non dead-letter) entry per document.
    r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_retry_queue_live_document
        ON embedding_retry_queue(document_id) WHERE status != 'dead_letter'"#,
    "CREATE INDEX IF NOT EXISTS idx_retry_queue_due ON embedding_retry_queue(status, next_retry_at)",
];

/// Create every table, index and trigger. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
