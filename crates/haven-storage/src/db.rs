use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

/// Shared handle to the single Haven database.
///
/// Cheap to clone; all access is serialized through the connection mutex.
/// The mutex plus SQLite's transaction semantics are what make the queue's
/// claim-and-lease update atomic across cooperative tasks.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (creating if needed) the database at `path` and initialise the
    /// schema. Idempotent across restarts.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_db(&conn)?;
        info!(%path, "database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the connection for a sequence of statements.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    /// Run `f` inside a transaction, committing on `Ok` and rolling back on
    /// `Err`.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

/// Initialise the full Haven schema. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS message_history (
            internal_id          INTEGER PRIMARY KEY AUTOINCREMENT,
            interface_type       TEXT    NOT NULL,
            conversation_id      TEXT    NOT NULL,
            interface_message_id TEXT,
            turn_id              TEXT,
            thread_root_id       INTEGER REFERENCES message_history(internal_id),
            timestamp            TEXT    NOT NULL,
            role                 TEXT    NOT NULL,
            content              TEXT    NOT NULL,
            tool_calls           TEXT,   -- JSON list
            tool_call_id         TEXT,
            reasoning_info       TEXT,   -- provider-opaque JSON
            error_traceback      TEXT,
            attachments          TEXT    -- JSON list of attachment ids
        );
        CREATE INDEX IF NOT EXISTS idx_history_conversation
            ON message_history(conversation_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_history_turn
            ON message_history(turn_id);

        CREATE TABLE IF NOT EXISTS tasks (
            task_id          TEXT    NOT NULL PRIMARY KEY,
            task_type        TEXT    NOT NULL,
            payload          TEXT    NOT NULL,   -- JSON
            status           TEXT    NOT NULL DEFAULT 'pending',
            scheduled_at     TEXT    NOT NULL,
            created_at       TEXT    NOT NULL,
            retry_count      INTEGER NOT NULL DEFAULT 0,
            max_retries      INTEGER NOT NULL DEFAULT 3,
            last_error       TEXT,
            worker_id        TEXT,
            lease_expires_at TEXT,
            recurrence_rule  TEXT,
            original_task_id TEXT
        ) STRICT;
        -- Efficient dequeue: status + scheduled_at drives the polling query.
        CREATE INDEX IF NOT EXISTS idx_tasks_dequeue ON tasks(status, scheduled_at);

        CREATE TABLE IF NOT EXISTS schedule_automations (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            name              TEXT    NOT NULL,
            description       TEXT,
            conversation_id   TEXT    NOT NULL,
            interface_type    TEXT    NOT NULL DEFAULT 'api',
            enabled           INTEGER NOT NULL DEFAULT 1,
            action_type       TEXT    NOT NULL,
            action_config     TEXT    NOT NULL,   -- JSON
            recurrence_rule   TEXT    NOT NULL,
            next_scheduled_at TEXT,
            execution_count   INTEGER NOT NULL DEFAULT 0,
            last_execution_at TEXT,
            created_at        TEXT    NOT NULL,
            UNIQUE(conversation_id, name)
        );

        CREATE TABLE IF NOT EXISTS event_listeners (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            name              TEXT    NOT NULL,
            description       TEXT,
            conversation_id   TEXT    NOT NULL,
            interface_type    TEXT    NOT NULL DEFAULT 'api',
            enabled           INTEGER NOT NULL DEFAULT 1,
            action_type       TEXT    NOT NULL,
            action_config     TEXT    NOT NULL,   -- JSON
            source_id         TEXT    NOT NULL,
            match_conditions  TEXT    NOT NULL DEFAULT '{}',
            condition_script  TEXT,
            one_time          INTEGER NOT NULL DEFAULT 0,
            daily_executions  INTEGER NOT NULL DEFAULT 0,
            last_execution_at TEXT,
            created_at        TEXT    NOT NULL,
            UNIQUE(conversation_id, name)
        );
        CREATE INDEX IF NOT EXISTS idx_listeners_source ON event_listeners(source_id);

        CREATE TABLE IF NOT EXISTS attachment_metadata (
            attachment_id   TEXT    NOT NULL PRIMARY KEY,
            source_type     TEXT    NOT NULL,   -- user | tool | script
            source_id       TEXT    NOT NULL,
            mime_type       TEXT    NOT NULL,
            description     TEXT    NOT NULL,
            size            INTEGER NOT NULL,
            content_url     TEXT,
            storage_path    TEXT,
            conversation_id TEXT,               -- NULL = unlinked staging
            message_id      INTEGER,
            created_at      TEXT    NOT NULL,
            accessed_at     TEXT,
            metadata        TEXT    NOT NULL DEFAULT '{}'
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_attachments_conversation
            ON attachment_metadata(conversation_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS documents (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            title        TEXT    NOT NULL,
            source_type  TEXT    NOT NULL,
            source_id    TEXT    NOT NULL,
            source_uri   TEXT,
            file_path    TEXT,
            doc_metadata TEXT    NOT NULL DEFAULT '{}',
            created_at   TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS document_embeddings (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id     INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
            chunk_index     INTEGER NOT NULL DEFAULT 0,
            embedding_type  TEXT    NOT NULL,
            embedding_model TEXT    NOT NULL,
            embedding       TEXT    NOT NULL,   -- JSON float vector
            content         TEXT    NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_embeddings_document
            ON document_embeddings(document_id);

        CREATE VIRTUAL TABLE IF NOT EXISTS document_embeddings_fts
            USING fts5(content, content='document_embeddings', content_rowid='id');

        CREATE TABLE IF NOT EXISTS notes (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            title             TEXT    NOT NULL UNIQUE,
            content           TEXT    NOT NULL,
            visibility_labels TEXT    NOT NULL DEFAULT '[]',
            created_at        TEXT    NOT NULL,
            updated_at        TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS error_logs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp   TEXT NOT NULL,
            level       TEXT NOT NULL,
            logger_name TEXT NOT NULL,
            message     TEXT NOT NULL,
            traceback   TEXT
        );

        CREATE TABLE IF NOT EXISTS a2a_tasks (
            task_id         TEXT NOT NULL PRIMARY KEY,
            profile_id      TEXT,
            conversation_id TEXT NOT NULL,
            context_id      TEXT NOT NULL,
            status          TEXT NOT NULL,
            artifacts_json  TEXT NOT NULL DEFAULT '[]',
            history_json    TEXT NOT NULL DEFAULT '[]',
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS worker_tasks (
            task_id      TEXT NOT NULL PRIMARY KEY,
            status       TEXT NOT NULL,
            exit_code    INTEGER,
            summary      TEXT,
            output_files TEXT NOT NULL DEFAULT '[]',
            created_at   TEXT NOT NULL,
            updated_at   TEXT NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// Parse an RFC 3339 column value.
pub(crate) fn parse_ts(
    table: &str,
    value: &str,
) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| crate::error::StorageError::CorruptRow {
            table: table.to_string(),
            detail: format!("bad timestamp '{value}': {e}"),
        })
}
