//! Store (spec §4.B): transactional persistence over four tables plus
//! `metadata`, opened against a single `rusqlite::Connection` per process
//! (spec §9 "Singletons" — explicit construction, no global store).

mod contacts;
mod metadata;
mod queue;
mod sessions;

pub use contacts::{ContactFilter, SearchFilter};
pub use queue::{QueueFilter, QueueStats};

use rusqlite::{Connection, Transaction};

use crate::error::{CoreError, CoreResult};

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Opens (or creates) the store at `path` and runs idempotent schema
    /// initialization. Mirrors the teacher's `SyncEngine::new` + explicit
    /// `init_schema` split, except schema init happens unconditionally at
    /// construction since every caller needs it.
    pub fn open(path: &str) -> CoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Store { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store for tests (mirrors `setu::db::open_in_memory`).
    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Store { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> CoreResult<()> {
        self.conn.execute_batch(
            r#"
PRAGMA journal_mode=WAL;

CREATE TABLE IF NOT EXISTS contacts (
    contact_id TEXT PRIMARY KEY,
    contact_data TEXT NOT NULL,
    contact_metadata TEXT NOT NULL,
    data_hash TEXT NOT NULL,
    synced_to_api INTEGER NOT NULL DEFAULT 0,
    last_modified TEXT NOT NULL,
    source TEXT NOT NULL CHECK(source IN ('api','csv_import','manual')),
    import_session_id TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_contacts_data_hash ON contacts(data_hash);
CREATE INDEX IF NOT EXISTS idx_contacts_session ON contacts(import_session_id);
CREATE INDEX IF NOT EXISTS idx_contacts_unsynced ON contacts(synced_to_api) WHERE synced_to_api = 0;

CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    contact_id TEXT NOT NULL,
    operation TEXT NOT NULL CHECK(operation IN ('create','update','delete')),
    data_before TEXT,
    data_after TEXT,
    data_hash_after TEXT,
    reviewed INTEGER NOT NULL DEFAULT 0,
    approved INTEGER,
    sync_status TEXT NOT NULL DEFAULT 'pending'
        CHECK(sync_status IN ('pending','approved','syncing','synced','failed')),
    error_message TEXT,
    created_at TEXT NOT NULL,
    reviewed_at TEXT,
    synced_at TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    import_session_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_queue_status ON sync_queue(sync_status, created_at);
CREATE INDEX IF NOT EXISTS idx_queue_session ON sync_queue(import_session_id);

CREATE TABLE IF NOT EXISTS import_history (
    session_id TEXT PRIMARY KEY,
    csv_filename TEXT NOT NULL,
    csv_hash TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    total_rows INTEGER NOT NULL DEFAULT 0,
    parsed_contacts INTEGER NOT NULL DEFAULT 0,
    matched_contacts INTEGER NOT NULL DEFAULT 0,
    new_contacts INTEGER NOT NULL DEFAULT 0,
    queued_operations INTEGER NOT NULL DEFAULT 0,
    synced_operations INTEGER NOT NULL DEFAULT 0,
    failed_operations INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'in_progress'
        CHECK(status IN ('in_progress','completed','failed','cancelled')),
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS csv_row_hashes (
    row_hash TEXT PRIMARY KEY,
    import_session_id TEXT NOT NULL,
    contact_id TEXT,
    decision TEXT CHECK(decision IN ('merge','skip','new')),
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS activity_api_calls (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    endpoint TEXT NOT NULL,
    success INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS activity_contact_views (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    contact_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS activity_tool_executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    session_id TEXT,
    generated_count INTEGER NOT NULL DEFAULT 0,
    modified_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
"#,
        )?;
        self.conn.execute(
            "INSERT INTO metadata(key, value) VALUES ('schema_version', '1')
             ON CONFLICT(key) DO NOTHING",
            [],
        )?;
        Ok(())
    }

    pub fn schema_version(&self) -> CoreResult<String> {
        self.conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'schema_version'",
                [],
                |r| r.get(0),
            )
            .map_err(CoreError::from)
    }

    /// Runs `f` inside a transaction, committing iff `f` returns `Ok`.
    /// Mirrors the teacher's `SyncEngine::with_tx`.
    pub fn with_tx<R>(
        &mut self,
        f: impl FnOnce(&Transaction<'_>) -> CoreResult<R>,
    ) -> CoreResult<R> {
        let tx = self.conn.unchecked_transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}
