use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::Store;
use crate::error::{CoreError, CoreResult};
use crate::model::{CsvRowHash, Decision, ImportSession, ImportStatus};

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<ImportSession> {
    let status_str: String = row.get("status")?;
    Ok(ImportSession {
        session_id: row.get("session_id")?,
        csv_filename: row.get("csv_filename")?,
        csv_hash: row.get("csv_hash")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        total_rows: row.get("total_rows")?,
        parsed_contacts: row.get("parsed_contacts")?,
        matched_contacts: row.get("matched_contacts")?,
        new_contacts: row.get("new_contacts")?,
        queued_operations: row.get("queued_operations")?,
        synced_operations: row.get("synced_operations")?,
        failed_operations: row.get("failed_operations")?,
        status: ImportStatus::parse(&status_str).unwrap_or(ImportStatus::InProgress),
        error_message: row.get("error_message")?,
    })
}

fn row_to_row_hash(row: &rusqlite::Row<'_>) -> rusqlite::Result<CsvRowHash> {
    let decision: Option<String> = row.get("decision")?;
    Ok(CsvRowHash {
        row_hash: row.get("row_hash")?,
        import_session_id: row.get("import_session_id")?,
        contact_id: row.get("contact_id")?,
        decision: decision.and_then(|d| Decision::parse(&d)),
        created_at: row.get("created_at")?,
    })
}

impl Store {
    /// Opens a session with `status=in_progress` (spec §4.E Phase 1.2).
    pub fn open_session(&mut self, session_id: &str, csv_filename: &str, csv_hash: &str) -> CoreResult<()> {
        let now = Utc::now();
        self.conn().execute(
            "INSERT INTO import_history
                (session_id, csv_filename, csv_hash, started_at, status)
             VALUES (?1, ?2, ?3, ?4, 'in_progress')",
            params![session_id, csv_filename, csv_hash, now],
        )?;
        Ok(())
    }

    /// A prior session with the same `csv_hash`, if any (used to emit the
    /// advisory warning in Phase 1.1 — it does not block the import).
    pub fn find_session_by_csv_hash(&self, csv_hash: &str) -> CoreResult<Option<ImportSession>> {
        self.conn()
            .query_row(
                "SELECT * FROM import_history WHERE csv_hash = ?1 LIMIT 1",
                params![csv_hash],
                row_to_session,
            )
            .optional()
            .map_err(CoreError::from)
    }

    pub fn get_session(&self, session_id: &str) -> CoreResult<Option<ImportSession>> {
        self.conn()
            .query_row(
                "SELECT * FROM import_history WHERE session_id = ?1",
                params![session_id],
                row_to_session,
            )
            .optional()
            .map_err(CoreError::from)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_session_stats(
        &mut self,
        session_id: &str,
        total_rows: i64,
        parsed_contacts: i64,
        matched_contacts: i64,
        new_contacts: i64,
        queued_operations: i64,
        synced_operations: i64,
        failed_operations: i64,
    ) -> CoreResult<()> {
        let n = self.conn().execute(
            "UPDATE import_history SET
                total_rows = ?2, parsed_contacts = ?3, matched_contacts = ?4,
                new_contacts = ?5, queued_operations = ?6, synced_operations = ?7,
                failed_operations = ?8
             WHERE session_id = ?1",
            params![
                session_id,
                total_rows,
                parsed_contacts,
                matched_contacts,
                new_contacts,
                queued_operations,
                synced_operations,
                failed_operations,
            ],
        )?;
        if n == 0 {
            return Err(CoreError::NotFound(format!("import session {session_id}")));
        }
        Ok(())
    }

    /// Phase 2 only ever needs to update `queued_operations` — the
    /// `total_rows`/`parsed_contacts`/`matched_contacts`/`new_contacts`
    /// counters are written once by `analyze()` (Phase 1) and must survive
    /// into the completed session untouched.
    pub fn set_queued_operations(&mut self, session_id: &str, queued_operations: i64) -> CoreResult<()> {
        let n = self.conn().execute(
            "UPDATE import_history SET queued_operations = ?2 WHERE session_id = ?1",
            params![session_id, queued_operations],
        )?;
        if n == 0 {
            return Err(CoreError::NotFound(format!("import session {session_id}")));
        }
        Ok(())
    }

    pub fn complete_session(&mut self, session_id: &str) -> CoreResult<()> {
        self.finish_session(session_id, ImportStatus::Completed, None)
    }

    pub fn fail_session(&mut self, session_id: &str, error_message: &str) -> CoreResult<()> {
        self.finish_session(session_id, ImportStatus::Failed, Some(error_message))
    }

    pub fn cancel_session(&mut self, session_id: &str) -> CoreResult<()> {
        self.finish_session(session_id, ImportStatus::Cancelled, None)
    }

    fn finish_session(
        &mut self,
        session_id: &str,
        status: ImportStatus,
        error_message: Option<&str>,
    ) -> CoreResult<()> {
        let now = Utc::now();
        let n = self.conn().execute(
            "UPDATE import_history SET status = ?2, completed_at = ?3, error_message = ?4
             WHERE session_id = ?1",
            params![session_id, status.as_str(), now, error_message],
        )?;
        if n == 0 {
            return Err(CoreError::NotFound(format!("import session {session_id}")));
        }
        Ok(())
    }

    /// Returns `true` if `row_hash` has never been recorded (I8); callers
    /// use this to suppress CSV duplicates across sessions (P5).
    pub fn is_new_row_hash(&self, row_hash: &str) -> CoreResult<bool> {
        let seen: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM csv_row_hashes WHERE row_hash = ?1",
                params![row_hash],
                |r| r.get(0),
            )
            .optional()?;
        Ok(seen.is_none())
    }

    /// Records a row hash with its decision. Primary-key conflict means
    /// the row was already recorded by a different session (I8); callers
    /// should check [`is_new_row_hash`] first to drop duplicates instead
    /// of hitting this.
    pub fn record_row_hash(
        &mut self,
        row_hash: &str,
        session_id: &str,
        contact_id: Option<&str>,
        decision: Decision,
    ) -> CoreResult<()> {
        let now = Utc::now();
        self.conn().execute(
            "INSERT INTO csv_row_hashes (row_hash, import_session_id, contact_id, decision, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![row_hash, session_id, contact_id, decision.as_str(), now],
        )?;
        Ok(())
    }

    pub fn get_row_hash(&self, row_hash: &str) -> CoreResult<Option<CsvRowHash>> {
        self.conn()
            .query_row(
                "SELECT * FROM csv_row_hashes WHERE row_hash = ?1",
                params![row_hash],
                row_to_row_hash,
            )
            .optional()
            .map_err(CoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_opens_and_completes() {
        let mut store = Store::open_in_memory().unwrap();
        store.open_session("s1", "contacts.csv", "abc123").unwrap();
        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.status, ImportStatus::InProgress);

        store.complete_session("s1").unwrap();
        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.status, ImportStatus::Completed);
        assert!(session.completed_at.is_some());
    }

    #[test]
    fn row_hash_suppresses_duplicates_across_sessions() {
        let mut store = Store::open_in_memory().unwrap();
        store.open_session("s1", "a.csv", "h1").unwrap();
        store.open_session("s2", "b.csv", "h2").unwrap();

        assert!(store.is_new_row_hash("rowhash1").unwrap());
        store.record_row_hash("rowhash1", "s1", None, Decision::New).unwrap();
        assert!(!store.is_new_row_hash("rowhash1").unwrap());

        let rec = store.get_row_hash("rowhash1").unwrap().unwrap();
        assert_eq!(rec.import_session_id, "s1");
    }

    #[test]
    fn find_by_csv_hash_finds_prior_session() {
        let mut store = Store::open_in_memory().unwrap();
        store.open_session("s1", "a.csv", "samehash").unwrap();
        let found = store.find_session_by_csv_hash("samehash").unwrap();
        assert_eq!(found.unwrap().session_id, "s1");
    }
}
