use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::Store;
use crate::error::{CoreError, CoreResult};
use crate::model::{ContactData, QueueItem, QueueOperation, SyncStatus};

#[derive(Debug, Clone, Default)]
pub struct QueueFilter {
    pub status: Vec<SyncStatus>,
    pub reviewed: Option<bool>,
    pub approved: Option<bool>,
    pub operation: Option<QueueOperation>,
    pub session: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub pending: i64,
    pub approved: i64,
    pub syncing: i64,
    pub synced: i64,
    pub failed: i64,
}

fn json_col(v: &Option<ContactData>) -> CoreResult<Option<String>> {
    Ok(match v {
        Some(v) => Some(serde_json::to_string(v)?),
        None => None,
    })
}

fn row_to_queue_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueItem> {
    let op_str: String = row.get("operation")?;
    let status_str: String = row.get("sync_status")?;
    let data_before: Option<String> = row.get("data_before")?;
    let data_after: Option<String> = row.get("data_after")?;
    Ok(QueueItem {
        id: row.get("id")?,
        contact_id: row.get("contact_id")?,
        operation: QueueOperation::parse(&op_str).unwrap_or(QueueOperation::Update),
        data_before: data_before.and_then(|s| serde_json::from_str(&s).ok()),
        data_after: data_after.and_then(|s| serde_json::from_str(&s).ok()),
        data_hash_after: row.get("data_hash_after")?,
        reviewed: row.get::<_, i64>("reviewed")? != 0,
        approved: row.get::<_, Option<i64>>("approved")?.map(|v| v != 0),
        sync_status: SyncStatus::parse(&status_str).unwrap_or(SyncStatus::Pending),
        error_message: row.get("error_message")?,
        created_at: row.get("created_at")?,
        reviewed_at: row.get("reviewed_at")?,
        synced_at: row.get("synced_at")?,
        retry_count: row.get("retry_count")?,
        import_session_id: row.get("import_session_id")?,
    })
}

impl Store {
    /// Inserts a new queue item in `pending` (lifecycle start, spec §3).
    pub fn add_queue_item(
        &mut self,
        contact_id: &str,
        operation: QueueOperation,
        data_before: Option<&ContactData>,
        data_after: Option<&ContactData>,
        data_hash_after: Option<&str>,
        session: Option<&str>,
    ) -> CoreResult<i64> {
        validate_operation_shape(operation, data_before, data_after)?;
        let now = Utc::now();
        self.conn().execute(
            "INSERT INTO sync_queue
                (contact_id, operation, data_before, data_after, data_hash_after,
                 reviewed, approved, sync_status, created_at, retry_count, import_session_id)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, 'pending', ?6, 0, ?7)",
            params![
                contact_id,
                operation.as_str(),
                json_col(&data_before.cloned())?,
                json_col(&data_after.cloned())?,
                data_hash_after,
                now,
                session,
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn add_many(
        &mut self,
        items: &[(String, QueueOperation, Option<ContactData>, Option<ContactData>, Option<String>, Option<String>)],
    ) -> CoreResult<Vec<i64>> {
        self.with_tx(|tx| {
            let mut ids = Vec::with_capacity(items.len());
            let now = Utc::now();
            for (contact_id, operation, data_before, data_after, data_hash_after, session) in items {
                validate_operation_shape(*operation, data_before.as_ref(), data_after.as_ref())?;
                tx.execute(
                    "INSERT INTO sync_queue
                        (contact_id, operation, data_before, data_after, data_hash_after,
                         reviewed, approved, sync_status, created_at, retry_count, import_session_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, 'pending', ?6, 0, ?7)",
                    params![
                        contact_id,
                        operation.as_str(),
                        json_col(data_before)?,
                        json_col(data_after)?,
                        data_hash_after,
                        now,
                        session,
                    ],
                )?;
                ids.push(tx.last_insert_rowid());
            }
            Ok(ids)
        })
    }

    pub fn get_queue_item(&self, id: i64) -> CoreResult<Option<QueueItem>> {
        self.conn()
            .query_row(
                "SELECT * FROM sync_queue WHERE id = ?1",
                params![id],
                row_to_queue_item,
            )
            .optional()
            .map_err(CoreError::from)
    }

    pub fn pending(&self) -> CoreResult<Vec<QueueItem>> {
        self.by_filter(&QueueFilter {
            status: vec![SyncStatus::Pending],
            ..Default::default()
        }, None, None)
    }

    pub fn approved(&self) -> CoreResult<Vec<QueueItem>> {
        self.by_filter(&QueueFilter {
            status: vec![SyncStatus::Approved],
            ..Default::default()
        }, None, None)
    }

    pub fn failed(&self) -> CoreResult<Vec<QueueItem>> {
        self.by_filter(&QueueFilter {
            status: vec![SyncStatus::Failed],
            ..Default::default()
        }, None, None)
    }

    /// `approved()` iteration order is `created_at ascending` (convention,
    /// not a guarantee, per spec §5).
    pub fn by_filter(
        &self,
        filter: &QueueFilter,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> CoreResult<Vec<QueueItem>> {
        let mut sql = String::from("SELECT * FROM sync_queue WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if !filter.status.is_empty() {
            let placeholders = vec!["?"; filter.status.len()].join(",");
            sql.push_str(&format!(" AND sync_status IN ({placeholders})"));
            for s in &filter.status {
                args.push(Box::new(s.as_str().to_string()));
            }
        }
        if let Some(reviewed) = filter.reviewed {
            sql.push_str(" AND reviewed = ?");
            args.push(Box::new(reviewed as i64));
        }
        if let Some(approved) = filter.approved {
            sql.push_str(" AND approved = ?");
            args.push(Box::new(approved as i64));
        }
        if let Some(op) = filter.operation {
            sql.push_str(" AND operation = ?");
            args.push(Box::new(op.as_str().to_string()));
        }
        if let Some(session) = &filter.session {
            sql.push_str(" AND import_session_id = ?");
            args.push(Box::new(session.clone()));
        }
        sql.push_str(" ORDER BY created_at ASC");
        if let Some(limit) = limit {
            sql.push_str(" LIMIT ?");
            args.push(Box::new(limit));
            if let Some(offset) = offset {
                sql.push_str(" OFFSET ?");
                args.push(Box::new(offset));
            }
        }

        let mut stmt = self.conn().prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params_ref.as_slice(), row_to_queue_item)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn queue_stats(&self) -> CoreResult<QueueStats> {
        let mut stats = QueueStats::default();
        let mut stmt = self
            .conn()
            .prepare("SELECT sync_status, COUNT(*) FROM sync_queue GROUP BY sync_status")?;
        let rows = stmt.query_map([], |r| {
            let status: String = r.get(0)?;
            let count: i64 = r.get(1)?;
            Ok((status, count))
        })?;
        for row in rows {
            let (status, count) = row?;
            match SyncStatus::parse(&status) {
                Some(SyncStatus::Pending) => stats.pending = count,
                Some(SyncStatus::Approved) => stats.approved = count,
                Some(SyncStatus::Syncing) => stats.syncing = count,
                Some(SyncStatus::Synced) => stats.synced = count,
                Some(SyncStatus::Failed) => stats.failed = count,
                None => {}
            }
        }
        Ok(stats)
    }

    /// `pending -> approved` on review (I5). Reviewed is set regardless of
    /// the outcome; `approve` vs `reject` only differs in `approved`.
    pub fn approve_item(&mut self, id: i64) -> CoreResult<bool> {
        let now = Utc::now();
        let n = self.conn().execute(
            "UPDATE sync_queue SET reviewed = 1, approved = 1, sync_status = 'approved', reviewed_at = ?2
             WHERE id = ?1 AND sync_status = 'pending'",
            params![id, now],
        )?;
        Ok(n > 0)
    }

    pub fn reject_item(&mut self, id: i64) -> CoreResult<bool> {
        let now = Utc::now();
        let n = self.conn().execute(
            "UPDATE sync_queue SET reviewed = 1, approved = 0, reviewed_at = ?2
             WHERE id = ?1 AND sync_status = 'pending'",
            params![id, now],
        )?;
        Ok(n > 0)
    }

    pub fn approve_many(&mut self, ids: &[i64]) -> CoreResult<usize> {
        self.with_tx(|tx| {
            let now = Utc::now();
            let mut n = 0;
            for id in ids {
                n += tx.execute(
                    "UPDATE sync_queue SET reviewed = 1, approved = 1, sync_status = 'approved', reviewed_at = ?2
                     WHERE id = ?1 AND sync_status = 'pending'",
                    params![id, now],
                )?;
            }
            Ok(n)
        })
    }

    pub fn reject_many(&mut self, ids: &[i64]) -> CoreResult<usize> {
        self.with_tx(|tx| {
            let now = Utc::now();
            let mut n = 0;
            for id in ids {
                n += tx.execute(
                    "UPDATE sync_queue SET reviewed = 1, approved = 0, reviewed_at = ?2
                     WHERE id = ?1 AND sync_status = 'pending'",
                    params![id, now],
                )?;
            }
            Ok(n)
        })
    }

    /// The only contested transition (spec §4.C): `UPDATE ... WHERE id = ?
    /// AND sync_status = 'approved'`, reported as a bool so racing
    /// claimants get exactly one success (P3).
    pub fn mark_syncing(&mut self, id: i64) -> CoreResult<bool> {
        let n = self.conn().execute(
            "UPDATE sync_queue SET sync_status = 'syncing' WHERE id = ?1 AND sync_status = 'approved'",
            params![id],
        )?;
        Ok(n > 0)
    }

    pub fn mark_queue_synced(&mut self, id: i64) -> CoreResult<()> {
        let now = Utc::now();
        let n = self.conn().execute(
            "UPDATE sync_queue SET sync_status = 'synced', synced_at = ?2, error_message = NULL
             WHERE id = ?1 AND sync_status = 'syncing'",
            params![id, now],
        )?;
        if n == 0 {
            return Err(CoreError::Validation(format!(
                "queue item {id} is not in syncing state"
            )));
        }
        Ok(())
    }

    /// Retries never decrease `retry_count` (I6).
    pub fn mark_queue_failed(&mut self, id: i64, error_message: &str) -> CoreResult<()> {
        let n = self.conn().execute(
            "UPDATE sync_queue SET sync_status = 'failed', error_message = ?2, retry_count = retry_count + 1
             WHERE id = ?1 AND sync_status = 'syncing'",
            params![id, error_message],
        )?;
        if n == 0 {
            return Err(CoreError::Validation(format!(
                "queue item {id} is not in syncing state"
            )));
        }
        Ok(())
    }

    /// `failed -> approved`, clearing `error_message` (spec §4.C, §4.D
    /// Resume).
    pub fn retry_item(&mut self, id: i64) -> CoreResult<bool> {
        let n = self.conn().execute(
            "UPDATE sync_queue SET sync_status = 'approved', error_message = NULL
             WHERE id = ?1 AND sync_status = 'failed'",
            params![id],
        )?;
        Ok(n > 0)
    }

    /// Atomically transitions every `failed` row to `approved` (spec
    /// §4.D Resume).
    pub fn retry_all_failed(&mut self) -> CoreResult<usize> {
        Ok(self.conn().execute(
            "UPDATE sync_queue SET sync_status = 'approved', error_message = NULL
             WHERE sync_status = 'failed'",
            [],
        )?)
    }
}

fn validate_operation_shape(
    operation: QueueOperation,
    data_before: Option<&ContactData>,
    data_after: Option<&ContactData>,
) -> CoreResult<()> {
    match operation {
        QueueOperation::Create if data_before.is_some() => Err(CoreError::Validation(
            "create operations must not carry data_before".into(),
        )),
        QueueOperation::Delete if data_after.is_some() => Err(CoreError::Validation(
            "delete operations must not carry data_after".into(),
        )),
        _ => Ok(()),
    }
}
