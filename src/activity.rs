//! Append-only activity ledger (spec §4.F) over the three
//! `activity_*` tables created in `store::init_schema`. Writes never
//! block the critical path per spec — callers are expected to log and
//! continue on a write failure rather than propagate it into a sync or
//! import flow; this module still returns `CoreResult` so a caller that
//! *wants* to treat logging failures as fatal can.

use chrono::Utc;
use rusqlite::params;

use crate::error::CoreResult;
use crate::store::Store;

/// Lifetime or per-session aggregate counts, grounded in the
/// totals-derived-from-counters shape used for import-stats rollups
/// elsewhere in this crate's lineage (spec §4.F names "aggregate by
/// session and lifetime" but leaves the shape open).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityStats {
    pub api_calls: i64,
    pub api_call_failures: i64,
    pub contact_views: i64,
    pub tool_executions: i64,
    pub generated_count: i64,
    pub modified_count: i64,
}

pub struct ActivityLedger<'s> {
    store: &'s mut Store,
}

impl<'s> ActivityLedger<'s> {
    pub fn new(store: &'s mut Store) -> Self {
        ActivityLedger { store }
    }

    pub fn record_api_call(&mut self, endpoint: &str, success: bool) -> CoreResult<()> {
        let now = Utc::now();
        self.store.conn().execute(
            "INSERT INTO activity_api_calls (endpoint, success, created_at) VALUES (?1, ?2, ?3)",
            params![endpoint, success as i64, now],
        )?;
        Ok(())
    }

    pub fn record_contact_view(&mut self, contact_id: &str) -> CoreResult<()> {
        let now = Utc::now();
        self.store.conn().execute(
            "INSERT INTO activity_contact_views (contact_id, created_at) VALUES (?1, ?2)",
            params![contact_id, now],
        )?;
        Ok(())
    }

    pub fn record_tool_execution(
        &mut self,
        name: &str,
        session_id: Option<&str>,
        generated_count: i64,
        modified_count: i64,
    ) -> CoreResult<()> {
        let now = Utc::now();
        self.store.conn().execute(
            "INSERT INTO activity_tool_executions (name, session_id, generated_count, modified_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, session_id, generated_count, modified_count, now],
        )?;
        Ok(())
    }

    /// Lifetime aggregate across every session.
    pub fn lifetime_stats(&self) -> CoreResult<ActivityStats> {
        self.aggregate(None)
    }

    /// Aggregate scoped to a single import session's tool executions
    /// (API calls and contact views aren't session-scoped, so they carry
    /// through unfiltered into every per-session read as the lifetime
    /// total — callers that need a true per-session breakdown for those
    /// should filter on `created_at` themselves).
    pub fn session_stats(&self, session_id: &str) -> CoreResult<ActivityStats> {
        self.aggregate(Some(session_id))
    }

    fn aggregate(&self, session_id: Option<&str>) -> CoreResult<ActivityStats> {
        let (api_calls, api_call_failures): (i64, i64) = self.store.conn().query_row(
            "SELECT COUNT(*), COUNT(*) - SUM(success) FROM activity_api_calls",
            [],
            |r| Ok((r.get(0)?, r.get::<_, Option<i64>>(1)?.unwrap_or(0))),
        )?;
        let contact_views: i64 = self
            .store
            .conn()
            .query_row("SELECT COUNT(*) FROM activity_contact_views", [], |r| r.get(0))?;

        let (tool_executions, generated_count, modified_count) = match session_id {
            Some(session_id) => self.store.conn().query_row(
                "SELECT COUNT(*), COALESCE(SUM(generated_count),0), COALESCE(SUM(modified_count),0)
                 FROM activity_tool_executions WHERE session_id = ?1",
                params![session_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )?,
            None => self.store.conn().query_row(
                "SELECT COUNT(*), COALESCE(SUM(generated_count),0), COALESCE(SUM(modified_count),0)
                 FROM activity_tool_executions",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )?,
        };

        Ok(ActivityStats {
            api_calls,
            api_call_failures,
            contact_views,
            tool_executions,
            generated_count,
            modified_count,
        })
    }
}
