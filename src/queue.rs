//! Queue state machine facade (spec §4.C): a typed vocabulary over
//! [`crate::store::Store`]'s queue tables, used by [`crate::engine`].

pub use crate::store::QueueFilter;

use crate::error::{CoreError, CoreResult};
use crate::model::{ContactData, QueueItem, QueueOperation, SyncStatus};
use crate::store::Store;

pub struct Queue<'s> {
    store: &'s mut Store,
}

impl<'s> Queue<'s> {
    pub fn new(store: &'s mut Store) -> Self {
        Queue { store }
    }

    pub fn enqueue_create(&mut self, contact_id: &str, data_after: &ContactData, session: Option<&str>) -> CoreResult<i64> {
        let hash = crate::hash::hash_contact(data_after);
        self.store
            .add_queue_item(contact_id, QueueOperation::Create, None, Some(data_after), Some(&hash), session)
    }

    pub fn enqueue_update(
        &mut self,
        contact_id: &str,
        data_before: &ContactData,
        data_after: &ContactData,
        session: Option<&str>,
    ) -> CoreResult<i64> {
        let hash = crate::hash::hash_contact(data_after);
        self.store.add_queue_item(
            contact_id,
            QueueOperation::Update,
            Some(data_before),
            Some(data_after),
            Some(&hash),
            session,
        )
    }

    pub fn enqueue_delete(&mut self, contact_id: &str, data_before: &ContactData, session: Option<&str>) -> CoreResult<i64> {
        self.store
            .add_queue_item(contact_id, QueueOperation::Delete, Some(data_before), None, None, session)
    }

    pub fn pending(&self) -> CoreResult<Vec<QueueItem>> {
        self.store.pending()
    }

    pub fn approved(&self) -> CoreResult<Vec<QueueItem>> {
        self.store.approved()
    }

    pub fn failed(&self) -> CoreResult<Vec<QueueItem>> {
        self.store.failed()
    }

    pub fn by_filter(&self, filter: &QueueFilter) -> CoreResult<Vec<QueueItem>> {
        validate_filter(filter)?;
        self.store.by_filter(filter, None, None)
    }

    pub fn stats(&self) -> CoreResult<crate::store::QueueStats> {
        self.store.queue_stats()
    }

    pub fn approve(&mut self, id: i64) -> CoreResult<bool> {
        self.store.approve_item(id)
    }

    pub fn reject(&mut self, id: i64) -> CoreResult<bool> {
        self.store.reject_item(id)
    }

    pub fn approve_many(&mut self, ids: &[i64]) -> CoreResult<usize> {
        self.store.approve_many(ids)
    }

    pub fn reject_many(&mut self, ids: &[i64]) -> CoreResult<usize> {
        self.store.reject_many(ids)
    }

    /// CAS claim: `approved -> syncing`. Exactly one concurrent claimant
    /// succeeds (P3).
    pub fn claim(&mut self, id: i64) -> CoreResult<bool> {
        self.store.mark_syncing(id)
    }

    pub fn mark_synced(&mut self, id: i64) -> CoreResult<()> {
        self.store.mark_queue_synced(id)
    }

    pub fn mark_failed(&mut self, id: i64, error_message: &str) -> CoreResult<()> {
        self.store.mark_queue_failed(id, error_message)
    }

    pub fn retry(&mut self, id: i64) -> CoreResult<bool> {
        self.store.retry_item(id)
    }

    pub fn resume_all_failed(&mut self) -> CoreResult<usize> {
        self.store.retry_all_failed()
    }
}

/// Enum-valued filter inputs must be validated against the closed set
/// before SQL composition (spec §4.C) — [`SyncStatus`]/[`QueueOperation`]
/// are already closed Rust enums so there is nothing left to validate by
/// the time a [`QueueFilter`] is constructed; this exists as the single
/// point where a future string-based filter API would plug in.
fn validate_filter(_filter: &QueueFilter) -> CoreResult<()> {
    Ok(())
}

pub fn require_status(status: &str) -> CoreResult<SyncStatus> {
    SyncStatus::parse(status).ok_or_else(|| CoreError::Validation(format!("unknown sync_status: {status}")))
}
