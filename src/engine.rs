//! Sync Engine (spec §4.D): drains `approved` queue items against the
//! `RemoteApi`, persisting outcomes and surfacing progress.
//!
//! The per-item 30s timeout (spec §9 "Coroutine control flow") is bounded
//! at the remote client, not by racing a worker thread against a deadline
//! here — see [`run_with_cancel`] for why. Backoff sleeps still block this
//! thread directly via `std::thread::sleep`, the synchronous analogue of
//! `setu::sync::run_one_sync`'s delay; no async runtime is introduced
//! since the teacher crate has none.

use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::error::{CoreError, CoreResult};
use crate::hash::hash_contact;
use crate::model::{ContactData, ContactMetadata, ContactSource, QueueItem, QueueOperation};
use crate::remote::{RemoteApi, RemoteContact};
use crate::store::Store;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RETRIES: u32 = 3;
const ITEM_TIMEOUT: Duration = Duration::from_secs(30);

/// `delay_k = min(max_delay, base_delay * 2^k)` (spec §4.D).
pub fn backoff_delay(k: u32) -> Duration {
    let scaled = BASE_DELAY.saturating_mul(1u32.checked_shl(k).unwrap_or(u32::MAX));
    std::cmp::min(scaled, MAX_DELAY)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Claim,
    Fetch,
    Compare,
    Submit,
    Finalize,
}

#[derive(Debug, Clone)]
pub struct ItemResult {
    pub queue_item_id: i64,
    pub contact_id: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
    pub current_item: Option<i64>,
    pub step_text: String,
    pub last_result: Option<ItemResult>,
}

/// Sole mechanism for UI integration (spec §4.D) — no UI logic lives in
/// the engine.
pub trait ProgressObserver {
    fn on_progress(&mut self, progress: &Progress);
}

/// No-op observer for callers that don't need progress reporting.
pub struct NullObserver;
impl ProgressObserver for NullObserver {
    fn on_progress(&mut self, _progress: &Progress) {}
}

#[derive(Debug, Clone)]
pub struct DrainSummary {
    pub total: usize,
    pub success: usize,
    pub failure: usize,
    pub skipped: usize,
    pub results: Vec<ItemResult>,
    pub start: chrono::DateTime<Utc>,
    pub end: chrono::DateTime<Utc>,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    HashMismatch,
    NotFound,
    ApiError,
}

#[derive(Debug, Clone)]
pub struct ConflictReport {
    pub queue_item_id: i64,
    pub contact_id: String,
    pub kind: ConflictKind,
}

/// `READONLY_MODE` / OAuth-timeout-style knobs read once at construction
/// (spec §9 "Global state for env flags").
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_retries: u32,
    pub readonly: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_retries: DEFAULT_MAX_RETRIES,
            readonly: false,
        }
    }
}

pub struct SyncEngine<'a> {
    store: &'a mut Store,
    remote: &'a dyn RemoteApi,
    config: EngineConfig,
}

impl<'a> SyncEngine<'a> {
    pub fn new(store: &'a mut Store, remote: &'a dyn RemoteApi, config: EngineConfig) -> Self {
        SyncEngine { store, remote, config }
    }

    /// Drains every `approved` item sequentially from a single task (spec
    /// §4.D Concurrency — the CAS claim in §4.C prevents double-dispatch
    /// across would-be concurrent drainers).
    pub fn drain_approved(&mut self, observer: &mut dyn ProgressObserver) -> CoreResult<DrainSummary> {
        let start = Utc::now();
        let items = self.store.approved()?;
        let total = items.len();
        let mut results = Vec::with_capacity(total);
        let mut success = 0usize;
        let mut failure = 0usize;
        let skipped = 0usize;

        for (i, item) in items.into_iter().enumerate() {
            observer.on_progress(&Progress {
                current: i,
                total,
                current_item: Some(item.id),
                step_text: "claim".into(),
                last_result: None,
            });

            let claimed = self.store.mark_syncing(item.id)?;
            if !claimed {
                continue;
            }

            let result = self.process_claimed_item(&item, observer, i, total);
            match &result {
                Ok(()) => success += 1,
                Err(_) => failure += 1,
            }
            let item_result = ItemResult {
                queue_item_id: item.id,
                contact_id: item.contact_id.clone(),
                success: result.is_ok(),
                error: result.as_ref().err().map(|e| e.to_string()),
            };
            observer.on_progress(&Progress {
                current: i + 1,
                total,
                current_item: Some(item.id),
                step_text: "finalize".into(),
                last_result: Some(item_result.clone()),
            });
            results.push(item_result);
        }

        let end = Utc::now();
        Ok(DrainSummary {
            total,
            success,
            failure,
            skipped,
            results,
            start,
            end,
            duration: (end - start).to_std().unwrap_or_default(),
        })
    }

    /// Drives retries for a single already-claimed item through to
    /// `synced` or `failed`, honoring the 30s per-item timeout and
    /// exponential backoff.
    fn process_claimed_item(
        &mut self,
        item: &QueueItem,
        observer: &mut dyn ProgressObserver,
        index: usize,
        total: usize,
    ) -> CoreResult<()> {
        let deadline = Instant::now() + ITEM_TIMEOUT;
        let mut attempt = 0u32;
        loop {
            if Instant::now() >= deadline {
                let _ = self.store.mark_queue_failed(item.id, "timed out after 30s");
                return Err(CoreError::Timeout(ITEM_TIMEOUT));
            }
            match self.dispatch_with_timeout(item, deadline, observer, index, total) {
                Ok(()) => {
                    self.store.mark_queue_synced(item.id)?;
                    return Ok(());
                }
                Err(DispatchOutcome::Fatal(e)) => {
                    self.store.mark_queue_failed(item.id, &e.to_string())?;
                    return Err(e);
                }
                Err(DispatchOutcome::Transient(e)) => {
                    // syncing -> failed (retry_count += 1, I6); every
                    // attempt counts as a failed transition (P4), whether
                    // or not it gets retried.
                    self.store.mark_queue_failed(item.id, &e.to_string())?;
                    if attempt >= self.config.max_retries {
                        return Err(e);
                    }
                    let delay = backoff_delay(attempt);
                    if Instant::now() + delay >= deadline {
                        return Err(CoreError::Timeout(ITEM_TIMEOUT));
                    }
                    thread::sleep(delay);
                    attempt += 1;
                    // failed -> approved -> syncing: re-claim for the next attempt.
                    self.store.retry_item(item.id)?;
                    self.store.mark_syncing(item.id)?;
                }
            }
        }
    }

    fn dispatch_with_timeout(
        &mut self,
        item: &QueueItem,
        deadline: Instant,
        observer: &mut dyn ProgressObserver,
        index: usize,
        total: usize,
    ) -> Result<(), DispatchOutcome> {
        if self.config.readonly {
            return self.apply_readonly(item);
        }
        match item.operation {
            QueueOperation::Create => self.apply_create(item, observer, index, total),
            QueueOperation::Update => self.apply_update(item, deadline, observer, index, total),
            QueueOperation::Delete => Err(DispatchOutcome::Fatal(CoreError::Unsupported(
                "delete is not supported by the remote API".into(),
            ))),
        }
    }

    /// Spec §8 scenario 6: engine short-circuits each op as synthetic
    /// success; local rows are annotated `synced_to_api=true`.
    fn apply_readonly(&mut self, item: &QueueItem) -> Result<(), DispatchOutcome> {
        if item.operation == QueueOperation::Delete {
            return Err(DispatchOutcome::Fatal(CoreError::Unsupported(
                "delete is not supported by the remote API".into(),
            )));
        }
        let data = item.data_after.clone().unwrap_or_default();
        let contact = crate::model::Contact {
            contact_id: item.contact_id.clone(),
            contact_data: data,
            contact_metadata: ContactMetadata::default(),
        };
        self.store
            .save_contact(&contact, ContactSource::Api, item.import_session_id.as_deref(), true)
            .map_err(DispatchOutcome::Fatal)?;
        Ok(())
    }

    fn apply_create(
        &mut self,
        item: &QueueItem,
        observer: &mut dyn ProgressObserver,
        index: usize,
        total: usize,
    ) -> Result<(), DispatchOutcome> {
        let data = item
            .data_after
            .clone()
            .ok_or_else(|| DispatchOutcome::Fatal(CoreError::Validation("create op missing data_after".into())))?;

        observer.on_progress(&Progress {
            current: index,
            total,
            current_item: Some(item.id),
            step_text: "submit".into(),
            last_result: None,
        });
        let remote = run_with_cancel(|| self.remote.contacts_create(&data, &ContactMetadata::default()))
            .map_err(classify_remote_error)?;

        let contact = crate::model::Contact {
            contact_id: remote.contact_id,
            contact_data: remote.contact_data,
            contact_metadata: remote.contact_metadata,
        };
        self.store
            .save_contact(&contact, ContactSource::Api, item.import_session_id.as_deref(), true)
            .map_err(DispatchOutcome::Fatal)?;
        Ok(())
    }

    /// Spec §4.D `update`: fetch current remote, compare hashes, and on
    /// mismatch use merge-by-remote-etag (the canonical resolution of the
    /// §9 Open Question).
    fn apply_update(
        &mut self,
        item: &QueueItem,
        _deadline: Instant,
        observer: &mut dyn ProgressObserver,
        index: usize,
        total: usize,
    ) -> Result<(), DispatchOutcome> {
        let data_after = item
            .data_after
            .clone()
            .ok_or_else(|| DispatchOutcome::Fatal(CoreError::Validation("update op missing data_after".into())))?;

        observer.on_progress(&Progress {
            current: index,
            total,
            current_item: Some(item.id),
            step_text: "fetch".into(),
            last_result: None,
        });
        let remote_contacts = run_with_cancel(|| self.remote.contacts_get(&[item.contact_id.clone()]))
            .map_err(classify_remote_error)?;
        let remote = remote_contacts
            .into_iter()
            .next()
            .ok_or_else(|| DispatchOutcome::Fatal(CoreError::NotFound(format!("remote contact {}", item.contact_id))))?;

        observer.on_progress(&Progress {
            current: index,
            total,
            current_item: Some(item.id),
            step_text: "compare".into(),
            last_result: None,
        });
        let submission = build_update_submission(&remote, item.data_before.as_ref(), &data_after);

        observer.on_progress(&Progress {
            current: index,
            total,
            current_item: Some(item.id),
            step_text: "submit".into(),
            last_result: None,
        });
        let updated = run_with_cancel(|| self.remote.contacts_update(&remote.contact_id, &submission.etag, &submission.contact_data))
            .map_err(classify_remote_error)?;

        let contact = crate::model::Contact {
            contact_id: updated.contact_id,
            contact_data: updated.contact_data,
            contact_metadata: updated.contact_metadata,
        };
        self.store
            .update(&contact, Some(true))
            .map_err(DispatchOutcome::Fatal)?;
        Ok(())
    }

    /// Non-destructive scan of every approved item (spec §4.D Conflict
    /// survey). Never mutates a row.
    pub fn detect_conflicts(&self) -> CoreResult<Vec<ConflictReport>> {
        let items = self.store.approved()?;
        let mut reports = Vec::new();
        for item in items {
            let fetched = self.remote.contacts_get(&[item.contact_id.clone()]);
            match fetched {
                Ok(contacts) => match contacts.into_iter().next() {
                    None => reports.push(ConflictReport {
                        queue_item_id: item.id,
                        contact_id: item.contact_id,
                        kind: ConflictKind::NotFound,
                    }),
                    Some(remote) => {
                        let remote_hash = hash_contact(&remote.contact_data);
                        let local_hash = item.data_hash_after.clone().unwrap_or_default();
                        if remote_hash != local_hash {
                            reports.push(ConflictReport {
                                queue_item_id: item.id,
                                contact_id: item.contact_id,
                                kind: ConflictKind::HashMismatch,
                            });
                        }
                    }
                },
                Err(_) => reports.push(ConflictReport {
                    queue_item_id: item.id,
                    contact_id: item.contact_id,
                    kind: ConflictKind::ApiError,
                }),
            }
        }
        Ok(reports)
    }

    /// Transitions every `failed` row back to `approved`, clearing
    /// `error_message`, then drains normally (spec §4.D Resume).
    pub fn resume_failed(&mut self, observer: &mut dyn ProgressObserver) -> CoreResult<DrainSummary> {
        self.store.retry_all_failed()?;
        self.drain_approved(observer)
    }
}

/// Assembled from the freshly-fetched remote record (carrying its etag
/// forward) but with `contact_data` replaced by `data_after` — the
/// merge-by-remote-etag strategy.
struct UpdateSubmission {
    etag: String,
    contact_data: ContactData,
}

fn build_update_submission(remote: &RemoteContact, data_before: Option<&ContactData>, data_after: &ContactData) -> UpdateSubmission {
    if let Some(before) = data_before {
        let remote_hash = hash_contact(&remote.contact_data);
        let expected_hash = hash_contact(before);
        if remote_hash != expected_hash {
            tracing::warn!(
                contact_id = %remote.contact_id,
                "remote contact changed since queue item was created; merging by remote etag"
            );
        }
    }
    UpdateSubmission {
        etag: remote.etag.clone(),
        contact_data: data_after.clone(),
    }
}

enum DispatchOutcome {
    Transient(CoreError),
    Fatal(CoreError),
}

fn classify_remote_error(err: CoreError) -> DispatchOutcome {
    match err {
        CoreError::NotFound(_) | CoreError::Auth(_) | CoreError::Validation(_) | CoreError::Unsupported(_) => {
            DispatchOutcome::Fatal(err)
        }
        _ => DispatchOutcome::Transient(err),
    }
}

/// The suspension point of spec §9 "Coroutine control flow"/§4.D's
/// per-item 30s timeout. Rust has no sound way to preempt a running OS
/// thread from the outside, so the bound cannot be modelled as a race
/// between the blocking call and a deadline on this side — a
/// `thread::scope`'d worker still blocks this function on its join past
/// any `recv_timeout` deadline if the call itself never returns. The
/// bound is therefore pushed onto the remote client: `HttpRemoteApi`
/// configures its `reqwest` client with a matching request timeout
/// (`remote.rs`), so `op` itself is guaranteed to return within
/// `ITEM_TIMEOUT` and this function simply forwards its result.
fn run_with_cancel<T, F>(op: F) -> CoreResult<T>
where
    F: FnOnce() -> CoreResult<T>,
{
    op()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Contact, ContactData, ContactMetadata, EmailAddress, QueueOperation};
    use crate::remote::FakeRemoteApi;

    fn approved_create(store: &mut Store, contact_id: &str) -> i64 {
        let data = ContactData {
            emails: vec![EmailAddress { value: "a@x.io".into(), r#type: None }],
            ..Default::default()
        };
        let id = store
            .add_queue_item(contact_id, QueueOperation::Create, None, Some(&data), None, None)
            .unwrap();
        store.approve_item(id).unwrap();
        id
    }

    #[test]
    fn backoff_matches_spec_formula() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn create_drains_to_synced() {
        let mut store = Store::open_in_memory().unwrap();
        let id = approved_create(&mut store, "c1");
        let remote = FakeRemoteApi::new();
        let mut engine = SyncEngine::new(&mut store, &remote, EngineConfig::default());
        let summary = engine.drain_approved(&mut NullObserver).unwrap();
        assert_eq!(summary.success, 1);
        assert_eq!(summary.failure, 0);
        let item = store.get_queue_item(id).unwrap().unwrap();
        assert_eq!(item.sync_status, crate::model::SyncStatus::Synced);
    }

    #[test]
    fn delete_is_unsupported() {
        let mut store = Store::open_in_memory().unwrap();
        let data = ContactData::default();
        let id = store
            .add_queue_item("c1", QueueOperation::Delete, Some(&data), None, None, None)
            .unwrap();
        store.approve_item(id).unwrap();
        let remote = FakeRemoteApi::new();
        let mut engine = SyncEngine::new(&mut store, &remote, EngineConfig::default());
        let summary = engine.drain_approved(&mut NullObserver).unwrap();
        assert_eq!(summary.failure, 1);
        let item = store.get_queue_item(id).unwrap().unwrap();
        assert_eq!(item.sync_status, crate::model::SyncStatus::Failed);
    }

    #[test]
    fn readonly_mode_short_circuits_to_synced_to_api() {
        let mut store = Store::open_in_memory().unwrap();
        let id = approved_create(&mut store, "c1");
        let remote = FakeRemoteApi::new();
        let config = EngineConfig { readonly: true, ..Default::default() };
        let mut engine = SyncEngine::new(&mut store, &remote, config);
        let summary = engine.drain_approved(&mut NullObserver).unwrap();
        assert_eq!(summary.success, 1);
        let item = store.get_queue_item(id).unwrap().unwrap();
        assert_eq!(item.sync_status, crate::model::SyncStatus::Synced);
        let contact = store.get_contact("c1").unwrap().unwrap();
        assert!(contact.synced_to_api);
        assert_eq!(remote.contacts_scroll(None, 100).unwrap().0.len(), 0);
    }

    #[test]
    fn update_merges_by_remote_etag_on_hash_mismatch() {
        let mut store = Store::open_in_memory().unwrap();
        let remote = FakeRemoteApi::new();

        let data_before = ContactData {
            notes: Some("original".into()),
            ..Default::default()
        };
        let created = remote.contacts_create(&data_before, &ContactMetadata::default()).unwrap();
        store
            .save_contact(
                &Contact { contact_id: created.contact_id.clone(), contact_data: data_before.clone(), contact_metadata: ContactMetadata::default() },
                ContactSource::Api,
                None,
                true,
            )
            .unwrap();

        // External change alters remote contact_data before the drain.
        remote.contacts_update(&created.contact_id, &created.etag, &ContactData { notes: Some("external change".into()), ..Default::default() }).unwrap();

        let data_after = ContactData { notes: Some("call back".into()), ..Default::default() };
        let queue_id = store
            .add_queue_item(&created.contact_id, QueueOperation::Update, Some(&data_before), Some(&data_after), None, None)
            .unwrap();
        store.approve_item(queue_id).unwrap();

        let mut engine = SyncEngine::new(&mut store, &remote, EngineConfig::default());
        let summary = engine.drain_approved(&mut NullObserver).unwrap();
        assert_eq!(summary.success, 1);

        let stored = store.get_contact(&created.contact_id).unwrap().unwrap();
        assert_eq!(stored.contact_data.notes.as_deref(), Some("call back"));
    }

    #[test]
    fn retry_exhaustion_marks_failed_with_last_error() {
        let mut store = Store::open_in_memory().unwrap();
        let remote = FakeRemoteApi::new();
        let created = remote.contacts_create(&ContactData::default(), &ContactMetadata::default()).unwrap();
        store
            .save_contact(
                &Contact { contact_id: created.contact_id.clone(), contact_data: ContactData::default(), contact_metadata: ContactMetadata::default() },
                ContactSource::Api,
                None,
                true,
            )
            .unwrap();
        remote.fail_updates(4);

        let data_after = ContactData { notes: Some("x".into()), ..Default::default() };
        let queue_id = store
            .add_queue_item(&created.contact_id, QueueOperation::Update, None, Some(&data_after), None, None)
            .unwrap();
        store.approve_item(queue_id).unwrap();

        let config = EngineConfig { max_retries: 3, readonly: false };
        let mut engine = SyncEngine::new(&mut store, &remote, config);
        let summary = engine.drain_approved(&mut NullObserver).unwrap();
        assert_eq!(summary.failure, 1);

        let item = store.get_queue_item(queue_id).unwrap().unwrap();
        assert_eq!(item.sync_status, crate::model::SyncStatus::Failed);
        assert_eq!(item.retry_count, 4);
        assert!(item.error_message.unwrap().contains("upstream"));
    }

    #[test]
    fn detect_conflicts_does_not_mutate_rows() {
        let mut store = Store::open_in_memory().unwrap();
        let remote = FakeRemoteApi::new();
        let queue_id = store
            .add_queue_item("missing-remote", QueueOperation::Update, None, Some(&ContactData::default()), Some("h"), None)
            .unwrap();
        store.approve_item(queue_id).unwrap();

        let engine = SyncEngine::new(&mut store, &remote, EngineConfig::default());
        let reports = engine.detect_conflicts().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, ConflictKind::NotFound);
    }
}
