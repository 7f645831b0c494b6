//! End-to-end scenarios (spec §8) and cross-module properties (P1-P8)
//! exercised against the public API rather than module internals.

use contact_sync_core::model::{ContactData, ContactSource, Decision, EmailAddress, ImportStatus, SyncStatus};
use contact_sync_core::{
    ApplyDecisions, ConfigStore, CsvMapping, EngineConfig, ExactContactMatcher, FakeRemoteApi, Importer, MergeDecision, NullObserver,
    Queue, RemoteApi, Store, SyncEngine,
};

fn contact_data_with_email(email: &str) -> ContactData {
    ContactData {
        emails: vec![EmailAddress {
            value: email.to_string(),
            r#type: None,
        }],
        ..Default::default()
    }
}

/// Scenario 1 (spec §8): create -> approve -> sync -> synced.
#[test]
fn create_approve_sync_reaches_synced() {
    let mut store = Store::open_in_memory().unwrap();
    let remote = FakeRemoteApi::new();

    let queue_item_id = {
        let mut queue = Queue::new(&mut store);
        let id = queue.enqueue_create("local-1", &contact_data_with_email("new@x.io"), None).unwrap();
        assert!(queue.approve(id).unwrap());
        id
    };

    let summary = {
        let mut engine = SyncEngine::new(&mut store, &remote, EngineConfig::default());
        engine.drain_approved(&mut NullObserver).unwrap()
    };

    assert_eq!(summary.total, 1);
    assert_eq!(summary.success, 1);
    assert_eq!(summary.failure, 0);

    let item = store.by_filter(&Default::default(), None, None).unwrap();
    let item = item.iter().find(|i| i.id == queue_item_id).unwrap();
    assert_eq!(item.sync_status, SyncStatus::Synced);
}

/// Scenario 2 (spec §8): update conflict resolves by merge-by-remote-etag.
#[test]
fn update_conflict_merges_against_remote() {
    let mut store = Store::open_in_memory().unwrap();
    let remote = FakeRemoteApi::new();

    let remote_seed = remote
        .contacts_create(&contact_data_with_email("orig@x.io"), &Default::default())
        .unwrap();
    let contact_id = remote_seed.contact_id.clone();

    // The remote moves on to a newer etag/value before our queued update
    // arrives, simulating a concurrent remote edit.
    remote.contacts_update(&contact_id, &remote_seed.etag, &contact_data_with_email("remote-changed@x.io")).unwrap();

    let data_before = contact_data_with_email("orig@x.io");
    let data_after = contact_data_with_email("local-changed@x.io");
    {
        let mut queue = Queue::new(&mut store);
        let id = queue.enqueue_update(&contact_id, &data_before, &data_after, None).unwrap();
        assert!(queue.approve(id).unwrap());
    }

    let summary = {
        let mut engine = SyncEngine::new(&mut store, &remote, EngineConfig::default());
        engine.drain_approved(&mut NullObserver).unwrap()
    };
    assert_eq!(summary.success, 1);

    let stored = store.get_contact(&contact_id).unwrap().unwrap();
    assert!(stored.synced_to_api);
}

/// Scenario 3 (spec §8): transient failures exhaust retries, landing on
/// `failed` with `retry_count == max_retries + 1` (one failed transition
/// per attempt, including the final one, per I6/P4).
#[test]
fn retry_exhaustion_marks_failed_with_expected_retry_count() {
    let mut store = Store::open_in_memory().unwrap();
    let remote = FakeRemoteApi::new();
    let seed = remote.contacts_create(&contact_data_with_email("a@x.io"), &Default::default()).unwrap();
    remote.fail_updates(u32::MAX); // fail every update from here on

    let queue_item_id = {
        let mut queue = Queue::new(&mut store);
        let id = queue
            .enqueue_update(&seed.contact_id, &contact_data_with_email("a@x.io"), &contact_data_with_email("b@x.io"), None)
            .unwrap();
        assert!(queue.approve(id).unwrap());
        id
    };

    let summary = {
        let config = EngineConfig {
            max_retries: 3,
            readonly: false,
        };
        let mut engine = SyncEngine::new(&mut store, &remote, config);
        engine.drain_approved(&mut NullObserver).unwrap()
    };
    assert_eq!(summary.failure, 1);

    let items = store.by_filter(&Default::default(), None, None).unwrap();
    let item = items.iter().find(|i| i.id == queue_item_id).unwrap();
    assert_eq!(item.sync_status, SyncStatus::Failed);
    assert_eq!(item.retry_count, 4);
}

/// Scenario 4 (spec §8): repeated CSV rows are skipped across sessions
/// and contribute no duplicate queue entries (P5/I8).
#[test]
fn csv_dedup_skips_repeated_rows_across_sessions() {
    let mut store = Store::open_in_memory().unwrap();
    let csv = b"given_name,family_name,email,phone\nCarol,Danvers,carol@x.io,4155550101\n";

    let mut importer = Importer::new(&mut store);
    let first = importer
        .analyze("contacts.csv", csv, &CsvMapping::default(), &ExactContactMatcher)
        .unwrap();
    assert_eq!(first.new.len(), 1);
    let first_session_id = first.session_id.clone();
    importer
        .apply_decisions(
            &first_session_id,
            ApplyDecisions {
                merge_decisions: vec![],
                new_decisions: first.new,
            },
            true,
        )
        .unwrap();

    // A completed import must still report the row/contact counts written
    // by analyze(), not have them clobbered by the phase-2 stats update.
    let first_session = store.get_session(&first_session_id).unwrap().unwrap();
    assert_eq!(first_session.total_rows, 1);
    assert_eq!(first_session.parsed_contacts, 1);
    assert_eq!(first_session.new_contacts, 1);
    assert_eq!(first_session.queued_operations, 1);

    let second = importer
        .analyze("contacts.csv", csv, &CsvMapping::default(), &ExactContactMatcher)
        .unwrap();
    assert_eq!(second.new.len(), 0);
    assert_eq!(second.skipped_duplicates, 1);
    assert!(second.duplicate_file_warning.is_some());

    assert_eq!(store.pending().unwrap().len(), 1);
}

/// P3: two concurrent claim attempts on the same item race via CAS; only
/// one wins.
#[test]
fn cas_claim_is_exclusive_under_race() {
    let mut store = Store::open_in_memory().unwrap();
    let id = {
        let mut queue = Queue::new(&mut store);
        let id = queue.enqueue_create("c1", &ContactData::default(), None).unwrap();
        queue.approve(id).unwrap();
        id
    };

    let store = std::sync::Arc::new(std::sync::Mutex::new(store));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = std::sync::Arc::clone(&store);
        handles.push(std::thread::spawn(move || {
            let mut store = store.lock().unwrap();
            store.mark_syncing(id).unwrap()
        }));
    }
    let wins = handles.into_iter().map(|h| h.join().unwrap()).filter(|&won| won).count();
    assert_eq!(wins, 1);
}

/// Scenario 6 (spec §8): readonly mode short-circuits every dispatch as a
/// synthetic success and never calls the remote.
#[test]
fn readonly_mode_short_circuits_without_calling_remote() {
    struct PanicsOnCall;
    impl RemoteApi for PanicsOnCall {
        fn account_get(&self) -> contact_sync_core::CoreResult<contact_sync_core::AccountInfo> {
            panic!("remote should not be called in readonly mode")
        }
        fn contacts_scroll(
            &self,
            _cursor: Option<&str>,
            _size: u32,
        ) -> contact_sync_core::CoreResult<(Vec<contact_sync_core::RemoteContact>, Option<String>)> {
            panic!("remote should not be called in readonly mode")
        }
        fn contacts_search(&self, _query: &str) -> contact_sync_core::CoreResult<Vec<contact_sync_core::RemoteContact>> {
            panic!("remote should not be called in readonly mode")
        }
        fn contacts_get(&self, _contact_ids: &[String]) -> contact_sync_core::CoreResult<Vec<contact_sync_core::RemoteContact>> {
            panic!("remote should not be called in readonly mode")
        }
        fn contacts_create(
            &self,
            _data: &ContactData,
            _metadata: &contact_sync_core::model::ContactMetadata,
        ) -> contact_sync_core::CoreResult<contact_sync_core::RemoteContact> {
            panic!("remote should not be called in readonly mode")
        }
        fn contacts_update(
            &self,
            _contact_id: &str,
            _etag: &str,
            _data: &ContactData,
        ) -> contact_sync_core::CoreResult<contact_sync_core::RemoteContact> {
            panic!("remote should not be called in readonly mode")
        }
    }

    let mut store = Store::open_in_memory().unwrap();
    {
        let mut queue = Queue::new(&mut store);
        let id = queue.enqueue_create("c1", &contact_data_with_email("ro@x.io"), None).unwrap();
        queue.approve(id).unwrap();
    }

    let remote = PanicsOnCall;
    let config = EngineConfig {
        max_retries: 3,
        readonly: true,
    };
    let mut engine = SyncEngine::new(&mut store, &remote, config);
    let summary = engine.drain_approved(&mut NullObserver).unwrap();
    assert_eq!(summary.success, 1);

    let stored = store.get_contact("c1").unwrap().unwrap();
    assert!(stored.synced_to_api);
}

/// P6: a phase-2 apply failure rolls the whole batch back, leaving no
/// partial `contacts`/`sync_queue` rows for the session.
#[test]
fn csv_apply_phase_is_all_or_nothing() {
    use contact_sync_core::importer::MatchedContact;

    let mut store = Store::open_in_memory().unwrap();
    let mut importer = Importer::new(&mut store);
    let csv = b"given_name,family_name,email,phone\nDan,Torres,dan@x.io,\n";
    let analyzed = importer
        .analyze("contacts.csv", csv, &CsvMapping::default(), &ExactContactMatcher)
        .unwrap();
    assert_eq!(analyzed.new.len(), 1);

    let bogus_merge = MergeDecision {
        matched: MatchedContact {
            matched_contact_id: "ghost-contact".to_string(),
            parsed: ContactData::default(),
            proposed_merge: ContactData::default(),
        },
        action: Decision::Merge,
    };
    let err = importer
        .apply_decisions(
            &analyzed.session_id,
            ApplyDecisions {
                merge_decisions: vec![bogus_merge],
                new_decisions: analyzed.new,
            },
            true,
        )
        .unwrap_err();
    assert!(format!("{err}").len() > 0);

    let session = store.get_session(&analyzed.session_id).unwrap().unwrap();
    assert_eq!(session.status, ImportStatus::Failed);
    assert_eq!(store.pending().unwrap().len(), 0);
    assert_eq!(store.search(&Default::default(), 10, 0).unwrap().len(), 0);
}

/// Config persists atomically and is visible to a fresh `ConfigStore`
/// handle over the same store (spec §4.F).
#[test]
fn sync_config_persists_across_handles() {
    let mut store = Store::open_in_memory().unwrap();
    let mut cfg = contact_sync_core::model::SyncConfig::default();
    cfg.auto_sync = true;
    cfg.auto_sync_interval_minutes = 15;
    {
        let mut config = ConfigStore::new(&mut store);
        config.set(&cfg).unwrap();
    }
    let config = ConfigStore::new(&mut store);
    let reloaded = config.get().unwrap();
    assert_eq!(reloaded, cfg);
}

/// Contact merge preserves the canonical "manual contact wins matching"
/// intent: a duplicate-by-email CSV row merges into the existing contact
/// instead of creating a second one (spec §4.E step 4).
#[test]
fn csv_matched_row_merges_instead_of_duplicating() {
    let mut store = Store::open_in_memory().unwrap();
    let existing = contact_sync_core::model::Contact {
        contact_id: "existing-1".to_string(),
        contact_data: contact_data_with_email("shared@x.io"),
        contact_metadata: Default::default(),
    };
    store.save_contact(&existing, ContactSource::Manual, None, false).unwrap();

    let mut importer = Importer::new(&mut store);
    let csv = b"given_name,family_name,email,phone\nEve,Moss,shared@x.io,\n";
    let analyzed = importer
        .analyze("contacts.csv", csv, &CsvMapping::default(), &ExactContactMatcher)
        .unwrap();
    assert_eq!(analyzed.matched.len(), 1);
    assert_eq!(analyzed.matched[0].matched_contact_id, "existing-1");

    let merge_decision = MergeDecision {
        matched: analyzed.matched[0].clone(),
        action: Decision::Merge,
    };
    importer
        .apply_decisions(
            &analyzed.session_id,
            ApplyDecisions {
                merge_decisions: vec![merge_decision],
                new_decisions: vec![],
            },
            true,
        )
        .unwrap();

    assert_eq!(store.search(&Default::default(), 10, 0).unwrap().len(), 1);
    assert_eq!(store.pending().unwrap().len(), 1);
}
