//! CSV importer (spec §4.E): two atomic phases, analyze then apply,
//! sitting on top of [`crate::store::Store`] and [`crate::queue::Queue`].

use std::collections::HashMap;
use std::io::Read;

use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};
use crate::hash::hash_row;
use crate::model::{Contact, ContactData, ContactMetadata, ContactName, ContactSource, Decision, EmailAddress, PhoneNumber, StoredContact};
use crate::store::Store;

/// Header-name mapping for a CSV file; unset fields default to the
/// conventional header names below. Only `name`/`email`/`phone` are
/// consumed by matching (spec §4.E), but a mapping is free to name any
/// subset of headers it wants parsed.
#[derive(Debug, Clone)]
pub struct CsvMapping {
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub notes: Option<String>,
}

impl Default for CsvMapping {
    fn default() -> Self {
        CsvMapping {
            given_name: Some("given_name".to_string()),
            family_name: Some("family_name".to_string()),
            email: Some("email".to_string()),
            phone: Some("phone".to_string()),
            notes: Some("notes".to_string()),
        }
    }
}

/// The matching algorithm that decides whether a parsed CSV contact is
/// a likely duplicate of an existing stored contact. The algorithm
/// itself is external to this crate (spec §4.E: "the importer only
/// consumes its output") — this trait is the seam.
pub trait DuplicateMatcher {
    /// Returns `Some(contact_id)` of the best-matching existing contact
    /// for `candidate`, or `None` if it should be treated as new.
    fn find_match(&self, candidate: &ContactData, store: &Store) -> CoreResult<Option<String>>;
}

/// Matches by exact normalized email, falling back to exact normalized
/// phone. Adequate for tests and small imports; production deployments
/// are expected to supply a richer [`DuplicateMatcher`].
pub struct ExactContactMatcher;

impl DuplicateMatcher for ExactContactMatcher {
    fn find_match(&self, candidate: &ContactData, store: &Store) -> CoreResult<Option<String>> {
        if let Some(email) = candidate.emails.first() {
            let filter = crate::store::ContactFilter {
                email: Some(email.value.clone()),
                ..Default::default()
            };
            if let Some(hit) = store.search(&filter, 1, 0)?.into_iter().next() {
                return Ok(Some(hit.contact_id));
            }
        }
        if let Some(phone) = candidate.phone_numbers.first() {
            let filter = crate::store::ContactFilter {
                phone: Some(phone.value.clone()),
                ..Default::default()
            };
            if let Some(hit) = store.search(&filter, 1, 0)?.into_iter().next() {
                return Ok(Some(hit.contact_id));
            }
        }
        Ok(None)
    }
}

/// A parsed CSV contact paired with a likely existing match, produced
/// by phase 1 (spec §4.E step 4).
#[derive(Debug, Clone)]
pub struct MatchedContact {
    pub matched_contact_id: String,
    pub parsed: ContactData,
    pub proposed_merge: ContactData,
}

#[derive(Debug, Clone, Default)]
pub struct AnalyzeResult {
    pub session_id: String,
    pub matched: Vec<MatchedContact>,
    pub new: Vec<ContactData>,
    pub skipped_duplicates: u64,
    /// Set when a prior session already imported a file with this hash
    /// (advisory only; the import proceeds regardless).
    pub duplicate_file_warning: Option<String>,
}

/// Decision for a `matched` entry from phase 1 (spec §4.E Phase 2 input).
#[derive(Debug, Clone)]
pub struct MergeDecision {
    pub matched: MatchedContact,
    pub action: Decision,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyDecisions {
    pub merge_decisions: Vec<MergeDecision>,
    pub new_decisions: Vec<ContactData>,
}

pub struct Importer<'s> {
    store: &'s mut Store,
}

impl<'s> Importer<'s> {
    pub fn new(store: &'s mut Store) -> Self {
        Importer { store }
    }

    /// Phase 1 (spec §4.E). Parses `csv_bytes` with `mapping`, classifies
    /// each row against `matcher`, and drops rows whose `H_row` has
    /// already been recorded by a previous session (P5). No writes to
    /// `contacts` or `sync_queue` happen here.
    pub fn analyze(
        &mut self,
        csv_filename: &str,
        csv_bytes: &[u8],
        mapping: &CsvMapping,
        matcher: &dyn DuplicateMatcher,
    ) -> CoreResult<AnalyzeResult> {
        let csv_hash = sha256_hex(csv_bytes);
        let duplicate_file_warning = self
            .store
            .find_session_by_csv_hash(&csv_hash)?
            .map(|s| s.session_id);

        let session_id = uuid::Uuid::new_v4().to_string();
        self.store.open_session(&session_id, csv_filename, &csv_hash)?;

        let parse_result = self.parse_and_classify(&session_id, csv_bytes, mapping, matcher);
        let result = match parse_result {
            Ok(mut result) => {
                result.session_id = session_id.clone();
                result.duplicate_file_warning = duplicate_file_warning;
                self.store.update_session_stats(
                    &session_id,
                    (result.matched.len() + result.new.len()) as i64 + result.skipped_duplicates as i64,
                    (result.matched.len() + result.new.len()) as i64,
                    result.matched.len() as i64,
                    result.new.len() as i64,
                    0,
                    0,
                    0,
                )?;
                result
            }
            Err(e) => {
                self.store.fail_session(&session_id, &e.to_string())?;
                return Err(e);
            }
        };
        Ok(result)
    }

    fn parse_and_classify(
        &self,
        _session_id: &str,
        csv_bytes: &[u8],
        mapping: &CsvMapping,
        matcher: &dyn DuplicateMatcher,
    ) -> CoreResult<AnalyzeResult> {
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(csv_bytes);
        let headers = reader.headers()?.clone();

        let mut matched = Vec::new();
        let mut new = Vec::new();
        let mut skipped_duplicates = 0u64;

        for record in reader.records() {
            let record = record?;
            let row = record_to_map(&headers, &record);
            let data = row_to_contact_data(&row, mapping);

            let row_key = row_hash_subset(&row, mapping);
            if !self.store.is_new_row_hash(&row_key)? {
                skipped_duplicates += 1;
                continue;
            }

            match matcher.find_match(&data, self.store)? {
                Some(contact_id) => {
                    let existing = self
                        .store
                        .get_contact(&contact_id)?
                        .ok_or_else(|| CoreError::NotFound(format!("contact {contact_id}")))?;
                    let proposed_merge = merge_contact_data(&existing.contact_data, &data);
                    matched.push(MatchedContact {
                        matched_contact_id: contact_id,
                        parsed: data,
                        proposed_merge,
                    });
                }
                None => new.push(data),
            }
        }

        Ok(AnalyzeResult {
            matched,
            new,
            skipped_duplicates,
            ..Default::default()
        })
    }

    /// Phase 2 (spec §4.E). Applies `decisions` against `session_id`
    /// inside a single transaction: any error rolls the whole batch back
    /// and marks the session `failed` (P6).
    pub fn apply_decisions(&mut self, session_id: &str, decisions: ApplyDecisions, queue_session: bool) -> CoreResult<u64> {
        let session_for_queue = queue_session.then(|| session_id.to_string());
        let result = self.store.with_tx(|tx| {
            let mut queued = 0i64;
            for d in &decisions.merge_decisions {
                apply_merge_decision(tx, session_id, d, session_for_queue.as_deref(), &mut queued)?;
            }
            for data in &decisions.new_decisions {
                apply_new_decision(tx, session_id, data, session_for_queue.as_deref(), &mut queued)?;
            }
            Ok(queued)
        });

        match result {
            Ok(queued) => {
                self.store.set_queued_operations(session_id, queued)?;
                self.store.complete_session(session_id)?;
                Ok(queued as u64)
            }
            Err(e) => {
                self.store.fail_session(session_id, &e.to_string())?;
                Err(e)
            }
        }
    }

    /// Transitions `session_id` to `cancelled`; any phase-2 writes for it
    /// must already have rolled back via [`Store::with_tx`] if this is
    /// called mid-apply.
    pub fn cancel(&mut self, session_id: &str) -> CoreResult<()> {
        self.store.cancel_session(session_id)
    }
}

fn apply_merge_decision(
    tx: &rusqlite::Transaction<'_>,
    session_id: &str,
    decision: &MergeDecision,
    queue_session: Option<&str>,
    queued: &mut i64,
) -> CoreResult<()> {
    let row_key = row_hash_subset_from_data(&decision.matched.parsed);
    record_row_hash_tx(tx, &row_key, session_id, Some(&decision.matched.matched_contact_id), decision.action)?;

    match decision.action {
        Decision::Merge => {
            let existing = get_contact_tx(tx, &decision.matched.matched_contact_id)?
                .ok_or_else(|| CoreError::NotFound(format!("contact {}", decision.matched.matched_contact_id)))?;
            let merged = Contact {
                contact_id: decision.matched.matched_contact_id.clone(),
                contact_data: decision.matched.proposed_merge.clone(),
                contact_metadata: existing.contact_metadata.clone(),
            };
            save_contact_tx(tx, &merged, ContactSource::CsvImport, Some(session_id), false)?;
            enqueue_update_tx(
                tx,
                &decision.matched.matched_contact_id,
                &existing.contact_data,
                &decision.matched.proposed_merge,
                queue_session,
            )?;
            *queued += 1;
        }
        Decision::Skip => {}
        Decision::New => {
            let contact = Contact {
                contact_id: uuid::Uuid::new_v4().to_string(),
                contact_data: decision.matched.parsed.clone(),
                contact_metadata: ContactMetadata::default(),
            };
            save_contact_tx(tx, &contact, ContactSource::CsvImport, Some(session_id), false)?;
            enqueue_create_tx(tx, &contact.contact_id, &contact.contact_data, queue_session)?;
            *queued += 1;
        }
    }
    Ok(())
}

fn apply_new_decision(
    tx: &rusqlite::Transaction<'_>,
    session_id: &str,
    data: &ContactData,
    queue_session: Option<&str>,
    queued: &mut i64,
) -> CoreResult<()> {
    let row_key = row_hash_subset_from_data(data);
    record_row_hash_tx(tx, &row_key, session_id, None, Decision::New)?;
    let contact = Contact {
        contact_id: uuid::Uuid::new_v4().to_string(),
        contact_data: data.clone(),
        contact_metadata: ContactMetadata::default(),
    };
    save_contact_tx(tx, &contact, ContactSource::CsvImport, Some(session_id), false)?;
    enqueue_create_tx(tx, &contact.contact_id, &contact.contact_data, queue_session)?;
    *queued += 1;
    Ok(())
}

// The following tx-scoped helpers duplicate a handful of Store/Queue
// operations at the SQL level because phase 2 must run inside one
// transaction (P6) while Store's own methods each open their own
// statement against `&self`/`&mut self` rather than a `Transaction`
// (mirrors `sync_engine::oplog`'s `apply(tx: &Transaction, ...)` seam).
fn get_contact_tx(tx: &rusqlite::Transaction<'_>, contact_id: &str) -> CoreResult<Option<StoredContact>> {
    use rusqlite::OptionalExtension;
    tx.query_row("SELECT * FROM contacts WHERE contact_id = ?1", rusqlite::params![contact_id], row_to_stored_contact_tx)
        .optional()
        .map_err(CoreError::from)
}

fn row_to_stored_contact_tx(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredContact> {
    let contact_data_json: String = row.get("contact_data")?;
    let contact_metadata_json: String = row.get("contact_metadata")?;
    let source_str: String = row.get("source")?;
    Ok(StoredContact {
        contact_id: row.get("contact_id")?,
        contact_data: serde_json::from_str(&contact_data_json).unwrap_or_default(),
        contact_metadata: serde_json::from_str(&contact_metadata_json).unwrap_or_default(),
        data_hash: row.get("data_hash")?,
        synced_to_api: row.get::<_, i64>("synced_to_api")? != 0,
        last_modified: row.get("last_modified")?,
        source: ContactSource::parse(&source_str).unwrap_or(ContactSource::Manual),
        import_session_id: row.get("import_session_id")?,
        created_at: row.get("created_at")?,
    })
}

fn save_contact_tx(tx: &rusqlite::Transaction<'_>, contact: &Contact, source: ContactSource, session: Option<&str>, synced: bool) -> CoreResult<()> {
    let now = chrono::Utc::now();
    let data_json = serde_json::to_string(&contact.contact_data)?;
    let metadata_json = serde_json::to_string(&contact.contact_metadata)?;
    let hash = crate::hash::hash_contact(&contact.contact_data);
    tx.execute(
        "INSERT INTO contacts
            (contact_id, contact_data, contact_metadata, data_hash, synced_to_api, last_modified, source, import_session_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?6)
         ON CONFLICT(contact_id) DO UPDATE SET
            contact_data = excluded.contact_data,
            contact_metadata = excluded.contact_metadata,
            data_hash = excluded.data_hash,
            synced_to_api = excluded.synced_to_api,
            last_modified = excluded.last_modified,
            source = excluded.source,
            import_session_id = excluded.import_session_id",
        rusqlite::params![contact.contact_id, data_json, metadata_json, hash, synced as i64, now, source.as_str(), session],
    )?;
    Ok(())
}

fn enqueue_create_tx(tx: &rusqlite::Transaction<'_>, contact_id: &str, data_after: &ContactData, session: Option<&str>) -> CoreResult<()> {
    let hash = crate::hash::hash_contact(data_after);
    let now = chrono::Utc::now();
    let data_after_json = serde_json::to_string(data_after)?;
    tx.execute(
        "INSERT INTO sync_queue (contact_id, operation, data_after, data_hash_after, sync_status, created_at, import_session_id)
         VALUES (?1, 'create', ?2, ?3, 'pending', ?4, ?5)",
        rusqlite::params![contact_id, data_after_json, hash, now, session],
    )?;
    Ok(())
}

fn enqueue_update_tx(
    tx: &rusqlite::Transaction<'_>,
    contact_id: &str,
    data_before: &ContactData,
    data_after: &ContactData,
    session: Option<&str>,
) -> CoreResult<()> {
    let hash = crate::hash::hash_contact(data_after);
    let now = chrono::Utc::now();
    let before_json = serde_json::to_string(data_before)?;
    let after_json = serde_json::to_string(data_after)?;
    tx.execute(
        "INSERT INTO sync_queue (contact_id, operation, data_before, data_after, data_hash_after, sync_status, created_at, import_session_id)
         VALUES (?1, 'update', ?2, ?3, ?4, 'pending', ?5, ?6)",
        rusqlite::params![contact_id, before_json, after_json, hash, now, session],
    )?;
    Ok(())
}

fn record_row_hash_tx(
    tx: &rusqlite::Transaction<'_>,
    row_hash: &str,
    session_id: &str,
    contact_id: Option<&str>,
    decision: Decision,
) -> CoreResult<()> {
    let now = chrono::Utc::now();
    tx.execute(
        "INSERT INTO csv_row_hashes (row_hash, import_session_id, contact_id, decision, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![row_hash, session_id, contact_id, decision.as_str(), now],
    )?;
    Ok(())
}

fn record_to_map(headers: &csv::StringRecord, record: &csv::StringRecord) -> HashMap<String, String> {
    headers.iter().zip(record.iter()).map(|(h, v)| (h.to_string(), v.to_string())).collect()
}

fn row_to_contact_data(row: &HashMap<String, String>, mapping: &CsvMapping) -> ContactData {
    let mut data = ContactData::default();
    let given = mapping.given_name.as_ref().and_then(|h| row.get(h)).filter(|s| !s.trim().is_empty());
    let family = mapping.family_name.as_ref().and_then(|h| row.get(h)).filter(|s| !s.trim().is_empty());
    if given.is_some() || family.is_some() {
        data.name = Some(ContactName {
            given_name: given.cloned(),
            family_name: family.cloned(),
            ..Default::default()
        });
    }
    if let Some(email) = mapping.email.as_ref().and_then(|h| row.get(h)).filter(|s| !s.trim().is_empty()) {
        data.emails.push(EmailAddress {
            value: email.trim().to_string(),
            r#type: None,
        });
    }
    if let Some(phone) = mapping.phone.as_ref().and_then(|h| row.get(h)).filter(|s| !s.trim().is_empty()) {
        data.phone_numbers.push(PhoneNumber {
            value: phone.trim().to_string(),
            r#type: None,
        });
    }
    if let Some(notes) = mapping.notes.as_ref().and_then(|h| row.get(h)).filter(|s| !s.trim().is_empty()) {
        data.notes = Some(notes.trim().to_string());
    }
    data
}

/// `H_row` over the `{name, email, phone}` subset of interest (spec
/// §4.E step 5), keyed exactly as [`crate::hash::hash_row`] expects.
fn row_hash_subset(row: &HashMap<String, String>, mapping: &CsvMapping) -> String {
    let mut subset = std::collections::BTreeMap::new();
    if let Some(given) = mapping.given_name.as_ref().and_then(|h| row.get(h)) {
        subset.insert("given_name".to_string(), given.clone());
    }
    if let Some(family) = mapping.family_name.as_ref().and_then(|h| row.get(h)) {
        subset.insert("family_name".to_string(), family.clone());
    }
    if let Some(email) = mapping.email.as_ref().and_then(|h| row.get(h)) {
        subset.insert("email".to_string(), email.clone());
    }
    if let Some(phone) = mapping.phone.as_ref().and_then(|h| row.get(h)) {
        subset.insert("phone".to_string(), phone.clone());
    }
    hash_row(&subset)
}

fn row_hash_subset_from_data(data: &ContactData) -> String {
    let mut subset = std::collections::BTreeMap::new();
    if let Some(name) = &data.name {
        if let Some(g) = &name.given_name {
            subset.insert("given_name".to_string(), g.clone());
        }
        if let Some(f) = &name.family_name {
            subset.insert("family_name".to_string(), f.clone());
        }
    }
    if let Some(email) = data.emails.first() {
        subset.insert("email".to_string(), email.value.clone());
    }
    if let Some(phone) = data.phone_numbers.first() {
        subset.insert("phone".to_string(), phone.value.clone());
    }
    hash_row(&subset)
}

/// Proposes a merged contact: fields the CSV row supplies override the
/// stored contact's, everything else is kept (spec §4.E step 4
/// "proposed merged contact").
fn merge_contact_data(existing: &ContactData, parsed: &ContactData) -> ContactData {
    let mut merged = existing.clone();
    if parsed.name.is_some() {
        merged.name = parsed.name.clone();
    }
    if !parsed.emails.is_empty() {
        merged.emails = parsed.emails.clone();
    }
    if !parsed.phone_numbers.is_empty() {
        merged.phone_numbers = parsed.phone_numbers.clone();
    }
    if parsed.notes.is_some() {
        merged.notes = parsed.notes.clone();
    }
    merged
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    let mut cursor = bytes;
    let mut buf = [0u8; 8192];
    loop {
        let n = cursor.read(&mut buf).unwrap_or(0);
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_contact(email: &str) -> Contact {
        let mut data = ContactData::default();
        data.emails.push(EmailAddress {
            value: email.to_string(),
            r#type: None,
        });
        Contact {
            contact_id: uuid::Uuid::new_v4().to_string(),
            contact_data: data,
            contact_metadata: ContactMetadata::default(),
        }
    }

    #[test]
    fn analyze_classifies_new_when_no_match() {
        let mut store = Store::open_in_memory().unwrap();
        let csv = b"given_name,family_name,email,phone\nBob,Smith,b@y.io,4155550100\n";
        let mut importer = Importer::new(&mut store);
        let result = importer
            .analyze("contacts.csv", csv, &CsvMapping::default(), &ExactContactMatcher)
            .unwrap();
        assert_eq!(result.new.len(), 1);
        assert_eq!(result.matched.len(), 0);
        assert_eq!(result.skipped_duplicates, 0);
    }

    #[test]
    fn analyze_classifies_matched_on_existing_email() {
        let mut store = Store::open_in_memory().unwrap();
        let contact = default_contact("b@y.io");
        let contact_id = contact.contact_id.clone();
        store.save_contact(&contact, ContactSource::Manual, None, false).unwrap();

        let csv = b"given_name,family_name,email,phone\nBob,Smith,b@y.io,\n";
        let mut importer = Importer::new(&mut store);
        let result = importer
            .analyze("contacts.csv", csv, &CsvMapping::default(), &ExactContactMatcher)
            .unwrap();
        assert_eq!(result.matched.len(), 1);
        assert_eq!(result.matched[0].matched_contact_id, contact_id);
    }

    #[test]
    fn repeated_row_is_skipped_across_sessions() {
        let mut store = Store::open_in_memory().unwrap();
        let csv = b"given_name,family_name,email,phone\nBob,Smith,b@y.io,+1 (415) 555 0100\n";

        {
            let mut importer = Importer::new(&mut store);
            let result = importer
                .analyze("contacts.csv", csv, &CsvMapping::default(), &ExactContactMatcher)
                .unwrap();
            assert_eq!(result.skipped_duplicates, 0);
            importer
                .apply_decisions(
                    &result.session_id,
                    ApplyDecisions {
                        merge_decisions: vec![],
                        new_decisions: result.new,
                    },
                    true,
                )
                .unwrap();
        }

        let mut importer = Importer::new(&mut store);
        let result = importer
            .analyze("contacts.csv", csv, &CsvMapping::default(), &ExactContactMatcher)
            .unwrap();
        assert_eq!(result.skipped_duplicates, 1);
        assert_eq!(result.new.len(), 0);
        assert!(result.duplicate_file_warning.is_some());
    }

    #[test]
    fn apply_decisions_enqueues_create_and_marks_session_completed() {
        let mut store = Store::open_in_memory().unwrap();
        let csv = b"given_name,family_name,email,phone\nAda,Lovelace,ada@x.io,\n";
        let mut importer = Importer::new(&mut store);
        let result = importer
            .analyze("contacts.csv", csv, &CsvMapping::default(), &ExactContactMatcher)
            .unwrap();
        let session_id = result.session_id.clone();
        let queued = importer
            .apply_decisions(
                &session_id,
                ApplyDecisions {
                    merge_decisions: vec![],
                    new_decisions: result.new,
                },
                true,
            )
            .unwrap();
        assert_eq!(queued, 1);

        let session = store.get_session(&session_id).unwrap().unwrap();
        assert_eq!(session.status, crate::model::ImportStatus::Completed);
        assert_eq!(store.pending().unwrap().len(), 1);
        // Phase 2 must only touch queued_operations; the Phase 1 counters
        // it wrote at analyze() time must survive completion untouched.
        assert_eq!(session.total_rows, 1);
        assert_eq!(session.parsed_contacts, 1);
        assert_eq!(session.new_contacts, 1);
        assert_eq!(session.matched_contacts, 0);
        assert_eq!(session.queued_operations, 1);
    }

    #[test]
    fn apply_decisions_rolls_back_session_atomically_on_error() {
        let mut store = Store::open_in_memory().unwrap();
        let mut importer = Importer::new(&mut store);
        let session_id = uuid::Uuid::new_v4().to_string();
        store.open_session(&session_id, "x.csv", "deadbeef").unwrap();

        let bogus_match = MatchedContact {
            matched_contact_id: "does-not-exist".to_string(),
            parsed: ContactData::default(),
            proposed_merge: ContactData::default(),
        };
        let err = importer
            .apply_decisions(
                &session_id,
                ApplyDecisions {
                    merge_decisions: vec![MergeDecision {
                        matched: bogus_match,
                        action: Decision::Merge,
                    }],
                    new_decisions: vec![],
                },
                true,
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));

        let session = store.get_session(&session_id).unwrap().unwrap();
        assert_eq!(session.status, crate::model::ImportStatus::Failed);
        assert_eq!(store.pending().unwrap().len(), 0);
    }
}
