//! Data model (spec §3): contacts, queue items, import sessions, config.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactName {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub middle_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailAddress {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneNumber {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlValue {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImHandle {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedPerson {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatedEvent {
    pub date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Birthday {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub month: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day: Option<u32>,
}

/// The hashed payload (spec §3 "Payload `contact_data`"). Deliberately
/// excludes tag ids / shared-by ids / company flag / etag — those live in
/// [`ContactMetadata`] and are not part of `H(contact_data)` (invariant I1).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<ContactName>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emails: Vec<EmailAddress>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phone_numbers: Vec<PhoneNumber>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organizations: Vec<Organization>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<Address>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<UrlValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub im_handles: Vec<ImHandle>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_people: Vec<RelatedPerson>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<DatedEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birthday: Option<Birthday>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<serde_json::Value>,
}

/// Metadata that rides alongside `contact_data` but is never hashed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shared_by_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_company_contact: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// A contact as handled internally by store/queue/importer/engine:
/// identity + hashed payload + unhashed metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub contact_id: String,
    pub contact_data: ContactData,
    #[serde(default)]
    pub contact_metadata: ContactMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactSource {
    Api,
    CsvImport,
    Manual,
}

impl ContactSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ContactSource::Api => "api",
            ContactSource::CsvImport => "csv_import",
            ContactSource::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "api" => Some(ContactSource::Api),
            "csv_import" => Some(ContactSource::CsvImport),
            "manual" => Some(ContactSource::Manual),
            _ => None,
        }
    }
}

/// `StoredContact` (spec §3). `data_hash` is recomputed on every mutation
/// (I1); `synced_to_api=true` only ever comes from the engine or an API
/// pull (I3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredContact {
    pub contact_id: String,
    pub contact_data: ContactData,
    pub contact_metadata: ContactMetadata,
    pub data_hash: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub synced_to_api: bool,
    pub last_modified: DateTime<Utc>,
    pub source: ContactSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOperation {
    Create,
    Update,
    Delete,
}

impl QueueOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueOperation::Create => "create",
            QueueOperation::Update => "update",
            QueueOperation::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(QueueOperation::Create),
            "update" => Some(QueueOperation::Update),
            "delete" => Some(QueueOperation::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Approved,
    Syncing,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Approved => "approved",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "approved" => Some(SyncStatus::Approved),
            "syncing" => Some(SyncStatus::Syncing),
            "synced" => Some(SyncStatus::Synced),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }

    pub const ALL: [SyncStatus; 5] = [
        SyncStatus::Pending,
        SyncStatus::Approved,
        SyncStatus::Syncing,
        SyncStatus::Synced,
        SyncStatus::Failed,
    ];
}

/// `QueueItem` (spec §3). `approved` is tri-state: `None` = not yet
/// reviewed, `Some(false)` = reviewed and rejected, `Some(true)` = reviewed
/// and approved (invariant I5: `sync_status=approved` iff `reviewed &&
/// approved==Some(true)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub contact_id: String,
    pub operation: QueueOperation,
    pub data_before: Option<ContactData>,
    pub data_after: Option<ContactData>,
    pub data_hash_after: Option<String>,
    pub reviewed: bool,
    pub approved: Option<bool>,
    pub sync_status: SyncStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub synced_at: Option<DateTime<Utc>>,
    pub retry_count: i64,
    pub import_session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl ImportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ImportStatus::InProgress => "in_progress",
            ImportStatus::Completed => "completed",
            ImportStatus::Failed => "failed",
            ImportStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(ImportStatus::InProgress),
            "completed" => Some(ImportStatus::Completed),
            "failed" => Some(ImportStatus::Failed),
            "cancelled" => Some(ImportStatus::Cancelled),
            _ => None,
        }
    }
}

/// `ImportSession` (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSession {
    pub session_id: String,
    pub csv_filename: String,
    pub csv_hash: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_rows: i64,
    pub parsed_contacts: i64,
    pub matched_contacts: i64,
    pub new_contacts: i64,
    pub queued_operations: i64,
    pub synced_operations: i64,
    pub failed_operations: i64,
    pub status: ImportStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Merge,
    Skip,
    New,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Merge => "merge",
            Decision::Skip => "skip",
            Decision::New => "new",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "merge" => Some(Decision::Merge),
            "skip" => Some(Decision::Skip),
            "new" => Some(Decision::New),
            _ => None,
        }
    }
}

/// `CsvRowHash` (spec §3). Invariant I8: a given `row_hash` is inserted at
/// most once across all sessions — enforced by `row_hash` being the
/// primary key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvRowHash {
    pub row_hash: String,
    pub import_session_id: String,
    pub contact_id: Option<String>,
    pub decision: Option<Decision>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    Manual,
    Local,
    Remote,
}

impl ConflictResolution {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictResolution::Manual => "manual",
            ConflictResolution::Local => "local",
            ConflictResolution::Remote => "remote",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(ConflictResolution::Manual),
            "local" => Some(ConflictResolution::Local),
            "remote" => Some(ConflictResolution::Remote),
            _ => None,
        }
    }
}

/// `SyncConfig` (spec §4.F). Defaults match the spec's literal defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default)]
    pub auto_sync: bool,
    #[serde(default = "default_auto_sync_interval_minutes")]
    pub auto_sync_interval_minutes: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default)]
    pub conflict_resolution: ConflictResolution,
    #[serde(default)]
    pub sync_on_startup: bool,
    #[serde(default)]
    pub sync_on_import: bool,
}

fn default_auto_sync_interval_minutes() -> u32 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_max_retry_delay_ms() -> u64 {
    30_000
}

impl Default for ConflictResolution {
    fn default() -> Self {
        ConflictResolution::Manual
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync: false,
            auto_sync_interval_minutes: default_auto_sync_interval_minutes(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            conflict_resolution: ConflictResolution::Manual,
            sync_on_startup: false,
            sync_on_import: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_defaults_match_spec() {
        let cfg = SyncConfig::default();
        assert!(!cfg.auto_sync);
        assert_eq!(cfg.auto_sync_interval_minutes, 30);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.retry_delay_ms, 1000);
        assert_eq!(cfg.max_retry_delay_ms, 30_000);
        assert_eq!(cfg.conflict_resolution, ConflictResolution::Manual);
        assert!(!cfg.sync_on_startup);
        assert!(!cfg.sync_on_import);
    }

    #[test]
    fn sync_config_round_trips_through_json() {
        let cfg = SyncConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: SyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn enum_parse_round_trips() {
        for s in SyncStatus::ALL {
            assert_eq!(SyncStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(QueueOperation::parse("create"), Some(QueueOperation::Create));
        assert_eq!(QueueOperation::parse("bogus"), None);
        assert_eq!(ContactSource::parse("csv_import"), Some(ContactSource::CsvImport));
        assert_eq!(Decision::parse("merge"), Some(Decision::Merge));
        assert_eq!(ImportStatus::parse("cancelled"), Some(ImportStatus::Cancelled));
        assert_eq!(ConflictResolution::parse("remote"), Some(ConflictResolution::Remote));
    }

    #[test]
    fn contact_data_omits_absent_fields_from_json() {
        let data = ContactData {
            notes: Some("hello".into()),
            ..Default::default()
        };
        let v = serde_json::to_value(&data).unwrap();
        let obj = v.as_object().unwrap();
        assert!(!obj.contains_key("name"));
        assert!(!obj.contains_key("emails"));
        assert!(!obj.contains_key("birthday"));
        assert_eq!(obj.get("notes").unwrap(), "hello");
    }
}
