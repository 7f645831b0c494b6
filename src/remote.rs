//! Remote API external collaborator boundary (spec §6). The engine and
//! importer consume a `RemoteApi` trait object rather than embedding HTTP
//! calls inline, mirroring how `setu`'s sync loop consumes a `Hub` object
//! (`google_people1`) instead of raw requests.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::model::{ContactData, ContactMetadata};

/// The wire shape of a contact as exchanged with the remote API (spec §6
/// `contacts.create`/`contacts.update`/`contacts.get` payloads).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteContact {
    pub contact_id: String,
    pub etag: String,
    pub contact_data: ContactData,
    #[serde(default)]
    pub contact_metadata: ContactMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account_id: String,
    pub email: String,
}

/// Outbound endpoints of spec §6, narrowed to what the engine and importer
/// need. Implementations may be backed by a real HTTP client or, for
/// tests, an in-memory fake.
pub trait RemoteApi: Send + Sync {
    fn account_get(&self) -> CoreResult<AccountInfo>;

    /// Cursor-paginated; callers iterate until the returned cursor is
    /// `None`.
    fn contacts_scroll(&self, cursor: Option<&str>, size: u32) -> CoreResult<(Vec<RemoteContact>, Option<String>)>;

    fn contacts_search(&self, query: &str) -> CoreResult<Vec<RemoteContact>>;

    fn contacts_get(&self, contact_ids: &[String]) -> CoreResult<Vec<RemoteContact>>;

    fn contacts_create(&self, data: &ContactData, metadata: &ContactMetadata) -> CoreResult<RemoteContact>;

    fn contacts_update(&self, contact_id: &str, etag: &str, data: &ContactData) -> CoreResult<RemoteContact>;
}

/// In-memory test double (mirrors the role `FakeRemoteApi` plays
/// throughout this crate's test suite; analogous to swapping `setu`'s
/// `Hub` for a stub in tests).
pub struct FakeRemoteApi {
    contacts: Mutex<HashMap<String, RemoteContact>>,
    next_etag: Mutex<u64>,
    fail_next_n_updates: Mutex<u32>,
    fail_permanently: Mutex<bool>,
}

impl Default for FakeRemoteApi {
    fn default() -> Self {
        FakeRemoteApi {
            contacts: Mutex::new(HashMap::new()),
            next_etag: Mutex::new(1),
            fail_next_n_updates: Mutex::new(0),
            fail_permanently: Mutex::new(false),
        }
    }
}

impl FakeRemoteApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, contact: RemoteContact) {
        self.contacts.lock().unwrap().insert(contact.contact_id.clone(), contact);
    }

    /// Test hook (spec §8 scenario 3): make the next `n` update calls
    /// return a transient error, then permanently fail thereafter.
    pub fn fail_updates(&self, n: u32) {
        *self.fail_next_n_updates.lock().unwrap() = n;
        *self.fail_permanently.lock().unwrap() = true;
    }

    fn next_etag(&self) -> String {
        let mut e = self.next_etag.lock().unwrap();
        *e += 1;
        format!("etag-{}", *e)
    }
}

impl RemoteApi for FakeRemoteApi {
    fn account_get(&self) -> CoreResult<AccountInfo> {
        Ok(AccountInfo {
            account_id: "fake-account".into(),
            email: "fake@example.test".into(),
        })
    }

    fn contacts_scroll(&self, _cursor: Option<&str>, _size: u32) -> CoreResult<(Vec<RemoteContact>, Option<String>)> {
        let contacts = self.contacts.lock().unwrap();
        Ok((contacts.values().cloned().collect(), None))
    }

    fn contacts_search(&self, query: &str) -> CoreResult<Vec<RemoteContact>> {
        let q = query.to_lowercase();
        let contacts = self.contacts.lock().unwrap();
        Ok(contacts
            .values()
            .filter(|c| serde_json::to_string(&c.contact_data).unwrap_or_default().to_lowercase().contains(&q))
            .cloned()
            .collect())
    }

    fn contacts_get(&self, contact_ids: &[String]) -> CoreResult<Vec<RemoteContact>> {
        let contacts = self.contacts.lock().unwrap();
        Ok(contact_ids.iter().filter_map(|id| contacts.get(id).cloned()).collect())
    }

    fn contacts_create(&self, data: &ContactData, metadata: &ContactMetadata) -> CoreResult<RemoteContact> {
        let contact_id = uuid::Uuid::new_v4().to_string();
        let remote = RemoteContact {
            contact_id: contact_id.clone(),
            etag: self.next_etag(),
            contact_data: data.clone(),
            contact_metadata: metadata.clone(),
        };
        self.contacts.lock().unwrap().insert(contact_id, remote.clone());
        Ok(remote)
    }

    fn contacts_update(&self, contact_id: &str, etag: &str, data: &ContactData) -> CoreResult<RemoteContact> {
        {
            let mut remaining = self.fail_next_n_updates.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CoreError::Remote("transient upstream error".into()));
            }
        }
        if *self.fail_permanently.lock().unwrap() {
            return Err(CoreError::Remote("permanent upstream error".into()));
        }

        let mut contacts = self.contacts.lock().unwrap();
        let existing = contacts
            .get(contact_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("remote contact {contact_id}")))?;
        let _ = etag; // the fake doesn't enforce etag precondition failures
        let updated = RemoteContact {
            contact_id: contact_id.to_string(),
            etag: self.next_etag(),
            contact_data: data.clone(),
            contact_metadata: existing.contact_metadata,
        };
        contacts.insert(contact_id.to_string(), updated.clone());
        Ok(updated)
    }
}

#[cfg(feature = "remote-http")]
pub mod http {
    //! Blocking `reqwest`-backed implementation, feature-gated so the
    //! default build matches the teacher's zero-network-dependency
    //! posture (spec §6, SPEC_FULL ambient stack note).

    use super::*;

    /// The per-item 30s bound (spec §4.D/§9) is enforced here via the
    /// client's own request timeout rather than by racing a worker thread
    /// on the engine side — see `engine.rs::run_with_cancel`.
    const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

    pub struct HttpRemoteApi {
        base_url: String,
        bearer_token: String,
        client: reqwest::blocking::Client,
    }

    impl HttpRemoteApi {
        pub fn new(base_url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
            let client = reqwest::blocking::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client with a timeout is always buildable");
            HttpRemoteApi {
                base_url: base_url.into(),
                bearer_token: bearer_token.into(),
                client,
            }
        }

        fn post<T: Serialize, R: for<'de> Deserialize<'de>>(&self, path: &str, body: &T) -> CoreResult<R> {
            let resp = self
                .client
                .post(format!("{}{}", self.base_url, path))
                .bearer_auth(&self.bearer_token)
                .json(body)
                .send()
                .map_err(|e| CoreError::Remote(e.to_string()))?;
            if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
                return Err(CoreError::Auth("bearer token rejected".into()));
            }
            if !resp.status().is_success() {
                return Err(CoreError::Remote(format!("status {}", resp.status())));
            }
            resp.json::<R>().map_err(|e| CoreError::Remote(e.to_string()))
        }
    }

    #[derive(Serialize)]
    struct ScrollRequest<'a> {
        size: u32,
        #[serde(rename = "scrollCursor", skip_serializing_if = "Option::is_none")]
        cursor: Option<&'a str>,
    }

    #[derive(Deserialize)]
    struct ScrollResponse {
        contacts: Vec<RemoteContact>,
        cursor: Option<String>,
    }

    #[derive(Serialize)]
    struct SearchRequest<'a> {
        #[serde(rename = "searchQuery")]
        search_query: &'a str,
    }

    #[derive(Deserialize)]
    struct ContactsResponse {
        contacts: Vec<RemoteContact>,
    }

    #[derive(Serialize)]
    struct GetRequest<'a> {
        #[serde(rename = "contactIds")]
        contact_ids: &'a [String],
    }

    #[derive(Serialize)]
    struct CreateRequest<'a> {
        contact: CreatePayload<'a>,
    }

    #[derive(Serialize)]
    struct CreatePayload<'a> {
        #[serde(rename = "contactData")]
        contact_data: &'a ContactData,
        #[serde(rename = "contactMetadata")]
        contact_metadata: &'a ContactMetadata,
    }

    #[derive(Deserialize)]
    struct ContactResponse {
        contact: RemoteContact,
    }

    #[derive(Serialize)]
    struct UpdateRequest<'a> {
        contact: UpdatePayload<'a>,
    }

    #[derive(Serialize)]
    struct UpdatePayload<'a> {
        #[serde(rename = "contactId")]
        contact_id: &'a str,
        etag: &'a str,
        #[serde(rename = "contactData")]
        contact_data: &'a ContactData,
    }

    impl RemoteApi for HttpRemoteApi {
        fn account_get(&self) -> CoreResult<AccountInfo> {
            #[derive(Deserialize)]
            struct AccountResponse {
                account: AccountInfo,
            }
            let resp: AccountResponse = self.post("/api/v1/account.get", &serde_json::json!({}))?;
            Ok(resp.account)
        }

        fn contacts_scroll(&self, cursor: Option<&str>, size: u32) -> CoreResult<(Vec<RemoteContact>, Option<String>)> {
            let resp: ScrollResponse =
                self.post("/api/v1/contacts.scroll", &ScrollRequest { size, cursor })?;
            Ok((resp.contacts, resp.cursor))
        }

        fn contacts_search(&self, query: &str) -> CoreResult<Vec<RemoteContact>> {
            let resp: ContactsResponse =
                self.post("/api/v1/contacts.search", &SearchRequest { search_query: query })?;
            Ok(resp.contacts)
        }

        fn contacts_get(&self, contact_ids: &[String]) -> CoreResult<Vec<RemoteContact>> {
            let resp: ContactsResponse =
                self.post("/api/v1/contacts.get", &GetRequest { contact_ids })?;
            Ok(resp.contacts)
        }

        fn contacts_create(&self, data: &ContactData, metadata: &ContactMetadata) -> CoreResult<RemoteContact> {
            let resp: ContactResponse = self.post(
                "/api/v1/contacts.create",
                &CreateRequest {
                    contact: CreatePayload {
                        contact_data: data,
                        contact_metadata: metadata,
                    },
                },
            )?;
            Ok(resp.contact)
        }

        fn contacts_update(&self, contact_id: &str, etag: &str, data: &ContactData) -> CoreResult<RemoteContact> {
            let resp: ContactResponse = self.post(
                "/api/v1/contacts.update",
                &UpdateRequest {
                    contact: UpdatePayload {
                        contact_id,
                        etag,
                        contact_data: data,
                    },
                },
            )?;
            Ok(resp.contact)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_get_round_trips() {
        let api = FakeRemoteApi::new();
        let created = api.contacts_create(&ContactData::default(), &ContactMetadata::default()).unwrap();
        let fetched = api.contacts_get(&[created.contact_id.clone()]).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].contact_id, created.contact_id);
    }

    #[test]
    fn update_missing_contact_is_not_found() {
        let api = FakeRemoteApi::new();
        let err = api.contacts_update("nope", "etag-1", &ContactData::default()).unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn fail_updates_returns_transient_then_permanent_error() {
        let api = FakeRemoteApi::new();
        let created = api.contacts_create(&ContactData::default(), &ContactMetadata::default()).unwrap();
        api.fail_updates(2);
        assert!(api.contacts_update(&created.contact_id, &created.etag, &ContactData::default()).is_err());
        assert!(api.contacts_update(&created.contact_id, &created.etag, &ContactData::default()).is_err());
        assert!(api.contacts_update(&created.contact_id, &created.etag, &ContactData::default()).is_err());
    }
}
