use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::Store;
use crate::error::{CoreError, CoreResult};
use crate::hash::hash_contact;
use crate::model::{Contact, ContactData, ContactMetadata, ContactSource, StoredContact};

/// Escapes `%`, `_`, and `\` so they're matched literally under
/// `LIKE ... ESCAPE '\'` (spec §4.B, P8).
fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c == '%' || c == '_' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct ContactFilter {
    pub source: Option<ContactSource>,
    pub synced: Option<bool>,
    pub session: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Backward-compatible alias used by callers that only care about search
/// predicates, distinct name kept for clarity at call sites.
pub type SearchFilter = ContactFilter;

fn build_where_clause(filter: &ContactFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
    let mut sql = String::from("1=1");
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(source) = filter.source {
        sql.push_str(" AND source = ?");
        args.push(Box::new(source.as_str().to_string()));
    }
    if let Some(synced) = filter.synced {
        sql.push_str(" AND synced_to_api = ?");
        args.push(Box::new(synced as i64));
    }
    if let Some(session) = &filter.session {
        sql.push_str(" AND import_session_id = ?");
        args.push(Box::new(session.clone()));
    }
    if let Some(name) = &filter.name {
        sql.push_str(
            " AND json_extract(contact_data, '$.name.givenName') || ' ' || \
             json_extract(contact_data, '$.name.familyName') LIKE ? ESCAPE '\\'",
        );
        args.push(Box::new(format!("%{}%", escape_like(name))));
    }
    if let Some(email) = &filter.email {
        sql.push_str(" AND contact_data LIKE ? ESCAPE '\\'");
        args.push(Box::new(format!("%{}%", escape_like(email))));
    }
    if let Some(phone) = &filter.phone {
        let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
        sql.push_str(" AND contact_data LIKE ? ESCAPE '\\'");
        args.push(Box::new(format!("%{}%", escape_like(&digits))));
    }
    (sql, args)
}

fn row_to_stored_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredContact> {
    let contact_data_json: String = row.get("contact_data")?;
    let contact_metadata_json: String = row.get("contact_metadata")?;
    let source_str: String = row.get("source")?;
    Ok(StoredContact {
        contact_id: row.get("contact_id")?,
        contact_data: serde_json::from_str(&contact_data_json)
            .unwrap_or_default(),
        contact_metadata: serde_json::from_str(&contact_metadata_json)
            .unwrap_or_default(),
        data_hash: row.get("data_hash")?,
        synced_to_api: row.get::<_, i64>("synced_to_api")? != 0,
        last_modified: row.get("last_modified")?,
        source: ContactSource::parse(&source_str).unwrap_or(ContactSource::Manual),
        import_session_id: row.get("import_session_id")?,
        created_at: row.get("created_at")?,
    })
}

impl Store {
    /// Upsert by `contact_id`; writes new hash; sets `last_modified` to
    /// current time (I1, I3).
    pub fn save_contact(
        &mut self,
        contact: &Contact,
        source: ContactSource,
        session: Option<&str>,
        synced: bool,
    ) -> CoreResult<String> {
        let hash = hash_contact(&contact.contact_data);
        let now = Utc::now();
        let data_json = serde_json::to_string(&contact.contact_data)?;
        let metadata_json = serde_json::to_string(&contact.contact_metadata)?;
        self.conn().execute(
            "INSERT INTO contacts
                (contact_id, contact_data, contact_metadata, data_hash, synced_to_api,
                 last_modified, source, import_session_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?6)
             ON CONFLICT(contact_id) DO UPDATE SET
                contact_data = excluded.contact_data,
                contact_metadata = excluded.contact_metadata,
                data_hash = excluded.data_hash,
                synced_to_api = excluded.synced_to_api,
                last_modified = excluded.last_modified,
                source = excluded.source,
                import_session_id = excluded.import_session_id",
            params![
                contact.contact_id,
                data_json,
                metadata_json,
                hash,
                synced as i64,
                now,
                source.as_str(),
                session,
            ],
        )?;
        Ok(hash)
    }

    pub fn get_contact(&self, id: &str) -> CoreResult<Option<StoredContact>> {
        self.conn()
            .query_row(
                "SELECT * FROM contacts WHERE contact_id = ?1",
                params![id],
                row_to_stored_contact,
            )
            .optional()
            .map_err(CoreError::from)
    }

    pub fn get_by_hash(&self, hash: &str) -> CoreResult<Option<StoredContact>> {
        self.conn()
            .query_row(
                "SELECT * FROM contacts WHERE data_hash = ?1",
                params![hash],
                row_to_stored_contact,
            )
            .optional()
            .map_err(CoreError::from)
    }

    pub fn list(&self, limit: i64, offset: i64) -> CoreResult<Vec<StoredContact>> {
        self.search(&ContactFilter {
            ..Default::default()
        }, limit, offset)
    }

    /// Filter predicates combine with `AND` (spec §4.B). Name/email use
    /// `LIKE '%q%'` with literal-escaping; phone strips non-digits from
    /// the query before matching.
    pub fn search(
        &self,
        filter: &ContactFilter,
        limit: i64,
        offset: i64,
    ) -> CoreResult<Vec<StoredContact>> {
        let (where_sql, args) = build_where_clause(filter);
        let sql = format!(
            "SELECT * FROM contacts WHERE {where_sql} ORDER BY last_modified DESC LIMIT ? OFFSET ?"
        );
        let mut args = args;
        args.push(Box::new(limit));
        args.push(Box::new(offset));

        let mut stmt = self.conn().prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params_ref.as_slice(), row_to_stored_contact)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count(&self, filter: &ContactFilter) -> CoreResult<i64> {
        let (where_sql, args) = build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM contacts WHERE {where_sql}");
        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        self.conn()
            .query_row(&sql, params_ref.as_slice(), |r| r.get(0))
            .map_err(CoreError::from)
    }

    pub fn exists(&self, id: &str) -> CoreResult<bool> {
        Ok(self.get_contact(id)?.is_some())
    }

    pub fn mark_synced(&mut self, id: &str) -> CoreResult<()> {
        let n = self.conn().execute(
            "UPDATE contacts SET synced_to_api = 1 WHERE contact_id = ?1",
            params![id],
        )?;
        if n == 0 {
            return Err(CoreError::NotFound(format!("contact {id}")));
        }
        Ok(())
    }

    pub fn update(&mut self, contact: &Contact, synced: Option<bool>) -> CoreResult<String> {
        let existing = self
            .get_contact(&contact.contact_id)?
            .ok_or_else(|| CoreError::NotFound(format!("contact {}", contact.contact_id)))?;
        self.save_contact(
            contact,
            existing.source,
            existing.import_session_id.as_deref(),
            synced.unwrap_or(existing.synced_to_api),
        )
    }

    pub fn delete(&mut self, id: &str) -> CoreResult<()> {
        let n = self
            .conn()
            .execute("DELETE FROM contacts WHERE contact_id = ?1", params![id])?;
        if n == 0 {
            return Err(CoreError::NotFound(format!("contact {id}")));
        }
        Ok(())
    }

    pub fn clear_all(&mut self) -> CoreResult<()> {
        self.conn().execute("DELETE FROM contacts", [])?;
        Ok(())
    }
}

/// Builds a fresh [`Contact`] ready to persist, stamping the metadata as
/// it arrived on the wire or from a CSV row.
pub fn new_contact(contact_id: String, data: ContactData, metadata: ContactMetadata) -> Contact {
    Contact {
        contact_id,
        contact_data: data,
        contact_metadata: metadata,
    }
}
