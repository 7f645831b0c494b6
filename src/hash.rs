//! Hasher (spec §4.A): deterministic content hash of a contact or CSV row.
//!
//! Normalization must be strictly idempotent (`H(normalize(x)) = H(x)`).
//! Canonical-form ordering falls out of `serde_json::Map`'s default
//! `BTreeMap` backing (this crate does not enable `preserve_order`), so
//! serializing a `Map<String, Value>` built here already emits keys in
//! ascending order with no extra sorting step.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::model::{Address, ContactData, EmailAddress, Organization, PhoneNumber, UrlValue};

/// Trims and lowercases a label-like field (names, types, org fields,
/// address components other than postal code, URLs).
fn normalize_label(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Trims and collapses internal whitespace runs, without lowercasing —
/// `notes` is explicitly excluded from the lowercase list in §4.A.
fn normalize_notes(s: &str) -> String {
    s.trim().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strips all non-digit characters. Deliberately does *not* preserve a
/// leading `+` (unlike some reference phone-normalizers) because §4.A
/// says "reduce to digits only".
fn normalize_phone(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Whitespace-stripped, case preserved (spec §9 Open Question decision).
fn normalize_postal_code(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

fn opt_label(s: &Option<String>) -> Option<String> {
    s.as_deref().map(normalize_label).filter(|v| !v.is_empty())
}

fn insert_if_present(map: &mut Map<String, Value>, key: &str, value: Option<String>) {
    if let Some(v) = value {
        map.insert(key.to_string(), Value::String(v));
    }
}

fn normalize_email(e: &EmailAddress) -> Option<Map<String, Value>> {
    let value = normalize_label(&e.value);
    if value.is_empty() {
        return None;
    }
    let mut m = Map::new();
    m.insert("value".to_string(), Value::String(value));
    insert_if_present(&mut m, "type", opt_label(&e.r#type));
    Some(m)
}

fn normalize_phone_entry(p: &PhoneNumber) -> Option<Map<String, Value>> {
    let value = normalize_phone(&p.value);
    if value.is_empty() {
        return None;
    }
    let mut m = Map::new();
    m.insert("value".to_string(), Value::String(value));
    insert_if_present(&mut m, "type", opt_label(&p.r#type));
    Some(m)
}

fn normalize_organization(o: &Organization) -> Option<Map<String, Value>> {
    let name = opt_label(&o.name);
    let title = opt_label(&o.title);
    let department = opt_label(&o.department);
    if name.is_none() && title.is_none() && department.is_none() {
        return None;
    }
    let mut m = Map::new();
    insert_if_present(&mut m, "name", name);
    insert_if_present(&mut m, "title", title);
    insert_if_present(&mut m, "department", department);
    Some(m)
}

fn normalize_address(a: &Address) -> Option<Map<String, Value>> {
    let street = opt_label(&a.street);
    let city = opt_label(&a.city);
    let region = opt_label(&a.region);
    let postal_code = a
        .postal_code
        .as_deref()
        .map(normalize_postal_code)
        .filter(|v| !v.is_empty());
    let country = opt_label(&a.country);
    let r#type = opt_label(&a.r#type);
    if street.is_none()
        && city.is_none()
        && region.is_none()
        && postal_code.is_none()
        && country.is_none()
    {
        return None;
    }
    let mut m = Map::new();
    insert_if_present(&mut m, "street", street.clone());
    insert_if_present(&mut m, "city", city.clone());
    insert_if_present(&mut m, "region", region);
    insert_if_present(&mut m, "postalCode", postal_code);
    insert_if_present(&mut m, "country", country);
    insert_if_present(&mut m, "type", r#type);
    Some(m)
}

fn normalize_url(u: &UrlValue) -> Option<Map<String, Value>> {
    let value = normalize_label(&u.value);
    if value.is_empty() {
        return None;
    }
    let mut m = Map::new();
    m.insert("value".to_string(), Value::String(value));
    insert_if_present(&mut m, "type", opt_label(&u.r#type));
    insert_if_present(&mut m, "username", opt_label(&u.username));
    Some(m)
}

fn sort_key_address(m: &Map<String, Value>) -> String {
    let street = m.get("street").and_then(Value::as_str).unwrap_or("");
    let city = m.get("city").and_then(Value::as_str).unwrap_or("");
    format!("{street}|{city}")
}

fn str_field(m: &Map<String, Value>, key: &str) -> String {
    m.get(key).and_then(Value::as_str).unwrap_or("").to_string()
}

/// Builds the canonical `serde_json::Value` for a [`ContactData`], applying
/// every normalization/filter/sort rule in §4.A. Exposed so callers (e.g.
/// the engine's merge logic) can compare canonical forms without
/// re-hashing.
pub fn canonicalize_contact_data(data: &ContactData) -> Value {
    let mut root = Map::new();

    if let Some(name) = &data.name {
        let mut nm = Map::new();
        insert_if_present(&mut nm, "prefix", opt_label(&name.prefix));
        insert_if_present(&mut nm, "givenName", opt_label(&name.given_name));
        insert_if_present(&mut nm, "middleName", opt_label(&name.middle_name));
        insert_if_present(&mut nm, "familyName", opt_label(&name.family_name));
        insert_if_present(&mut nm, "suffix", opt_label(&name.suffix));
        if !nm.is_empty() {
            root.insert("name".to_string(), Value::Object(nm));
        }
    }

    let mut emails: Vec<Map<String, Value>> = data.emails.iter().filter_map(normalize_email).collect();
    emails.sort_by(|a, b| str_field(a, "value").cmp(&str_field(b, "value")));
    if !emails.is_empty() {
        root.insert(
            "emails".to_string(),
            Value::Array(emails.into_iter().map(Value::Object).collect()),
        );
    }

    let mut phones: Vec<Map<String, Value>> = data
        .phone_numbers
        .iter()
        .filter_map(normalize_phone_entry)
        .collect();
    phones.sort_by(|a, b| str_field(a, "value").cmp(&str_field(b, "value")));
    if !phones.is_empty() {
        root.insert(
            "phoneNumbers".to_string(),
            Value::Array(phones.into_iter().map(Value::Object).collect()),
        );
    }

    let mut orgs: Vec<Map<String, Value>> = data
        .organizations
        .iter()
        .filter_map(normalize_organization)
        .collect();
    orgs.sort_by(|a, b| str_field(a, "name").cmp(&str_field(b, "name")));
    if !orgs.is_empty() {
        root.insert(
            "organizations".to_string(),
            Value::Array(orgs.into_iter().map(Value::Object).collect()),
        );
    }

    let mut addrs: Vec<Map<String, Value>> =
        data.addresses.iter().filter_map(normalize_address).collect();
    addrs.sort_by(|a, b| sort_key_address(a).cmp(&sort_key_address(b)));
    if !addrs.is_empty() {
        root.insert(
            "addresses".to_string(),
            Value::Array(addrs.into_iter().map(Value::Object).collect()),
        );
    }

    let mut urls: Vec<Map<String, Value>> = data.urls.iter().filter_map(normalize_url).collect();
    urls.sort_by(|a, b| str_field(a, "value").cmp(&str_field(b, "value")));
    if !urls.is_empty() {
        root.insert(
            "urls".to_string(),
            Value::Array(urls.into_iter().map(Value::Object).collect()),
        );
    }

    if !data.im_handles.is_empty() {
        let mut handles: Vec<Map<String, Value>> = data
            .im_handles
            .iter()
            .filter_map(|h| {
                let value = normalize_label(&h.value);
                if value.is_empty() {
                    return None;
                }
                let mut m = Map::new();
                m.insert("value".to_string(), Value::String(value));
                insert_if_present(&mut m, "type", opt_label(&h.r#type));
                Some(m)
            })
            .collect();
        handles.sort_by(|a, b| str_field(a, "value").cmp(&str_field(b, "value")));
        if !handles.is_empty() {
            root.insert(
                "imHandles".to_string(),
                Value::Array(handles.into_iter().map(Value::Object).collect()),
            );
        }
    }

    if !data.related_people.is_empty() {
        let mut people: Vec<Map<String, Value>> = data
            .related_people
            .iter()
            .filter_map(|p| {
                let name = normalize_label(&p.name);
                if name.is_empty() {
                    return None;
                }
                let mut m = Map::new();
                m.insert("name".to_string(), Value::String(name));
                insert_if_present(&mut m, "type", opt_label(&p.r#type));
                Some(m)
            })
            .collect();
        people.sort_by(|a, b| str_field(a, "name").cmp(&str_field(b, "name")));
        if !people.is_empty() {
            root.insert(
                "relatedPeople".to_string(),
                Value::Array(people.into_iter().map(Value::Object).collect()),
            );
        }
    }

    if !data.events.is_empty() {
        let mut events: Vec<Map<String, Value>> = data
            .events
            .iter()
            .filter_map(|e| {
                let date = normalize_label(&e.date);
                if date.is_empty() {
                    return None;
                }
                let mut m = Map::new();
                m.insert("date".to_string(), Value::String(date));
                insert_if_present(&mut m, "type", opt_label(&e.r#type));
                Some(m)
            })
            .collect();
        events.sort_by(|a, b| str_field(a, "date").cmp(&str_field(b, "date")));
        if !events.is_empty() {
            root.insert(
                "events".to_string(),
                Value::Array(events.into_iter().map(Value::Object).collect()),
            );
        }
    }

    if let Some(bday) = &data.birthday {
        let mut bm = Map::new();
        if let Some(y) = bday.year {
            bm.insert("year".to_string(), Value::from(y));
        }
        if let Some(m) = bday.month {
            bm.insert("month".to_string(), Value::from(m));
        }
        if let Some(d) = bday.day {
            bm.insert("day".to_string(), Value::from(d));
        }
        if !bm.is_empty() {
            root.insert("birthday".to_string(), Value::Object(bm));
        }
    }

    if let Some(notes) = &data.notes {
        let n = normalize_notes(notes);
        if !n.is_empty() {
            root.insert("notes".to_string(), Value::String(n));
        }
    }

    if !data.items.is_empty() {
        root.insert("items".to_string(), Value::Array(data.items.clone()));
    }

    Value::Object(root)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)
}

/// `H(contact_data) -> 256-bit hex`.
pub fn hash_contact(data: &ContactData) -> String {
    let canonical = canonicalize_contact_data(data);
    let serialized = serde_json::to_string(&canonical).expect("canonical value always serializes");
    sha256_hex(serialized.as_bytes())
}

/// `H_row(row) -> hex`: sorts keys ascending, trims values, drops empties.
pub fn hash_row(row: &BTreeMap<String, String>) -> String {
    let mut canonical: BTreeMap<String, String> = BTreeMap::new();
    for (k, v) in row {
        let trimmed = v.trim();
        if !trimmed.is_empty() {
            canonical.insert(k.clone(), trimmed.to_string());
        }
    }
    let serialized = serde_json::to_string(&canonical).expect("canonical map always serializes");
    sha256_hex(serialized.as_bytes())
}
