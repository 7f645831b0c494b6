//! Environment configuration (spec §6, §9 "Global state for env flags").
//!
//! `READONLY_MODE` and `CONTACTS_JSON_FILE` must be read once at
//! construction and carried on a config struct — never re-read inside a
//! hot path. [`EnvConfig::from_env`] is the single place that touches
//! `std::env`; everything downstream takes the resulting struct.

use std::time::Duration;

const DEFAULT_STORE_PATH: &str = "./data/contacts.db";
const DEFAULT_OAUTH_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub readonly_mode: bool,
    pub contacts_json_file: Option<String>,
    pub store_path: String,
    pub oauth_timeout: Duration,
}

impl EnvConfig {
    /// Reads the four recognized environment variables exactly once
    /// (spec §6): `READONLY_MODE`, `CONTACTS_JSON_FILE`, a store-path
    /// override, and an OAuth timeout override (default 300s).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Testable version of [`from_env`](Self::from_env) that takes an
    /// injected lookup function instead of touching real process
    /// environment variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let readonly_mode = lookup("READONLY_MODE").map(|v| is_truthy(&v)).unwrap_or(false);
        let contacts_json_file = lookup("CONTACTS_JSON_FILE");
        let store_path = lookup("CONTACTS_STORE_PATH").unwrap_or_else(|| DEFAULT_STORE_PATH.to_string());
        let oauth_timeout = lookup("OAUTH_TIMEOUT_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(DEFAULT_OAUTH_TIMEOUT_SECS));

        EnvConfig {
            readonly_mode,
            contacts_json_file,
            store_path,
            oauth_timeout,
        }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        EnvConfig {
            readonly_mode: false,
            contacts_json_file: None,
            store_path: DEFAULT_STORE_PATH.to_string(),
            oauth_timeout: Duration::from_secs(DEFAULT_OAUTH_TIMEOUT_SECS),
        }
    }
}

fn is_truthy(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: HashMap<&'static str, &'static str>) -> impl Fn(&str) -> Option<String> {
        move |key| vars.get(key).map(|v| v.to_string())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = EnvConfig::from_lookup(lookup_from(HashMap::new()));
        assert_eq!(cfg, EnvConfig::default());
    }

    #[test]
    fn readonly_mode_parses_common_truthy_spellings() {
        for v in ["1", "true", "TRUE", "yes", "on"] {
            let vars = HashMap::from([("READONLY_MODE", v)]);
            let cfg = EnvConfig::from_lookup(lookup_from(vars));
            assert!(cfg.readonly_mode, "{v} should be truthy");
        }
        let vars = HashMap::from([("READONLY_MODE", "0")]);
        assert!(!EnvConfig::from_lookup(lookup_from(vars)).readonly_mode);
    }

    #[test]
    fn overrides_are_read_once_into_the_struct() {
        let vars = HashMap::from([
            ("CONTACTS_JSON_FILE", "fixtures/contacts.json"),
            ("CONTACTS_STORE_PATH", "/tmp/custom.db"),
            ("OAUTH_TIMEOUT_SECS", "120"),
        ]);
        let cfg = EnvConfig::from_lookup(lookup_from(vars));
        assert_eq!(cfg.contacts_json_file.as_deref(), Some("fixtures/contacts.json"));
        assert_eq!(cfg.store_path, "/tmp/custom.db");
        assert_eq!(cfg.oauth_timeout, Duration::from_secs(120));
    }
}
