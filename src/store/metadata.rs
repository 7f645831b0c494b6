use rusqlite::{params, OptionalExtension};

use super::Store;
use crate::error::CoreResult;
use crate::model::SyncConfig;

const SYNC_CONFIG_KEY: &str = "sync_config";

impl Store {
    /// Reads `metadata.sync_config`, falling back to defaults if absent
    /// (spec §4.F).
    pub fn get_sync_config(&self) -> CoreResult<SyncConfig> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![SYNC_CONFIG_KEY],
                |r| r.get(0),
            )
            .optional()?;
        Ok(match raw {
            Some(json) => serde_json::from_str(&json).unwrap_or_default(),
            None => SyncConfig::default(),
        })
    }

    /// Persists `config` atomically via upsert.
    pub fn set_sync_config(&mut self, config: &SyncConfig) -> CoreResult<()> {
        let json = serde_json::to_string(config)?;
        self.conn().execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![SYNC_CONFIG_KEY, json],
        )?;
        Ok(())
    }

    pub fn get_metadata(&self, key: &str) -> CoreResult<Option<String>> {
        self.conn()
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()
            .map_err(crate::error::CoreError::from)
    }

    pub fn set_metadata(&mut self, key: &str, value: &str) -> CoreResult<()> {
        self.conn().execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}
