// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use serde_json::Value;
use tracing::debug;

use crate::{matches_document, Registry, RegistryStats, Result, SearchHit};

/// Embedded-SQLite backend.  Values are stored as JSON text in a single
/// `kv` table; `keys(prefix)` is served from an in-memory key cache so the
/// hot path (prefix scans by the action executors) never touches the
/// database.  The cache is populated on open and on every `set`, pruned on
/// `delete`.
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
    key_cache: Mutex<BTreeSet<String>>,
}

impl SqliteRegistry {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests and the ephemeral scratch registry.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )?;
        let mut cache = BTreeSet::new();
        {
            let mut stmt = conn.prepare("SELECT key FROM kv")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for key in rows {
                cache.insert(key?);
            }
        }
        debug!(entries = cache.len(), "sqlite registry opened");
        Ok(Self {
            conn: Mutex::new(conn),
            key_cache: Mutex::new(cache),
        })
    }
}

impl Registry for SqliteRegistry {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => {
                let text: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&text)?))
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let text = serde_json::to_string(&value)?;
        self.conn.lock().unwrap().execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, &text],
        )?;
        self.key_cache.lock().unwrap().insert(key.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let changed = self
            .conn
            .lock()
            .unwrap()
            .execute("DELETE FROM kv WHERE key = ?1", [key])?;
        self.key_cache.lock().unwrap().remove(key);
        Ok(changed > 0)
    }

    fn has(&self, key: &str) -> Result<bool> {
        Ok(self.key_cache.lock().unwrap().contains(key))
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .key_cache
            .lock()
            .unwrap()
            .iter()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn search(&self, query: &Value) -> Result<Vec<SearchHit>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT key, value FROM kv ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut hits = Vec::new();
        for row in rows {
            let (key, text) = row?;
            let value: Value = serde_json::from_str(&text)?;
            if matches_document(&value, query) {
                hits.push(SearchHit { key, value });
            }
        }
        Ok(hits)
    }

    fn clear(&self) -> Result<()> {
        self.conn.lock().unwrap().execute("DELETE FROM kv", [])?;
        self.key_cache.lock().unwrap().clear();
        Ok(())
    }

    fn stats(&self) -> Result<RegistryStats> {
        Ok(RegistryStats {
            backend: "sqlite",
            entries: self.key_cache.lock().unwrap().len(),
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
