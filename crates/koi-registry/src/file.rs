// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::{matches_document, Registry, RegistryStats, Result, SearchHit};

/// Interval for the background flush of unsaved mutations.
const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(5);

/// JSON-file backend: the full map lives in memory, every mutation persists
/// immediately, and an optional background task flushes again on a 5-second
/// timer in case an immediate write failed.
pub struct FileRegistry {
    path: PathBuf,
    state: Mutex<BTreeMap<String, Value>>,
    dirty: AtomicBool,
}

impl FileRegistry {
    /// Open (or create) the store at `path`.  A missing or empty file yields
    /// an empty map; a corrupt file is treated as empty with a warning so a
    /// damaged store never takes the runtime down.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => match serde_json::from_str(&text) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "registry file corrupt, starting empty");
                    BTreeMap::new()
                }
            },
            _ => BTreeMap::new(),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
            dirty: AtomicBool::new(false),
        })
    }

    /// Spawn the periodic flush task.  A no-op outside a tokio runtime
    /// (mutations still persist immediately; only the retry flush is lost).
    pub fn spawn_autosave(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(self);
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(AUTOSAVE_INTERVAL);
            loop {
                ticker.tick().await;
                if store.dirty.swap(false, Ordering::SeqCst) {
                    if let Err(e) = store.persist() {
                        warn!(error = %e, "registry autosave failed");
                        store.dirty.store(true, Ordering::SeqCst);
                    }
                }
            }
        });
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let text = serde_json::to_string_pretty(&*state)?;
        std::fs::write(&self.path, text)?;
        debug!(path = %self.path.display(), entries = state.len(), "registry persisted");
        Ok(())
    }

    fn persist_or_mark_dirty(&self) {
        if self.persist().is_err() {
            self.dirty.store(true, Ordering::SeqCst);
        }
    }
}

impl Registry for FileRegistry {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.state.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.state.lock().unwrap().insert(key.to_string(), value);
        self.persist_or_mark_dirty();
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.state.lock().unwrap().remove(key).is_some();
        if removed {
            self.persist_or_mark_dirty();
        }
        Ok(removed)
    }

    fn has(&self, key: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().contains_key(key))
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn search(&self, query: &Value) -> Result<Vec<SearchHit>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, v)| matches_document(v, query))
            .map(|(k, v)| SearchHit {
                key: k.clone(),
                value: v.clone(),
            })
            .collect())
    }

    fn clear(&self) -> Result<()> {
        self.state.lock().unwrap().clear();
        self.persist_or_mark_dirty();
        Ok(())
    }

    fn stats(&self) -> Result<RegistryStats> {
        Ok(RegistryStats {
            backend: "file",
            entries: self.state.lock().unwrap().len(),
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn open_temp() -> (tempfile::TempDir, FileRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let reg = FileRegistry::open(dir.path().join("registry.json")).unwrap();
        (dir, reg)
    }

    #[test]
    fn get_missing_returns_none() {
        let (_d, reg) = open_temp();
        assert_eq!(reg.get("nope").unwrap(), None);
    }

    #[test]
    fn set_then_get_round_trips() {
        let (_d, reg) = open_temp();
        reg.set("a", json!({"x": 1})).unwrap();
        assert_eq!(reg.get("a").unwrap(), Some(json!({"x": 1})));
    }

    #[test]
    fn set_is_last_writer_wins() {
        let (_d, reg) = open_temp();
        reg.set("a", json!(1)).unwrap();
        reg.set("a", json!(2)).unwrap();
        assert_eq!(reg.get("a").unwrap(), Some(json!(2)));
    }

    #[test]
    fn delete_removes_and_reports() {
        let (_d, reg) = open_temp();
        reg.set("a", json!(1)).unwrap();
        assert!(reg.delete("a").unwrap());
        assert!(!reg.delete("a").unwrap());
        assert!(!reg.has("a").unwrap());
    }

    #[test]
    fn keys_filters_by_prefix_and_sorts() {
        let (_d, reg) = open_temp();
        reg.set("user:b", json!(1)).unwrap();
        reg.set("user:a", json!(1)).unwrap();
        reg.set("task:x", json!(1)).unwrap();
        assert_eq!(reg.keys("user:").unwrap(), vec!["user:a", "user:b"]);
        assert_eq!(reg.keys("").unwrap().len(), 3);
    }

    #[test]
    fn search_returns_key_value_pairs() {
        let (_d, reg) = open_temp();
        reg.set("p1", json!({"kind": "agent", "age": 2})).unwrap();
        reg.set("p2", json!({"kind": "tool"})).unwrap();
        let hits = reg.search(&json!({"kind": "agent"})).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "p1");
        assert_eq!(hits[0].value["age"], json!(2));
    }

    #[test]
    fn mutations_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        {
            let reg = FileRegistry::open(&path).unwrap();
            reg.set("persisted", json!("yes")).unwrap();
        }
        let reg = FileRegistry::open(&path).unwrap();
        assert_eq!(reg.get("persisted").unwrap(), Some(json!("yes")));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, "{not json").unwrap();
        let reg = FileRegistry::open(&path).unwrap();
        assert_eq!(reg.stats().unwrap().entries, 0);
    }

    #[test]
    fn clear_empties_store() {
        let (_d, reg) = open_temp();
        reg.set("a", json!(1)).unwrap();
        reg.clear().unwrap();
        assert_eq!(reg.stats().unwrap().entries, 0);
        assert_eq!(reg.get("a").unwrap(), None);
    }

    #[test]
    fn stats_reports_backend_name() {
        let (_d, reg) = open_temp();
        assert_eq!(reg.stats().unwrap().backend, "file");
    }
}
