// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Pluggable persistent key/value store with document search.
//!
//! Two backends ship with the runtime: a JSON file held fully in memory
//! ([`FileRegistry`]) and an embedded SQLite database ([`SqliteRegistry`]).
//! Both speak the same [`Registry`] contract; callers pick a backend at
//! startup and hold it behind `Arc<dyn Registry>` for the rest of the
//! process.

mod file;
mod query;
mod sqlite;

use serde_json::Value;

pub use file::FileRegistry;
pub use query::matches_document;
pub use sqlite::SqliteRegistry;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// One search result: the matching key and its stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub backend: &'static str,
    pub entries: usize,
}

/// The store contract.  `get` returns `None` for missing keys; `set` is
/// last-writer-wins; `search` matches a query document against every stored
/// value (see [`matches_document`] for operator semantics).
pub trait Registry: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
    fn delete(&self, key: &str) -> Result<bool>;
    fn has(&self, key: &str) -> Result<bool>;
    /// All keys starting with `prefix`, sorted.
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
    fn search(&self, query: &Value) -> Result<Vec<SearchHit>>;
    fn clear(&self) -> Result<()>;
    fn stats(&self) -> Result<RegistryStats>;
}
