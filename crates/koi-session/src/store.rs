// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::Result;

/// Durable JSON state that survives between CLI turns: per-agent
/// conversation snapshots, the line-editor history, and the append-only
/// structured dialogue log.
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn open(session_dir: impl Into<PathBuf>) -> Result<Self> {
        let root = session_dir.into();
        std::fs::create_dir_all(root.join("conversations"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ── Conversation state ────────────────────────────────────────────────────

    /// Persist an agent's serialised context-memory snapshot.
    pub fn save_conversation(&self, agent_name: &str, state: &Value) -> Result<()> {
        let path = self.conversation_path(agent_name);
        std::fs::write(&path, serde_json::to_string_pretty(state)?)?;
        debug!(agent = agent_name, path = %path.display(), "conversation saved");
        Ok(())
    }

    /// Load a previously saved snapshot.  `None` when the agent has no
    /// saved conversation yet.
    pub fn load_conversation(&self, agent_name: &str) -> Result<Option<Value>> {
        let path = self.conversation_path(agent_name);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn conversation_path(&self, agent_name: &str) -> PathBuf {
        // Agent names come from config; sanitise anyway so a hostile name
        // cannot escape the conversations directory.
        let safe: String = agent_name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join("conversations").join(format!("{safe}.json"))
    }

    // ── Input history ─────────────────────────────────────────────────────────

    pub fn save_input_history(&self, lines: &[String]) -> Result<()> {
        let path = self.root.join("input-history.json");
        std::fs::write(path, serde_json::to_string_pretty(lines)?)?;
        Ok(())
    }

    pub fn load_input_history(&self) -> Result<Vec<String>> {
        let path = self.root.join("input-history.json");
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    // ── Dialogue log ──────────────────────────────────────────────────────────

    /// Append one structured record to `dialogue.jsonl`.  A `ts` field is
    /// added when the record does not carry one.
    pub fn append_dialogue(&self, mut record: Value) -> Result<()> {
        if let Value::Object(map) = &mut record {
            map.entry("ts".to_string())
                .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join("dialogue.jsonl"))?;
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
        Ok(())
    }

    /// Read the dialogue log back, skipping unparseable lines.
    pub fn read_dialogue(&self) -> Result<Vec<Value>> {
        let path = self.root.join("dialogue.jsonl");
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(text
                .lines()
                .filter_map(|l| serde_json::from_str(l).ok())
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
