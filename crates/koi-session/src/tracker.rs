// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use similar::TextDiff;
use tracing::{debug, info};

use crate::{Result, SessionError};

/// One changeset in the linear session history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCommit {
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_hash: Option<String>,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
    pub changed_files: Vec<String>,
}

/// Per-file record inside a commit snapshot.  `pre`/`post` are blob ids in
/// the object store; `None` means the file did not exist on that side.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileChange {
    path: String,
    pre: Option<String>,
    post: Option<String>,
}

#[derive(Default)]
struct TrackerState {
    /// Absolute path → first pre-image seen this turn (`None` = file was
    /// absent).  Later writes to the same path keep the first pre-image.
    staged: BTreeMap<PathBuf, Option<String>>,
    commits: Vec<SessionCommit>,
}

/// Records every file mutation made during the session and flushes them as
/// one atomic changeset when control returns to the user.  History is
/// linear; any prior changeset can be checked out again.
pub struct SessionTracker {
    root: PathBuf,
    state: Mutex<TrackerState>,
}

impl SessionTracker {
    /// Open the tracker rooted at `session_dir` (created if missing) and
    /// load any existing commit history.
    pub fn open(session_dir: impl Into<PathBuf>) -> Result<Self> {
        let root = session_dir.into();
        std::fs::create_dir_all(root.join("objects"))?;
        std::fs::create_dir_all(root.join("snapshots"))?;
        let commits = match std::fs::read_to_string(root.join("commits.json")) {
            Ok(text) if !text.trim().is_empty() => serde_json::from_str(&text)?,
            _ => Vec::new(),
        };
        debug!(root = %root.display(), commits = commits.len(), "session tracker opened");
        Ok(Self {
            root,
            state: Mutex::new(TrackerState {
                staged: BTreeMap::new(),
                commits,
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ── Staging ───────────────────────────────────────────────────────────────

    /// Stage the pre-image of `path` before a write or edit touches it.
    /// `old_content` is `None` when the file does not exist yet.  Only the
    /// first pre-image per path per turn is kept.
    pub fn track_file(&self, path: impl AsRef<Path>, old_content: Option<String>) {
        let path = path.as_ref().to_path_buf();
        let mut state = self.state.lock().unwrap();
        state.staged.entry(path).or_insert(old_content);
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.state.lock().unwrap().staged.is_empty()
    }

    pub fn pending_files(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().staged.keys().cloned().collect()
    }

    // ── Commit ────────────────────────────────────────────────────────────────

    /// Flush all staged files as one changeset.  The post-image of each file
    /// is whatever is on disk at commit time.
    pub fn commit_changes(&self, summary: &str) -> Result<SessionCommit> {
        let mut state = self.state.lock().unwrap();
        if state.staged.is_empty() {
            return Err(SessionError::NothingStaged);
        }

        let parent_hash = state.commits.last().map(|c| c.hash.clone());
        let timestamp = Utc::now();

        let mut changes = Vec::with_capacity(state.staged.len());
        for (path, pre_content) in std::mem::take(&mut state.staged) {
            let pre = match pre_content {
                Some(text) => Some(self.write_blob(&text)?),
                None => None,
            };
            let post = match std::fs::read_to_string(&path) {
                Ok(text) => Some(self.write_blob(&text)?),
                Err(_) => None,
            };
            changes.push(FileChange {
                path: path.to_string_lossy().into_owned(),
                pre,
                post,
            });
        }

        let mut hasher = Sha256::new();
        hasher.update(parent_hash.as_deref().unwrap_or("root"));
        hasher.update(summary.as_bytes());
        hasher.update(timestamp.to_rfc3339().as_bytes());
        hasher.update(state.commits.len().to_le_bytes());
        for change in &changes {
            hasher.update(change.path.as_bytes());
            hasher.update(change.post.as_deref().unwrap_or("absent").as_bytes());
        }
        let hash = hex::encode(hasher.finalize())[..12].to_string();

        let commit = SessionCommit {
            hash: hash.clone(),
            parent_hash,
            summary: summary.to_string(),
            timestamp,
            changed_files: changes.iter().map(|c| c.path.clone()).collect(),
        };

        let manifest = serde_json::to_string_pretty(&changes)?;
        std::fs::write(self.root.join("snapshots").join(format!("{hash}.json")), manifest)?;

        state.commits.push(commit.clone());
        let history = serde_json::to_string_pretty(&state.commits)?;
        std::fs::write(self.root.join("commits.json"), history)?;

        info!(%hash, files = commit.changed_files.len(), "session commit recorded");
        Ok(commit)
    }

    // ── Inspection ────────────────────────────────────────────────────────────

    pub fn head(&self) -> Option<SessionCommit> {
        self.state.lock().unwrap().commits.last().cloned()
    }

    pub fn history(&self) -> Vec<SessionCommit> {
        self.state.lock().unwrap().commits.clone()
    }

    /// Unified diff of everything a commit changed.
    pub fn commit_diff(&self, hash: &str) -> Result<String> {
        self.find_commit(hash)?;
        let changes = self.load_manifest(hash)?;
        let mut out = String::new();
        for change in &changes {
            let pre = self.read_blob_opt(change.pre.as_deref())?;
            let post = self.read_blob_opt(change.post.as_deref())?;
            let diff = TextDiff::from_lines(&pre, &post);
            out.push_str(
                &diff
                    .unified_diff()
                    .header(&format!("a/{}", change.path), &format!("b/{}", change.path))
                    .to_string(),
            );
        }
        Ok(out)
    }

    /// Diff of a single pending file: staged pre-image against the current
    /// disk content.  `reverse` swaps the direction (what a revert would do).
    pub fn file_diff(&self, path: impl AsRef<Path>, reverse: bool) -> Result<String> {
        let path = path.as_ref();
        let pre = self
            .state
            .lock()
            .unwrap()
            .staged
            .get(path)
            .cloned()
            .flatten()
            .unwrap_or_default();
        let post = std::fs::read_to_string(path).unwrap_or_default();
        let (old, new) = if reverse { (post, pre) } else { (pre, post) };
        let diff = TextDiff::from_lines(&old, &new);
        let name = path.to_string_lossy();
        Ok(diff
            .unified_diff()
            .header(&format!("a/{name}"), &format!("b/{name}"))
            .to_string())
    }

    // ── Checkout ──────────────────────────────────────────────────────────────

    /// Restore the working tree to its state as of `hash`.
    ///
    /// For every file the session ever touched: the last snapshot at or
    /// before the target commit wins; files first touched after the target
    /// revert to their earliest pre-image (including removal when they did
    /// not exist).
    pub fn checkout_commit(&self, hash: &str) -> Result<SessionCommit> {
        let (target_index, target) = self.find_commit(hash)?;
        let commits = self.history();

        // path → (commit index, change record), collected over all commits.
        let mut per_file: BTreeMap<String, Vec<(usize, FileChange)>> = BTreeMap::new();
        for (index, commit) in commits.iter().enumerate() {
            for change in self.load_manifest(&commit.hash)? {
                per_file.entry(change.path.clone()).or_default().push((index, change));
            }
        }

        let mut restored = 0usize;
        for (path, changes) in per_file {
            let at_or_before = changes.iter().rev().find(|(i, _)| *i <= target_index);
            let desired = match at_or_before {
                Some((_, change)) => change.post.clone(),
                // Only touched after the target: its first pre-image is the
                // state the target saw.
                None => changes[0].1.pre.clone(),
            };
            self.restore_file(Path::new(&path), desired.as_deref())?;
            restored += 1;
        }

        info!(%hash, restored, "checked out session commit");
        Ok(target)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn find_commit(&self, hash: &str) -> Result<(usize, SessionCommit)> {
        self.state
            .lock()
            .unwrap()
            .commits
            .iter()
            .enumerate()
            .find(|(_, c)| c.hash == hash)
            .map(|(i, c)| (i, c.clone()))
            .ok_or_else(|| SessionError::UnknownCommit(hash.to_string()))
    }

    fn load_manifest(&self, hash: &str) -> Result<Vec<FileChange>> {
        let path = self.root.join("snapshots").join(format!("{hash}.json"));
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Content-addressed blob write; returns the blob id.
    fn write_blob(&self, content: &str) -> Result<String> {
        let id = hex::encode(Sha256::digest(content.as_bytes()));
        let path = self.root.join("objects").join(&id);
        if !path.exists() {
            std::fs::write(path, content)?;
        }
        Ok(id)
    }

    fn read_blob(&self, id: &str) -> Result<String> {
        Ok(std::fs::read_to_string(self.root.join("objects").join(id))?)
    }

    fn read_blob_opt(&self, id: Option<&str>) -> Result<String> {
        match id {
            Some(id) => self.read_blob(id),
            None => Ok(String::new()),
        }
    }

    fn restore_file(&self, path: &Path, blob: Option<&str>) -> Result<()> {
        match blob {
            Some(id) => {
                let content = self.read_blob(id)?;
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                std::fs::write(path, content)?;
            }
            None => {
                // The file did not exist in the target state.
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
            }
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
