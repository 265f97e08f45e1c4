// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Session-scoped durability: per-directory file permissions, the change
//! tracker that groups file mutations into atomic commits, and the JSON
//! stores that carry agent conversation state, line-editor history, and the
//! structured dialogue log across CLI turns.

mod permissions;
mod store;
mod tracker;

pub use permissions::{AccessLevel, FilePermissions};
pub use store::SessionStore;
pub use tracker::{SessionCommit, SessionTracker};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unknown commit: {0}")]
    UnknownCommit(String),
    #[error("nothing staged to commit")]
    NothingStaged,
}

pub type Result<T> = std::result::Result<T, SessionError>;
