// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Tiered context memory: the conversation transcript with bounded token
//! cost.  Entries move short-term → medium-term → long-term → latent as
//! newer turns arrive, carrying progressively more compressed renditions of
//! the same content.  Only the one-sentence gist survives into the latent
//! pool.

mod summarizer;

use serde::{Deserialize, Serialize};
use tracing::debug;

use koi_llm::{Message, Role};

pub use summarizer::{Summarizer, TruncatingSummarizer};

/// Snapshot format version; bumped on incompatible layout changes.
pub const STATE_VERSION: u32 = 1;

/// Where an entry currently lives.  Promotion is monotonic: an entry only
/// ever moves rightwards through short → medium → long; latent entries
/// leave the ordered list entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    ShortTerm,
    MediumTerm,
    LongTerm,
}

/// Promotion windows, counted in entries from the newest backwards.
#[derive(Debug, Clone, Copy)]
pub struct MemoryWindows {
    /// Entries younger than this stay short-term (verbatim).
    pub short_term: usize,
    /// Width of the medium-term band after the short window.
    pub medium_term: usize,
    /// Total ordered entries retained; older long-term entries spill into
    /// the latent pool.
    pub total: usize,
}

impl Default for MemoryWindows {
    fn default() -> Self {
        Self {
            short_term: 6,
            medium_term: 20,
            total: 40,
        }
    }
}

impl MemoryWindows {
    pub fn new(short_term: usize, medium_term: usize, total: usize) -> Self {
        Self {
            short_term,
            medium_term,
            total,
        }
    }

    fn long_term_boundary(&self) -> usize {
        self.short_term + self.medium_term
    }
}

/// One turn of the conversation with its three content variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Monotonically increasing creation index.
    pub index: u64,
    pub tier: Tier,
    pub role: Role,
    /// Verbatim content.  Always present while the entry is short-term.
    pub immediate: String,
    /// One-paragraph compressed rewrite; filled on promotion to medium-term.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_term: Option<String>,
    /// One-sentence gist; filled on promotion to long-term.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permanent: Option<String>,
    /// Times this entry was rendered into a transcript.
    #[serde(default)]
    pub accessed: u64,
}

impl ContextEntry {
    /// The content variant appropriate for the entry's current tier.
    pub fn tier_content(&self) -> &str {
        match self.tier {
            Tier::ShortTerm => &self.immediate,
            Tier::MediumTerm => self.short_term.as_deref().unwrap_or(&self.immediate),
            Tier::LongTerm => self
                .permanent
                .as_deref()
                .or(self.short_term.as_deref())
                .unwrap_or(&self.immediate),
        }
    }
}

/// A demoted entry: only the gist is retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatentEntry {
    pub index: u64,
    pub role: Role,
    pub permanent: String,
    #[serde(default)]
    pub accessed: u64,
}

/// Serialisable memory state, the unit handed to the session store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemoryState {
    entries: Vec<ContextEntry>,
    latent_pool: Vec<LatentEntry>,
    next_index: u64,
    version: u32,
}

/// The tiered transcript.  Entries are never reordered; demotion never
/// resurrects dropped content; the same entry is never simultaneously in
/// the ordered list and the latent pool.
pub struct ContextMemory {
    windows: MemoryWindows,
    state: MemoryState,
}

impl ContextMemory {
    pub fn new(windows: MemoryWindows) -> Self {
        Self {
            windows,
            state: MemoryState {
                version: STATE_VERSION,
                ..Default::default()
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.entries.is_empty() && self.state.latent_pool.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.entries.len()
    }

    pub fn latent_len(&self) -> usize {
        self.state.latent_pool.len()
    }

    pub fn entries(&self) -> &[ContextEntry] {
        &self.state.entries
    }

    pub fn latent_pool(&self) -> &[LatentEntry] {
        &self.state.latent_pool
    }

    pub fn count_in_tier(&self, tier: Tier) -> usize {
        self.state.entries.iter().filter(|e| e.tier == tier).count()
    }

    /// Append a new turn.  New entries always start short-term with the
    /// verbatim content.
    pub fn push(&mut self, role: Role, content: impl Into<String>) -> u64 {
        let index = self.state.next_index;
        self.state.next_index += 1;
        self.state.entries.push(ContextEntry {
            index,
            tier: Tier::ShortTerm,
            role,
            immediate: content.into(),
            short_term: None,
            permanent: None,
            accessed: 0,
        });
        index
    }

    /// Apply the promotion policy once.  Called by the loop after every
    /// recorded action.
    ///
    /// Age is the number of entries newer than the one considered.  The
    /// boundaries are: short window → medium; short+medium window → long;
    /// total retention cap → latent pool.
    pub async fn tick(&mut self, summarizer: &dyn Summarizer) {
        let total = self.state.entries.len();
        let long_boundary = self.windows.long_term_boundary();

        for position in 0..total {
            let age = total - 1 - position;
            let tier = self.state.entries[position].tier;
            match tier {
                Tier::ShortTerm if age >= self.windows.short_term => {
                    let entry = &self.state.entries[position];
                    let summary = match entry.short_term.clone() {
                        Some(existing) => existing,
                        None => summarizer.compress_paragraph(&entry.immediate).await,
                    };
                    let entry = &mut self.state.entries[position];
                    entry.short_term = Some(summary);
                    entry.tier = Tier::MediumTerm;
                    debug!(index = entry.index, "promoted to medium-term");
                }
                Tier::MediumTerm if age >= long_boundary => {
                    let entry = &self.state.entries[position];
                    let source = entry.short_term.as_deref().unwrap_or(&entry.immediate);
                    let summary = match entry.permanent.clone() {
                        Some(existing) => existing,
                        None => summarizer.compress_sentence(source).await,
                    };
                    let entry = &mut self.state.entries[position];
                    entry.permanent = Some(summary);
                    entry.tier = Tier::LongTerm;
                    debug!(index = entry.index, "promoted to long-term");
                }
                _ => {}
            }
        }

        // Spill the oldest long-term entries once the ordered list exceeds
        // the retention cap.  Only the gist survives.
        while self.state.entries.len() > self.windows.total {
            if self.state.entries[0].tier != Tier::LongTerm {
                // The head has not reached long-term yet; never skip the
                // promotion path.
                break;
            }
            let entry = self.state.entries.remove(0);
            let permanent = entry
                .permanent
                .unwrap_or_else(|| summarizer_fallback(&entry.immediate));
            debug!(index = entry.index, "demoted to latent pool");
            self.state.latent_pool.push(LatentEntry {
                index: entry.index,
                role: entry.role,
                permanent,
                accessed: entry.accessed,
            });
        }
    }

    /// Render the transcript for the model: system prompt, every retained
    /// entry at its tier-appropriate compression, then a closing block
    /// summarising the latent pool.  Bumps access counters.
    pub fn to_messages(&mut self, system_prompt: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.state.entries.len() + 2);
        messages.push(Message::system(system_prompt));
        for entry in &mut self.state.entries {
            entry.accessed += 1;
            let content = entry.tier_content().to_string();
            messages.push(Message {
                role: entry.role,
                content,
            });
        }
        if !self.state.latent_pool.is_empty() {
            let mut block = String::from("Earlier context (compressed):");
            for latent in &mut self.state.latent_pool {
                latent.accessed += 1;
                block.push_str("\n- ");
                block.push_str(&latent.permanent);
            }
            messages.push(Message::system(block));
        }
        messages
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(&self.state).unwrap_or_default()
    }

    pub fn restore(windows: MemoryWindows, snapshot: serde_json::Value) -> anyhow::Result<Self> {
        let state: MemoryState = serde_json::from_value(snapshot)?;
        anyhow::ensure!(
            state.version == STATE_VERSION,
            "unsupported memory snapshot version {}",
            state.version
        );
        Ok(Self { windows, state })
    }
}

/// Deterministic gist used when an entry reaches the latent pool without a
/// stored summary (e.g. restored from an older snapshot mid-promotion).
fn summarizer_fallback(text: &str) -> String {
    summarizer::truncate_to_sentence(text, 120)
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn windows(short: usize, medium: usize, total: usize) -> MemoryWindows {
        MemoryWindows::new(short, medium, total)
    }

    async fn ticked_memory(n: usize, w: MemoryWindows) -> ContextMemory {
        let mut mem = ContextMemory::new(w);
        let s = TruncatingSummarizer::default();
        for i in 0..n {
            mem.push(Role::User, format!("turn number {i} with some content"));
            mem.tick(&s).await;
        }
        mem
    }

    // ── Basic growth ──────────────────────────────────────────────────────────

    #[test]
    fn new_memory_is_empty() {
        let mem = ContextMemory::new(MemoryWindows::default());
        assert!(mem.is_empty());
    }

    #[test]
    fn push_assigns_increasing_indices() {
        let mut mem = ContextMemory::new(MemoryWindows::default());
        let a = mem.push(Role::User, "one");
        let b = mem.push(Role::Assistant, "two");
        assert!(b > a);
    }

    #[test]
    fn new_entries_start_short_term_with_immediate() {
        let mut mem = ContextMemory::new(MemoryWindows::default());
        mem.push(Role::User, "hello");
        let e = &mem.entries()[0];
        assert_eq!(e.tier, Tier::ShortTerm);
        assert_eq!(e.immediate, "hello");
        assert!(e.short_term.is_none());
    }

    // ── Promotion policy ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn recent_entries_stay_short_term() {
        let mem = ticked_memory(4, windows(6, 20, 40)).await;
        assert_eq!(mem.count_in_tier(Tier::ShortTerm), 4);
    }

    #[tokio::test]
    async fn old_entries_promote_to_medium() {
        let mem = ticked_memory(10, windows(6, 20, 40)).await;
        assert_eq!(mem.count_in_tier(Tier::ShortTerm), 6);
        assert_eq!(mem.count_in_tier(Tier::MediumTerm), 4);
    }

    #[tokio::test]
    async fn medium_entries_carry_short_term_summary() {
        let mem = ticked_memory(10, windows(6, 20, 40)).await;
        for e in mem.entries().iter().filter(|e| e.tier == Tier::MediumTerm) {
            assert!(e.short_term.as_ref().is_some_and(|s| !s.is_empty()));
        }
    }

    #[tokio::test]
    async fn long_entries_carry_permanent_gist() {
        let mem = ticked_memory(30, windows(2, 4, 40)).await;
        assert!(mem.count_in_tier(Tier::LongTerm) > 0);
        for e in mem.entries().iter().filter(|e| e.tier == Tier::LongTerm) {
            assert!(e.permanent.as_ref().is_some_and(|s| !s.is_empty()));
        }
    }

    #[tokio::test]
    async fn fifty_entries_distribute_exactly_across_tiers() {
        // The documented steady state for the default windows: the newest 6
        // verbatim, the next 20 compressed, the next 14 as gists, and the
        // remaining 10 in the latent pool.
        let mem = ticked_memory(50, MemoryWindows::default()).await;
        assert_eq!(mem.count_in_tier(Tier::ShortTerm), 6);
        assert_eq!(mem.count_in_tier(Tier::MediumTerm), 20);
        assert_eq!(mem.count_in_tier(Tier::LongTerm), 14);
        assert_eq!(mem.latent_len(), 10);
        assert_eq!(mem.len() + mem.latent_len(), 50);
    }

    #[tokio::test]
    async fn order_is_preserved_across_promotion() {
        let mem = ticked_memory(50, MemoryWindows::default()).await;
        let indices: Vec<u64> = mem.entries().iter().map(|e| e.index).collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(indices, sorted, "entries must stay in creation order");
        // Latent pool keeps creation order as well, and holds the oldest.
        let latent: Vec<u64> = mem.latent_pool().iter().map(|l| l.index).collect();
        assert_eq!(latent, (0..10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn no_entry_is_in_two_tiers() {
        let mem = ticked_memory(50, MemoryWindows::default()).await;
        let in_list: std::collections::HashSet<u64> =
            mem.entries().iter().map(|e| e.index).collect();
        for latent in mem.latent_pool() {
            assert!(!in_list.contains(&latent.index));
        }
    }

    #[tokio::test]
    async fn latent_entries_keep_only_the_gist() {
        let mem = ticked_memory(50, MemoryWindows::default()).await;
        for latent in mem.latent_pool() {
            assert!(!latent.permanent.is_empty());
        }
    }

    // ── Rendering ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn to_messages_emits_system_then_entries_in_order() {
        let mut mem = ticked_memory(10, windows(6, 20, 40)).await;
        let messages = mem.to_messages("SYSTEM");
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "SYSTEM");
        assert_eq!(messages.len(), 11);
        assert!(messages[1].content.contains("turn number 0"));
    }

    #[tokio::test]
    async fn to_messages_appends_latent_block() {
        let mut mem = ticked_memory(50, MemoryWindows::default()).await;
        let messages = mem.to_messages("SYS");
        let last = messages.last().unwrap();
        assert_eq!(last.role, Role::System);
        assert!(last.content.starts_with("Earlier context"));
        assert_eq!(last.content.lines().count(), 11, "header + 10 latent gists");
    }

    #[tokio::test]
    async fn to_messages_bumps_access_counters() {
        let mut mem = ticked_memory(3, windows(6, 20, 40)).await;
        mem.to_messages("SYS");
        mem.to_messages("SYS");
        assert!(mem.entries().iter().all(|e| e.accessed == 2));
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn snapshot_restore_round_trips() {
        let mut mem = ticked_memory(50, MemoryWindows::default()).await;
        let snapshot = mem.snapshot();
        let mut restored = ContextMemory::restore(MemoryWindows::default(), snapshot).unwrap();
        assert_eq!(restored.len(), mem.len());
        assert_eq!(restored.latent_len(), mem.latent_len());
        assert_eq!(
            restored.to_messages("S").len(),
            mem.to_messages("S").len()
        );
    }

    #[tokio::test]
    async fn restore_continues_index_sequence() {
        let mut mem = ContextMemory::new(MemoryWindows::default());
        mem.push(Role::User, "a");
        mem.push(Role::User, "b");
        let mut restored =
            ContextMemory::restore(MemoryWindows::default(), mem.snapshot()).unwrap();
        let next = restored.push(Role::User, "c");
        assert_eq!(next, 2);
    }

    #[test]
    fn restore_rejects_unknown_version() {
        let bad = serde_json::json!({
            "entries": [], "latent_pool": [], "next_index": 0, "version": 99
        });
        assert!(ContextMemory::restore(MemoryWindows::default(), bad).is_err());
    }
}
