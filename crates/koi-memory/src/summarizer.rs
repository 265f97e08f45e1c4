// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

/// Produces the compressed content variants written at promotion time.
///
/// Implementations must always return usable text: the memory invariants
/// require a non-empty tier-appropriate variant, so an implementation backed
/// by a model call is expected to fall back to deterministic truncation when
/// the call fails.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// One-paragraph compressed rewrite (short-term → medium-term).
    async fn compress_paragraph(&self, text: &str) -> String;
    /// One-sentence gist (medium-term → long-term).
    async fn compress_sentence(&self, text: &str) -> String;
}

/// Deterministic fallback summarizer: clips at a word boundary.  Used
/// directly by tests and as the failure fallback of model-backed
/// implementations.
#[derive(Default)]
pub struct TruncatingSummarizer;

#[async_trait]
impl Summarizer for TruncatingSummarizer {
    async fn compress_paragraph(&self, text: &str) -> String {
        truncate_to_sentence(text, 400)
    }

    async fn compress_sentence(&self, text: &str) -> String {
        truncate_to_sentence(text, 120)
    }
}

/// Clip `text` to at most `max_chars`, preferring a word boundary, with an
/// ellipsis marker when content was dropped.  Always returns non-empty
/// output for non-empty input.
pub(crate) fn truncate_to_sentence(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "(empty)".to_string();
    }
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let clipped: String = trimmed.chars().take(max_chars).collect();
    let cut = clipped.rfind(char::is_whitespace).unwrap_or(clipped.len());
    let mut out = clipped[..cut].trim_end().to_string();
    if out.is_empty() {
        out = clipped;
    }
    out.push('…');
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
