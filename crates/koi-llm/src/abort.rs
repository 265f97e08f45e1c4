// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Process-wide cancellation signal, set by the UI on Ctrl-C and checked at
/// the top of every loop iteration.  Cloning is cheap; all clones observe the
/// same flag.
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

#[derive(Default)]
struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal.  Wakes every task parked in [`cancelled`].
    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Clear the flag so the next user turn starts fresh.
    pub fn reset(&self) {
        self.inner.aborted.store(false, Ordering::SeqCst);
    }

    /// Resolve when the signal is raised.  Intended for use in `select!`
    /// against a long-running I/O future.
    pub async fn cancelled(&self) {
        if self.is_aborted() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_aborted() {
            return;
        }
        notified.await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
