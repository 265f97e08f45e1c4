// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use koi_actions::is_failure;
use koi_llm::Action;

/// Budgets for one `handle()` invocation.  Mirrors the runtime config so
/// tests can tighten them without a full config.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_consecutive_errors: u32,
    pub max_pivots: u32,
    pub max_action_repeats: u32,
    pub max_oscillations: u32,
    pub max_target_failures: u32,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 10,
            max_pivots: 3,
            max_action_repeats: 5,
            max_oscillations: 3,
            max_target_failures: 5,
        }
    }
}

impl From<&koi_config::RuntimeConfig> for SessionLimits {
    fn from(cfg: &koi_config::RuntimeConfig) -> Self {
        Self {
            max_consecutive_errors: cfg.max_consecutive_errors,
            max_pivots: cfg.max_pivots,
            max_action_repeats: cfg.max_action_repeats,
            max_oscillations: cfg.max_oscillations,
            max_target_failures: cfg.max_target_failures,
        }
    }
}

/// One executed action and what came of it.
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub action: Value,
    pub key: String,
    pub intent: String,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// 1-based position; always equals its index in the history plus one.
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
}

/// Ephemeral state of one `handle()` invocation: the ordered action
/// history, the running error counters, and the pathology detectors that
/// stop an agent from spinning.
pub struct PlaybookSession {
    limits: SessionLimits,
    pub action_history: Vec<ActionRecord>,
    pub consecutive_errors: u32,
    pub pivot_count: u32,
    /// Length of the current run of identical action keys.
    same_key_run: u32,
    oscillation_count: u32,
    /// (intent, target) → failures within this session.
    target_failures: HashMap<(String, String), u32>,
    is_terminated: bool,
    pub final_result: Option<Value>,
    /// Shared resolved variables visible to every action this session.
    pub context: Map<String, Value>,
}

impl PlaybookSession {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            limits,
            action_history: Vec::new(),
            consecutive_errors: 0,
            pivot_count: 0,
            same_key_run: 0,
            oscillation_count: 0,
            target_failures: HashMap::new(),
            is_terminated: false,
            final_result: None,
            context: Map::new(),
        }
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    pub fn iteration(&self) -> u32 {
        self.action_history.len() as u32
    }

    pub fn is_terminated(&self) -> bool {
        self.is_terminated
    }

    /// Latch the terminal flag; it never reverts.
    pub fn terminate(&mut self, result: Option<Value>) {
        if !self.is_terminated {
            self.is_terminated = true;
            self.final_result = result;
        }
    }

    /// True when the error budget is exhausted and a pivot should be tried.
    pub fn needs_pivot(&self) -> bool {
        self.consecutive_errors >= self.limits.max_consecutive_errors
    }

    /// Reset the error counters for a strategy change.  At most
    /// `max_pivots` per session; the call after the budget returns false.
    pub fn pivot(&mut self) -> bool {
        if self.pivot_count >= self.limits.max_pivots {
            return false;
        }
        self.pivot_count += 1;
        self.consecutive_errors = 0;
        self.same_key_run = 0;
        self.oscillation_count = 0;
        true
    }

    /// Record a completed action.  A result with `success: false` counts as
    /// an error; anything else resets the consecutive-error counter.
    pub fn record_result(&mut self, action: &Action, result: Value) {
        let failed = is_failure(&result);
        if failed {
            self.note_failure(action);
        } else {
            self.consecutive_errors = 0;
        }
        self.push_record(action, Some(result), None);
    }

    /// Record a thrown execution error.
    pub fn record_error(&mut self, action: &Action, error: impl Into<String>) {
        self.note_failure(action);
        self.push_record(action, None, Some(error.into()));
    }

    /// Record a synthetic feedback entry (parallel-group summaries, LLM
    /// transport errors).  Never affects the error counters.
    pub fn record_feedback(&mut self, intent: &str, payload: Value) {
        let iteration = self.action_history.len() as u32 + 1;
        self.action_history.push(ActionRecord {
            action: Value::Null,
            key: intent.to_string(),
            intent: intent.to_string(),
            result: Some(payload),
            error: None,
            iteration,
            timestamp: Utc::now(),
        });
    }

    fn note_failure(&mut self, action: &Action) {
        self.consecutive_errors += 1;
        let target = action.failure_target();
        let count = self
            .target_failures
            .entry((action.intent.clone(), target.clone()))
            .or_insert(0);
        *count += 1;
        if *count >= self.limits.max_target_failures {
            warn!(
                intent = %action.intent,
                %target,
                "target failed too often, exhausting error budget"
            );
            self.consecutive_errors = self
                .consecutive_errors
                .max(self.limits.max_consecutive_errors);
        }
    }

    fn push_record(&mut self, action: &Action, result: Option<Value>, error: Option<String>) {
        let key = action.canonical_key();
        let iteration = self.action_history.len() as u32 + 1;
        self.action_history.push(ActionRecord {
            action: serde_json::to_value(action).unwrap_or(Value::Null),
            key: key.clone(),
            intent: action.intent.clone(),
            result,
            error,
            iteration,
            timestamp: Utc::now(),
        });
        self.detect_repeats(&key);
        self.detect_oscillation();
    }

    /// Identical action key twice in a row grows the run; a run of
    /// `max_action_repeats` exhausts the error budget.
    fn detect_repeats(&mut self, key: &str) {
        let n = self.action_history.len();
        let previous = n.checked_sub(2).map(|i| self.action_history[i].key.as_str());
        if previous == Some(key) {
            if self.same_key_run == 0 {
                self.same_key_run = 2;
            } else {
                self.same_key_run += 1;
            }
        } else {
            self.same_key_run = 1;
        }
        if self.same_key_run >= self.limits.max_action_repeats {
            warn!(key, run = self.same_key_run, "same action repeated, exhausting error budget");
            self.consecutive_errors = self
                .consecutive_errors
                .max(self.limits.max_consecutive_errors);
        }
    }

    /// A-B-A-B over the last four keys counts one oscillation; at the
    /// configured limit the session is force-terminated.
    fn detect_oscillation(&mut self) {
        let n = self.action_history.len();
        if n < 4 {
            return;
        }
        let key = |i: usize| self.action_history[i].key.as_str();
        let (a, b, c, d) = (key(n - 4), key(n - 3), key(n - 2), key(n - 1));
        if a == c && b == d && a != b {
            self.oscillation_count += 1;
            if self.oscillation_count >= self.limits.max_oscillations {
                warn!(count = self.oscillation_count, "oscillation detected, force-terminating");
                self.consecutive_errors = self
                    .consecutive_errors
                    .max(self.limits.max_consecutive_errors);
                self.terminate(None);
            }
        }
    }
}

impl Default for PlaybookSession {
    fn default() -> Self {
        Self::new(SessionLimits::default())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use koi_actions::{failure, success};

    fn action(intent: &str) -> Action {
        Action::new(intent)
    }

    fn action_on(intent: &str, path: &str) -> Action {
        Action::new(intent).with("path", json!(path))
    }

    // ── Ordering ──────────────────────────────────────────────────────────────

    #[test]
    fn iterations_match_history_indices() {
        let mut s = PlaybookSession::default();
        for i in 0..5 {
            s.record_result(&action_on("read_file", &format!("f{i}")), success(json!({})));
        }
        for (index, record) in s.action_history.iter().enumerate() {
            assert_eq!(record.iteration as usize, index + 1);
        }
        assert_eq!(s.iteration(), 5);
    }

    #[test]
    fn timestamps_are_non_decreasing() {
        let mut s = PlaybookSession::default();
        for i in 0..10 {
            s.record_result(&action_on("grep", &format!("p{i}")), success(json!({})));
        }
        for pair in s.action_history.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    // ── Error counters ────────────────────────────────────────────────────────

    #[test]
    fn success_resets_consecutive_errors() {
        let mut s = PlaybookSession::default();
        s.record_result(&action_on("shell", "a"), failure("boom", None));
        s.record_result(&action_on("shell", "b"), failure("boom", None));
        assert_eq!(s.consecutive_errors, 2);
        s.record_result(&action_on("read_file", "c"), success(json!({})));
        assert_eq!(s.consecutive_errors, 0);
    }

    #[test]
    fn thrown_errors_count_like_failures() {
        let mut s = PlaybookSession::default();
        s.record_error(&action_on("shell", "x"), "panic");
        assert_eq!(s.consecutive_errors, 1);
        assert_eq!(s.action_history[0].error.as_deref(), Some("panic"));
    }

    #[test]
    fn feedback_records_do_not_touch_counters() {
        let mut s = PlaybookSession::default();
        s.record_result(&action_on("shell", "x"), failure("e", None));
        s.record_feedback("_parallel_done", json!({"summary": []}));
        assert_eq!(s.consecutive_errors, 1);
        assert_eq!(s.iteration(), 2);
    }

    // ── Pivot budget ──────────────────────────────────────────────────────────

    #[test]
    fn pivot_budget_is_three() {
        let mut s = PlaybookSession::default();
        assert!(s.pivot());
        assert!(s.pivot());
        assert!(s.pivot());
        assert!(!s.pivot(), "the fourth pivot must be refused");
        assert_eq!(s.pivot_count, 3);
    }

    #[test]
    fn pivot_resets_error_counter() {
        let mut s = PlaybookSession::default();
        for i in 0..10 {
            s.record_result(&action_on("shell", &format!("t{i}")), failure("e", None));
        }
        assert!(s.needs_pivot());
        assert!(s.pivot());
        assert_eq!(s.consecutive_errors, 0);
        assert!(!s.needs_pivot());
    }

    // ── Repeat detector ───────────────────────────────────────────────────────

    #[test]
    fn fifth_identical_action_exhausts_error_budget() {
        let mut s = PlaybookSession::default();
        let a = action_on("read_file", "same.txt");
        for _ in 0..4 {
            s.record_result(&a, success(json!({})));
            assert!(!s.needs_pivot());
        }
        s.record_result(&a, success(json!({})));
        assert!(
            s.consecutive_errors >= s.limits().max_consecutive_errors,
            "fifth identical record must exhaust the budget"
        );
    }

    #[test]
    fn different_targets_do_not_count_as_repeats() {
        let mut s = PlaybookSession::default();
        for i in 0..10 {
            s.record_result(&action_on("read_file", &format!("f{i}")), success(json!({})));
        }
        assert!(!s.needs_pivot());
    }

    // ── Oscillation detector ──────────────────────────────────────────────────

    #[test]
    fn abab_cycles_force_terminate_after_three_detections() {
        let mut s = PlaybookSession::default();
        let a = action_on("read_file", "a");
        let b = action_on("grep", "b");
        for _ in 0..4 {
            s.record_result(&a, success(json!({})));
            if s.is_terminated() {
                break;
            }
            s.record_result(&b, success(json!({})));
            if s.is_terminated() {
                break;
            }
        }
        assert!(s.is_terminated(), "A-B-A-B cycling must force-terminate");
        assert!(s.consecutive_errors >= s.limits().max_consecutive_errors);
    }

    #[test]
    fn straight_line_progress_is_not_oscillation() {
        let mut s = PlaybookSession::default();
        for i in 0..12 {
            s.record_result(&action_on("read_file", &format!("f{i}")), success(json!({})));
        }
        assert!(!s.is_terminated());
    }

    // ── Per-target failures ───────────────────────────────────────────────────

    #[test]
    fn repeated_target_failures_exhaust_budget() {
        let mut s = PlaybookSession::default();
        // Interleave successes so consecutive_errors alone never reaches the
        // budget; the per-target counter must do it.
        for i in 0..4 {
            s.record_result(&action_on("grep", "/bad/path"), failure("no such path", None));
            s.record_result(&action_on("read_file", &format!("ok{i}")), success(json!({})));
        }
        s.record_result(&action_on("grep", "/bad/path"), failure("no such path", None));
        assert!(s.consecutive_errors >= s.limits().max_consecutive_errors);
    }

    // ── Termination latch ─────────────────────────────────────────────────────

    #[test]
    fn terminate_latches() {
        let mut s = PlaybookSession::default();
        s.terminate(Some(json!("first")));
        s.terminate(Some(json!("second")));
        assert!(s.is_terminated());
        assert_eq!(s.final_result, Some(json!("first")));
    }
}
