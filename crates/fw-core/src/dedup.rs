//! Cooldown-based deduplication.
//!
//! A short cooldown window per unique key absorbs the bursts agents emit
//! when a detection re-fires every scan cycle. Within the window a signal
//! with an unchanged artifact is a plain repeat (keep-alive); a changed
//! artifact or category under the same key is an escalation whether or
//! not the window has lapsed; an unchanged artifact outside the window
//! counts as new again.

use std::collections::HashMap;

use crate::keys;
use crate::model::{Signal, SignalStatus};

/// Default cooldown window, milliseconds.
pub const DEFAULT_COOLDOWN_MS: i64 = 30_000;

/// How an incoming signal relates to the live record under its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No live record, or an unchanged artifact past the cooldown.
    New,
    /// Same key, same artifact, inside the cooldown window; a keep-alive
    /// that must not inflate the detection counter.
    Repeat,
    /// Same key with a different artifact or category; the record is
    /// refreshed and counted rather than silently absorbed.
    Escalated,
}

/// Per-key cooldown tracking.
#[derive(Debug)]
pub struct DeduplicationEngine {
    /// Last acceptance time per unique key, epoch milliseconds.
    cooldown: HashMap<String, i64>,
    window_ms: i64,
}

impl DeduplicationEngine {
    pub fn new(cooldown_secs: u64) -> Self {
        Self {
            cooldown: HashMap::new(),
            window_ms: (cooldown_secs as i64) * 1_000,
        }
    }

    /// Informational noise filter, applied before any key work.
    ///
    /// Ok signals carry no detection content. Info signals are dropped
    /// unless they are one of the operational kinds the engine consumes
    /// (heartbeats, identity refreshes, batch reports).
    pub fn should_discard(signal: &Signal) -> bool {
        match signal.status {
            SignalStatus::Ok => true,
            SignalStatus::Info => {
                let name = signal.name.to_ascii_lowercase();
                let details = signal.details.to_ascii_lowercase();
                let keep = name.contains("periodic summary")
                    || name.contains("heartbeat")
                    || name.contains("device identity")
                    || name.contains("batch report")
                    || details.contains("probability")
                    || details.contains("threats detected");
                !keep
            }
            _ => false,
        }
    }

    /// Classifies a signal against the live record under its key and
    /// stamps the cooldown map.
    ///
    /// `existing` carries the live record's `(artifact, category)` when
    /// one exists.
    pub fn classify(
        &mut self,
        unique_key: &str,
        artifact: &str,
        category: &str,
        existing: Option<(&str, &str)>,
        now_ms: i64,
    ) -> Outcome {
        let last = self.cooldown.get(unique_key).copied();
        self.cooldown.insert(unique_key.to_string(), now_ms);

        let (prev_artifact, prev_category) = match existing {
            Some(pair) => pair,
            None => return Outcome::New,
        };
        if prev_artifact != artifact || !prev_category.eq_ignore_ascii_case(category) {
            return Outcome::Escalated;
        }

        match last {
            Some(t) if now_ms - t < self.window_ms => Outcome::Repeat,
            _ => Outcome::New,
        }
    }

    /// Drops cooldown entries older than the window; called from the
    /// retention sweep so the map stays bounded.
    pub fn prune(&mut self, now_ms: i64) {
        let window = self.window_ms;
        self.cooldown.retain(|_, t| now_ms - *t < window);
    }

    /// Removes cooldown state for a key whose record was evicted.
    pub fn forget(&mut self, unique_key: &str) {
        self.cooldown.remove(unique_key);
    }
}

/// Rewrites the `[xN]` multiplier marker in a details string.
///
/// The marker is appended only when the repeat count exceeds one and the
/// incoming details do not already carry their own marker; any previous
/// marker is stripped first so the count never stacks.
pub fn apply_multiplier(details: &str, detections: u32) -> String {
    if keys::has_multiplier(details) {
        return details.to_string();
    }
    let base = keys::strip_multiplier(details);
    if detections > 1 {
        if base.is_empty() {
            format!("[x{detections}]")
        } else {
            format!("{base} [x{detections}]")
        }
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(status: SignalStatus, name: &str, details: &str) -> Signal {
        Signal::new(0, "d1", "programs", name, status, details)
    }

    #[test]
    fn test_ok_always_discarded() {
        let s = signal(SignalStatus::Ok, "scan clean", "");
        assert!(DeduplicationEngine::should_discard(&s));
    }

    #[test]
    fn test_info_discarded_by_default() {
        let s = signal(SignalStatus::Info, "routine note", "nothing here");
        assert!(DeduplicationEngine::should_discard(&s));
    }

    #[test]
    fn test_operational_info_kept() {
        let s = signal(SignalStatus::Info, "Heartbeat", "");
        assert!(!DeduplicationEngine::should_discard(&s));
        let s = signal(SignalStatus::Info, "Periodic Summary", "");
        assert!(!DeduplicationEngine::should_discard(&s));
        let s = signal(SignalStatus::Info, "Batch Report", "");
        assert!(!DeduplicationEngine::should_discard(&s));
        let s = signal(SignalStatus::Info, "scan", "probability 0.82, 3 threats detected");
        assert!(!DeduplicationEngine::should_discard(&s));
    }

    #[test]
    fn test_warn_never_discarded() {
        let s = signal(SignalStatus::Warn, "anything", "");
        assert!(!DeduplicationEngine::should_discard(&s));
    }

    #[test]
    fn test_first_signal_is_new() {
        let mut engine = DeduplicationEngine::new(30);
        assert_eq!(engine.classify("k", "a", "programs", None, 0), Outcome::New);
    }

    #[test]
    fn test_repeat_inside_window() {
        let mut engine = DeduplicationEngine::new(30);
        engine.classify("k", "a", "programs", None, 0);
        let outcome = engine.classify("k", "a", "programs", Some(("a", "programs")), 10_000);
        assert_eq!(outcome, Outcome::Repeat);
    }

    #[test]
    fn test_escalated_on_artifact_change() {
        let mut engine = DeduplicationEngine::new(30);
        engine.classify("k", "a", "programs", None, 0);
        let outcome = engine.classify("k", "b", "programs", Some(("a", "programs")), 10_000);
        assert_eq!(outcome, Outcome::Escalated);
    }

    #[test]
    fn test_escalated_on_category_change() {
        let mut engine = DeduplicationEngine::new(30);
        engine.classify("k", "a", "programs", None, 0);
        let outcome = engine.classify("k", "a", "auto", Some(("a", "programs")), 10_000);
        assert_eq!(outcome, Outcome::Escalated);
    }

    #[test]
    fn test_escalated_outside_window_on_artifact_change() {
        let mut engine = DeduplicationEngine::new(30);
        engine.classify("k", "a", "programs", None, 0);
        let outcome = engine.classify("k", "b", "programs", Some(("a", "programs")), 40_000);
        assert_eq!(outcome, Outcome::Escalated);
    }

    #[test]
    fn test_new_after_window_lapses() {
        let mut engine = DeduplicationEngine::new(30);
        engine.classify("k", "a", "programs", None, 0);
        let outcome = engine.classify("k", "a", "programs", Some(("a", "programs")), 31_000);
        assert_eq!(outcome, Outcome::New);
    }

    #[test]
    fn test_prune_bounds_map() {
        let mut engine = DeduplicationEngine::new(30);
        engine.classify("old", "a", "programs", None, 0);
        engine.classify("fresh", "a", "programs", None, 50_000);
        engine.prune(60_000);
        assert!(!engine.cooldown.contains_key("old"));
        assert!(engine.cooldown.contains_key("fresh"));
    }

    #[test]
    fn test_multiplier_applied_once() {
        assert_eq!(apply_multiplier("seen", 3), "seen [x3]");
        assert_eq!(apply_multiplier("seen [x2]", 3), "seen [x2]");
        assert_eq!(apply_multiplier("seen", 1), "seen");
        assert_eq!(apply_multiplier("", 2), "[x2]");
    }
}
