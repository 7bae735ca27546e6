//! The unit of work (spec §3 "Task").

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use siftmail_contracts::{Action, TaskId};

use crate::scoring::metric::MetricResult;
use crate::session::AsyncSession;

/// Envelope metadata carried alongside the raw message (spec §3, §6.1).
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    pub from_ip: Option<IpAddr>,
    pub helo: Option<String>,
    pub hostname: Option<String>,
    pub mail_from: Option<String>,
    pub recipients: Vec<String>,
    pub authenticated_user: Option<String>,
    pub deliver_to: Option<String>,
    pub queue_id: Option<String>,
    pub subject: Option<String>,
    /// `Pass: all` (spec §6.1): evaluate every rule regardless of skip flags.
    pub pass_all: bool,
}

/// An early verdict forced by a pre-filter (spec §3, §4.2, §4.3).
#[derive(Clone, Debug)]
pub struct PreResult {
    pub action: Action,
    pub message: Option<String>,
}

/// Per-request configuration overrides (spec §6.4 "settings").
///
/// Deserializable as-is so ingress can decode a raw `Settings` header/body
/// straight into it (spec §6.4: "a request ... may inject a settings
/// object").
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Overrides a symbol's effective weight (× multiplier), keyed by name.
    pub weight_overrides: HashMap<String, f64>,
    /// Forces or suppresses a specific action outright.
    pub forced_action: Option<Action>,
    /// Selects a non-default metric for this task.
    pub metric_override: Option<String>,
}

impl Settings {
    pub fn weight_for(&self, rule_name: &str) -> Option<f64> {
        self.weight_overrides.get(rule_name).copied()
    }
}

/// The unit of work carried through the scheduler, rule runner, and scoring
/// engine. Owns its async session and the per-metric result table.
///
/// Invariant: a task owns all allocations made for it; destroying the task
/// releases them. Here that's simply ordinary Rust ownership/drop, replacing
/// a per-task arena allocator with idiomatic `Arc`/`Vec` ownership instead.
pub struct Task {
    pub id: TaskId,
    pub message: Arc<[u8]>,
    pub envelope: Envelope,
    pub session: AsyncSession,
    pub settings: Settings,
    pre_result: Mutex<Option<PreResult>>,
    results: Mutex<HashMap<String, MetricResult>>,
    /// Regex match cache keyed by `(pattern, subject-discriminant)`; avoids
    /// re-running the same compiled pattern twice against identical text
    /// within one task (spec §3: "a per-task regexp match cache").
    regex_match_cache: Mutex<HashMap<(String, u64), bool>>,
}

impl Task {
    pub fn new(message: Vec<u8>, envelope: Envelope) -> (Self, tokio::sync::oneshot::Receiver<crate::session::FinalizeReason>) {
        let (session, rx) = AsyncSession::new();
        let task = Self {
            id: TaskId::new(),
            message: Arc::from(message),
            envelope,
            session,
            settings: Settings::default(),
            pre_result: Mutex::new(None),
            results: Mutex::new(HashMap::new()),
            regex_match_cache: Mutex::new(HashMap::new()),
        };
        (task, rx)
    }

    /// Forces `pre_result.action = min(pre_result.action, action)` — lower
    /// severity value wins, i.e. the more severe action sticks (spec §4.2).
    pub fn set_pre_result(&self, action: Action, message: Option<String>) {
        let mut guard = self.pre_result.lock();
        let more_severe = guard
            .as_ref()
            .map(|existing| action < existing.action)
            .unwrap_or(true);
        if more_severe {
            *guard = Some(PreResult { action, message });
        }
    }

    pub fn pre_result(&self) -> Option<PreResult> {
        self.pre_result.lock().clone()
    }

    pub fn metric_result(&self, metric: &str) -> MetricResult {
        self.results
            .lock()
            .entry(metric.to_string())
            .or_insert_with(MetricResult::new)
            .clone()
    }

    pub fn with_metric_result_mut<R>(
        &self,
        metric: &str,
        f: impl FnOnce(&mut MetricResult) -> R,
    ) -> R {
        let mut guard = self.results.lock();
        let entry = guard
            .entry(metric.to_string())
            .or_insert_with(MetricResult::new);
        f(entry)
    }

    pub fn all_metric_results(&self) -> HashMap<String, MetricResult> {
        self.results.lock().clone()
    }

    pub fn cached_regex_match(&self, pattern: &str, subject_hash: u64) -> Option<bool> {
        self.regex_match_cache
            .lock()
            .get(&(pattern.to_string(), subject_hash))
            .copied()
    }

    pub fn cache_regex_match(&self, pattern: &str, subject_hash: u64, result: bool) {
        self.regex_match_cache
            .lock()
            .insert((pattern.to_string(), subject_hash), result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_result_keeps_more_severe_action() {
        let (task, _rx) = Task::new(b"hi".to_vec(), Envelope::default());
        task.set_pre_result(Action::Greylist, None);
        task.set_pre_result(Action::AddHeader, None); // less severe, ignored
        assert_eq!(task.pre_result().unwrap().action, Action::Greylist);
        task.set_pre_result(Action::Reject, None); // more severe, wins
        assert_eq!(task.pre_result().unwrap().action, Action::Reject);
    }

    #[test]
    fn regex_cache_round_trips() {
        let (task, _rx) = Task::new(b"hi".to_vec(), Envelope::default());
        assert!(task.cached_regex_match("foo.*", 1).is_none());
        task.cache_regex_match("foo.*", 1, true);
        assert_eq!(task.cached_regex_match("foo.*", 1), Some(true));
    }
}
