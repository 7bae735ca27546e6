//! The scoring namespace (spec §3 "Metric", "Metric result") and its
//! per-task running state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use siftmail_contracts::{Action, RuleFlags};

/// A scoring group: hits on rules sharing a `group` name are capped together
/// (spec §3 Metric: "groups each with `max_score` caps").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupDef {
    pub name: String,
    /// `0` (or absent) means uncapped.
    pub max_score: f64,
}

/// Static, per-rule scoring configuration attached to a metric (spec §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuleScoreDef {
    pub score: f64,
    pub description: Option<String>,
    pub group: Option<String>,
    #[serde(default)]
    pub flags: RuleFlags,
    /// `None` falls back to `Metric::default_max_shots` (spec §4.3 step 3).
    pub nshots: Option<u32>,
}

/// The scoring namespace itself (spec §3 "Metric").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub rules: HashMap<String, RuleScoreDef>,
    /// Action thresholds keyed by action; a missing entry means "unreachable"
    /// (treated as `NaN` during action selection, spec §4.3).
    pub action_thresholds: HashMap<Action, f64>,
    pub grow_factor: f64,
    pub groups: HashMap<String, GroupDef>,
    pub default_max_shots: u32,
}

impl Metric {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: HashMap::new(),
            action_thresholds: HashMap::new(),
            grow_factor: 0.0,
            groups: HashMap::new(),
            default_max_shots: 1,
        }
    }

    pub fn rule_def(&self, name: &str) -> Option<&RuleScoreDef> {
        self.rules.get(name)
    }

    pub fn group_max_score(&self, group: &str) -> Option<f64> {
        self.groups.get(group).map(|g| g.max_score).filter(|m| *m > 0.0)
    }

    /// Threshold for `action`, or `NaN` if the action has no configured
    /// threshold on this metric (spec §4.3: "non-NaN" gates every check).
    pub fn threshold(&self, action: Action) -> f64 {
        self.action_thresholds
            .get(&action)
            .copied()
            .unwrap_or(f64::NAN)
    }
}

/// A fired rule's contribution, as recorded on a [`MetricResult`] (spec §3
/// "Symbol hit").
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SymbolHit {
    pub rule_name: String,
    pub score: f64,
    pub options: Vec<String>,
    pub shots: u32,
}

impl SymbolHit {
    /// Honors `one-param`: reject additions past the first (spec §3).
    pub fn push_option(&mut self, option: String, one_param: bool) {
        if one_param && !self.options.is_empty() {
            return;
        }
        if self.options.contains(&option) {
            return;
        }
        self.options.push(option);
    }
}

/// Per-task, per-metric running state (spec §3 "Metric result").
#[derive(Clone, Debug, Default)]
pub struct MetricResult {
    pub score: f64,
    pub grow_factor: f64,
    pub group_totals: HashMap<String, f64>,
    pub hits: HashMap<String, SymbolHit>,
    pub action: Option<Action>,
}

impl MetricResult {
    pub fn new() -> Self {
        Self::default()
    }
}

/// All configured metrics, keyed by name; the default metric is `"default"`.
#[derive(Default)]
pub struct MetricTable {
    metrics: HashMap<String, Metric>,
}

impl MetricTable {
    pub const DEFAULT_METRIC: &'static str = "default";

    pub fn new() -> Self {
        Self {
            metrics: HashMap::new(),
        }
    }

    pub fn insert(&mut self, metric: Metric) {
        self.metrics.insert(metric.name.clone(), metric);
    }

    pub fn get(&self, name: &str) -> Option<&Metric> {
        self.metrics.get(name)
    }

    pub fn default_metric(&self) -> Option<&Metric> {
        self.metrics.get(Self::DEFAULT_METRIC)
    }

    /// Resolves the metric a task should score against: its per-request
    /// `metric_override` (spec §6.4) if set and configured, otherwise the
    /// table's default metric.
    pub fn active_for(&self, task: &crate::task::Task) -> Option<&Metric> {
        match &task.settings.metric_override {
            Some(name) => self.get(name),
            None => self.default_metric(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_param_rejects_second_option() {
        let mut hit = SymbolHit::default();
        hit.push_option("a".into(), true);
        hit.push_option("b".into(), true);
        assert_eq!(hit.options, vec!["a".to_string()]);
    }

    #[test]
    fn duplicate_options_are_not_appended_twice() {
        let mut hit = SymbolHit::default();
        hit.push_option("a".into(), false);
        hit.push_option("a".into(), false);
        assert_eq!(hit.options, vec!["a".to_string()]);
    }

    #[test]
    fn unconfigured_action_threshold_is_nan() {
        let metric = Metric::new("default");
        assert!(metric.threshold(Action::Reject).is_nan());
    }
}
