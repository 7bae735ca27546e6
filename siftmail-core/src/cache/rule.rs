//! Rule (cache item) metadata (spec §3 "Rule (cache item)").

use std::sync::Arc;

use siftmail_contracts::{RuleFlags, RuleId, RuleName, SymbolKind};

use crate::cache::stats::RuleStats;
use crate::rule_impl::NativeRule;
use crate::task::Task;

/// A boolean predicate gating whether a rule is considered ready to run
/// (spec §4.2 "add_condition"). Multiple conditions AND-compose.
pub type Condition = Arc<dyn Fn(&Task) -> bool + Send + Sync>;

/// Terminal and intermediate scheduling states (spec §4.2).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuleState {
    Pending,
    Ready,
    Running,
    Finished,
    Skipped,
}

impl RuleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RuleState::Finished | RuleState::Skipped)
    }
}

/// Implementation variant a rule dispatches to (spec §4.4).
pub enum RuleBody {
    /// Covers native-fn, composite-expression, and classifier-batch rules
    /// alike (spec §4.4): each is a [`NativeRule`] impl (see
    /// [`crate::runner::composite::CompositeRule`] and
    /// [`crate::stats::classifier::ClassifierScanRule`]), so dispatch never
    /// needs a dedicated enum arm per kind.
    Native(Arc<dyn NativeRule>),
    /// A named callback on a [`crate::rule_impl::ScriptEngine`], resolved at
    /// run time by the rule runner.
    Script(String),
}

/// A registered rule (spec §3 "Rule (cache item)").
pub struct RuleDef {
    pub id: RuleId,
    pub name: RuleName,
    pub kind: SymbolKind,
    pub base_weight: f64,
    pub priority: i32,
    pub parent_id: Option<RuleId>,
    pub body: RuleBody,
    pub conditions: Vec<Condition>,
    pub flags: RuleFlags,
    pub stats: RuleStats,
    /// Last observed mean latency, used as the tie-break "cost" in the
    /// static queue ordering (spec §4.2: "cost_ascending").
    pub cost_seconds: std::sync::atomic::AtomicU64, // bits of an f64
}

impl RuleDef {
    pub fn evaluate_conditions(&self, task: &Task) -> bool {
        self.conditions.iter().all(|cond| cond(task))
    }

    pub fn cost(&self) -> f64 {
        f64::from_bits(self.cost_seconds.load(std::sync::atomic::Ordering::Relaxed))
    }

    pub fn set_cost(&self, value: f64) {
        self.cost_seconds
            .store(value.to_bits(), std::sync::atomic::Ordering::Relaxed);
    }
}

/// Implements the parent-contributes-weight fallback from spec §4.2: "A
/// Callback that registers a child Virtual whose own weight was not
/// declared in any metric -> the Virtual contributes using the Callback's
/// weight."
pub fn effective_weight(rule: &RuleDef, parent: Option<&RuleDef>) -> f64 {
    if rule.base_weight != 0.0 {
        rule.base_weight
    } else {
        parent.map(|p| p.base_weight).unwrap_or(0.0)
    }
}
