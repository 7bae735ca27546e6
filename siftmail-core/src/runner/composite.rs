//! Composite symbols (spec §4.4 "Composite symbols").
//!
//! A composite's implementation is a boolean expression over other symbol
//! names, evaluated against the task's current hit table; an unresolved
//! atom evaluates to `false`. Spec §9 Open Questions leaves "whether
//! composites remove constituent atoms" unguessed and asks for an explicit
//! per-composite knob defaulting to "does not alter atoms" — that is
//! [`AtomPolicy::Keep`] below.

use std::sync::Arc;

use async_trait::async_trait;

use crate::rule_impl::{NativeRule, RuleContext, RuleOutcome};
use crate::scoring::engine::insert_result;
use crate::scoring::metric::Metric;

/// A boolean expression over other symbol names.
#[derive(Clone, Debug)]
pub enum CompositeExpr {
    Atom(String),
    Not(Box<CompositeExpr>),
    And(Vec<CompositeExpr>),
    Or(Vec<CompositeExpr>),
}

impl CompositeExpr {
    pub fn evaluate(&self, fired: &dyn Fn(&str) -> bool) -> bool {
        match self {
            CompositeExpr::Atom(name) => fired(name),
            CompositeExpr::Not(inner) => !inner.evaluate(fired),
            CompositeExpr::And(parts) => parts.iter().all(|p| p.evaluate(fired)),
            CompositeExpr::Or(parts) => parts.iter().any(|p| p.evaluate(fired)),
        }
    }

    /// Every atom name referenced anywhere in the expression, used to apply
    /// an [`AtomPolicy`] once the composite fires.
    pub fn atom_names(&self, out: &mut Vec<String>) {
        match self {
            CompositeExpr::Atom(name) => out.push(name.clone()),
            CompositeExpr::Not(inner) => inner.atom_names(out),
            CompositeExpr::And(parts) | CompositeExpr::Or(parts) => {
                for part in parts {
                    part.atom_names(out);
                }
            }
        }
    }
}

/// Whether a fired composite removes the atoms that contributed to it.
/// Defaults to `Keep` per spec §9's unguessed Open Question.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AtomPolicy {
    #[default]
    Keep,
    Remove,
    RemoveRecursive,
}

pub struct CompositeRule {
    pub name: String,
    pub expr: CompositeExpr,
    pub policy: AtomPolicy,
    pub metric: Arc<Metric>,
}

#[async_trait]
impl NativeRule for CompositeRule {
    async fn run(&self, ctx: RuleContext) -> RuleOutcome {
        let task = &ctx.task;
        let default_metric = self.metric.name.clone();
        let fired = |name: &str| {
            task.all_metric_results()
                .get(&default_metric)
                .map(|r| r.hits.contains_key(name))
                .unwrap_or(false)
        };

        if self.expr.evaluate(&fired) {
            insert_result(task, &self.metric, &self.name, 1.0, None);

            if self.policy != AtomPolicy::Keep {
                let mut atoms = Vec::new();
                self.expr.atom_names(&mut atoms);
                task.with_metric_result_mut(&self.metric.name, |result| {
                    for atom in &atoms {
                        result.hits.remove(atom);
                    }
                });
                // `RemoveRecursive` additionally strips the removed atoms'
                // own group contribution; a plain `Remove` leaves group
                // totals untouched (the cap already accounted for them).
                if self.policy == AtomPolicy::RemoveRecursive {
                    task.with_metric_result_mut(&self.metric.name, |result| {
                        result.score = result.hits.values().map(|h| h.score).sum();
                    });
                }
            }
        }

        RuleOutcome::Finished
    }
}
