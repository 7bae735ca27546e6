//! The scoring and action engine (component C, spec §4.3).

use siftmail_contracts::Action;

use super::metric::{Metric, MetricResult, SymbolHit};
use crate::task::Task;

/// `insert_result(task, metric, symbol, multiplier, option) -> hit`
///
/// Implements spec §4.3 step by step; see the inline comments for the
/// corresponding numbered step. Returns the (possibly unchanged) hit as it
/// now stands on the metric result.
pub fn insert_result(
    task: &Task,
    metric: &Metric,
    symbol: &str,
    multiplier: f64,
    option: Option<String>,
) -> SymbolHit {
    task.with_metric_result_mut(&metric.name, |result| {
        insert_result_into(task, metric, result, symbol, multiplier, option)
    })
}

fn insert_result_into(
    task: &Task,
    metric: &Metric,
    result: &mut MetricResult,
    symbol: &str,
    multiplier: f64,
    option: Option<String>,
) -> SymbolHit {
    // Step 1 + 2: resolve weight. Absent definition -> w = 0, no group cap.
    let def = metric.rule_def(symbol);
    let configured_weight = def.map(|d| d.score).unwrap_or(0.0);
    let effective_weight = task.settings.weight_for(symbol).unwrap_or(configured_weight);
    let w = effective_weight * multiplier;

    let one_param = def.map(|d| d.flags.one_param).unwrap_or(false);
    let one_shot_flag = def.map(|d| d.flags.one_shot).unwrap_or(false);

    // Step 3: shot policy.
    let max_shots = if one_shot_flag {
        1
    } else {
        def.and_then(|d| d.nshots).unwrap_or(metric.default_max_shots)
    };

    let existing = result.hits.get(symbol).cloned();

    // Step 4: resolve `diff` against any existing hit.
    let diff = match existing.as_ref() {
        None => w,
        Some(existing_hit) => {
            let duplicate_option = option
                .as_ref()
                .map(|opt| existing_hit.options.contains(opt))
                .unwrap_or(false);
            let shots_exhausted = existing_hit.shots >= max_shots;
            let treat_as_single_shot = duplicate_option || shots_exhausted;

            if treat_as_single_shot {
                let same_sign = (w >= 0.0) == (existing_hit.score >= 0.0);
                if w.abs() > existing_hit.score.abs() && same_sign {
                    w - existing_hit.score
                } else {
                    0.0
                }
            } else {
                w
            }
        }
    };

    // Step 5: grow-factor.
    let mut diff = diff;
    if result.grow_factor > 0.0 && diff > 0.0 {
        diff *= result.grow_factor;
    }
    if diff > 0.0 {
        result.grow_factor = metric.grow_factor;
    }

    // Step 6: group cap.
    let group = def.and_then(|d| d.group.as_deref());
    if let Some(group) = group {
        if let Some(max_score) = metric.group_max_score(group) {
            let running = *result.group_totals.get(group).unwrap_or(&0.0);
            if running >= max_score && diff > 0.0 {
                diff = f64::NAN; // dropped entirely, no score mutation
            } else {
                diff = diff.min(max_score - running);
            }
        }
    }

    if diff.is_nan() {
        // Contribution entirely clipped by the group cap; report the
        // existing hit (or a fresh zero-score hit) unchanged.
        return existing.unwrap_or_else(|| SymbolHit {
            rule_name: symbol.to_string(),
            score: 0.0,
            options: Vec::new(),
            shots: 0,
        });
    }

    // Step 7: commit.
    result.score += diff;
    if let Some(group) = group {
        *result.group_totals.entry(group.to_string()).or_insert(0.0) += diff;
    }

    let hit = result.hits.entry(symbol.to_string()).or_insert_with(|| SymbolHit {
        rule_name: symbol.to_string(),
        score: 0.0,
        options: Vec::new(),
        shots: 0,
    });
    hit.score += diff;
    hit.shots += 1;
    if let Some(option) = option {
        hit.push_option(option, one_param);
    }
    hit.clone()
}

/// `check_action(task, metric_result)` (spec §4.3).
///
/// Mutates `result.score` and `result.action` in place (matching the spec's
/// description of the pre-result path, which reassigns `metric_result.score`
/// to the chosen threshold) and returns the selected action.
pub fn check_action(task: &Task, metric: &Metric, result: &mut MetricResult) -> Action {
    if let Some(forced) = task.settings.forced_action {
        // Per-request override (spec §6.4 "force or suppress specific
        // actions"); takes precedence over the threshold table but not over
        // an already-set pre-result, which is forced by the engine's own
        // pre-filter logic rather than an external caller.
        if task.pre_result().is_none() {
            result.action = Some(forced);
            return forced;
        }
    }

    let action = if let Some(pre_result) = task.pre_result() {
        // Scan thresholds starting at the forced action's severity, walking
        // towards less severe actions, for the first configured value.
        let mut chosen_score = None;
        for severity in pre_result.action.severity()..=Action::NoAction.severity() {
            if let Some(candidate) = Action::from_severity(severity) {
                let threshold = metric.threshold(candidate);
                if !threshold.is_nan() {
                    chosen_score = Some(threshold);
                    break;
                }
            }
        }
        if let Some(score) = chosen_score {
            result.score = score;
        }
        pre_result.action
    } else {
        // Among every action whose threshold is met, keep the one with the
        // highest threshold (which, for a sane monotonically-increasing
        // configuration, is also the most severe). Tracking the max only on
        // a *match* — rather than gating subsequent candidates on whatever
        // higher threshold a prior, unmet candidate happened to have — is
        // what makes this order-independent instead of only ever
        // considering the single most severe configured threshold.
        let mut chosen = Action::NoAction;
        let mut max_threshold_seen = f64::NEG_INFINITY;
        for candidate in Action::most_severe_first() {
            let threshold = metric.threshold(candidate);
            if threshold.is_nan() {
                continue;
            }
            if result.score >= threshold && threshold > max_threshold_seen {
                chosen = candidate;
                max_threshold_seen = threshold;
            }
        }
        chosen
    };

    result.action = Some(action);
    action
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::metric::{GroupDef, RuleScoreDef};
    use crate::task::Envelope;
    use std::collections::HashMap;

    fn metric_with(rules: Vec<(&str, f64, Option<&str>)>, thresholds: Vec<(Action, f64)>) -> Metric {
        let mut metric = Metric::new("default");
        for (name, score, group) in rules {
            metric.rules.insert(
                name.to_string(),
                RuleScoreDef {
                    score,
                    description: None,
                    group: group.map(|g| g.to_string()),
                    flags: Default::default(),
                    nshots: None,
                },
            );
        }
        metric.action_thresholds = thresholds.into_iter().collect();
        metric
    }

    #[test]
    fn scenario_1_symbol_firing_and_scoring() {
        let metric = metric_with(
            vec![("FOO", 2.0, None), ("BAR", -1.0, None)],
            vec![(Action::AddHeader, 1.5), (Action::Reject, 5.0)],
        );
        let (task, _rx) = Task::new(b"x".to_vec(), Envelope::default());
        insert_result(&task, &metric, "FOO", 1.0, None);
        insert_result(&task, &metric, "BAR", 1.0, None);
        let mut result = task.metric_result("default");
        assert_eq!(result.score, 1.0);
        let action = check_action(&task, &metric, &mut result);
        assert_eq!(action, Action::NoAction);
    }

    #[test]
    fn scenario_2_group_cap() {
        let mut metric = metric_with(
            vec![("A", 1.5, Some("G")), ("B", 1.5, Some("G")), ("C", 1.5, Some("G"))],
            vec![],
        );
        metric.groups.insert(
            "G".to_string(),
            GroupDef {
                name: "G".to_string(),
                max_score: 3.0,
            },
        );
        let (task, _rx) = Task::new(b"x".to_vec(), Envelope::default());
        insert_result(&task, &metric, "A", 1.0, None);
        insert_result(&task, &metric, "B", 1.0, None);
        insert_result(&task, &metric, "C", 1.0, None);
        let result = task.metric_result("default");
        assert_eq!(result.score, 3.0);
        assert_eq!(result.group_totals.get("G").copied(), Some(3.0));
    }

    #[test]
    fn scenario_3_pre_result_forces_action() {
        let metric = metric_with(
            vec![("X", 1.2, None)],
            vec![(Action::Greylist, 4.0)],
        );
        let (task, _rx) = Task::new(b"x".to_vec(), Envelope::default());
        task.set_pre_result(Action::Greylist, None);
        insert_result(&task, &metric, "X", 1.0, None);
        let mut result = task.metric_result("default");
        let action = check_action(&task, &metric, &mut result);
        assert_eq!(action, Action::Greylist);
        assert_eq!(result.score, 4.0);
    }

    #[test]
    fn settings_forced_action_overrides_threshold_table() {
        let metric = metric_with(vec![("X", 1.0, None)], vec![(Action::Reject, 50.0)]);
        let (mut task, _rx) = Task::new(b"x".to_vec(), Envelope::default());
        task.settings.forced_action = Some(Action::SoftReject);
        insert_result(&task, &metric, "X", 1.0, None);
        let mut result = task.metric_result("default");
        let action = check_action(&task, &metric, &mut result);
        assert_eq!(action, Action::SoftReject);
    }

    #[test]
    fn pre_result_takes_precedence_over_settings_forced_action() {
        let metric = metric_with(vec![], vec![(Action::Greylist, 4.0)]);
        let (mut task, _rx) = Task::new(b"x".to_vec(), Envelope::default());
        task.settings.forced_action = Some(Action::NoAction);
        task.set_pre_result(Action::Greylist, None);
        let mut result = task.metric_result("default");
        let action = check_action(&task, &metric, &mut result);
        assert_eq!(action, Action::Greylist);
    }

    #[test]
    fn single_shot_duplicate_option_does_not_double_score() {
        let mut metric = metric_with(vec![("ONE", 2.0, None)], vec![]);
        metric.rules.get_mut("ONE").unwrap().flags.one_shot = true;
        let (task, _rx) = Task::new(b"x".to_vec(), Envelope::default());
        insert_result(&task, &metric, "ONE", 1.0, Some("opt".to_string()));
        insert_result(&task, &metric, "ONE", 1.0, Some("opt".to_string()));
        let result = task.metric_result("default");
        assert_eq!(result.score, 2.0);
    }

    #[test]
    fn unknown_symbol_contributes_zero() {
        let metric = metric_with(vec![], vec![]);
        let (task, _rx) = Task::new(b"x".to_vec(), Envelope::default());
        insert_result(&task, &metric, "GHOST", 1.0, None);
        let result = task.metric_result("default");
        assert_eq!(result.score, 0.0);
        let _ = HashMap::<String, f64>::new();
    }
}
