//! Built-in native rules (spec §4.4 "native-fn" variant).
//!
//! Each rule is a small, self-contained [`NativeRule`] that inspects the
//! task's envelope or raw message and inserts a hit through the scoring
//! engine. Real deployments add many more of these (or script/composite
//! rules); these cover representative envelope- and content-level checks.

use std::sync::Arc;

use async_trait::async_trait;

use siftmail_contracts::{RuleName, SymbolKind};
use siftmail_core::cache::rule::RuleBody;
use siftmail_core::{insert_result, Metric, MetricTable, NativeRule, RuleContext, RuleOutcome, SymbolCache};

/// Resolves the metric a rule should score against: the task's per-request
/// override (spec §6.4) if set, otherwise the table's default metric.
fn active_metric<'a>(ctx: &RuleContext, table: &'a MetricTable) -> Option<&'a Metric> {
    table.active_for(&ctx.task)
}

struct MissingSubjectRule;

#[async_trait]
impl NativeRule for MissingSubjectRule {
    async fn run(&self, ctx: RuleContext) -> RuleOutcome {
        let missing = ctx
            .task
            .envelope
            .subject
            .as_ref()
            .map(|s| s.trim().is_empty())
            .unwrap_or(true);
        if missing {
            if let Some(metric) = active_metric(&ctx, &ctx.worker.metrics) {
                insert_result(&ctx.task, metric, "MISSING_SUBJECT", 1.0, None);
            }
        }
        RuleOutcome::Finished
    }
}

struct ShoutingSubjectRule;

#[async_trait]
impl NativeRule for ShoutingSubjectRule {
    async fn run(&self, ctx: RuleContext) -> RuleOutcome {
        if let Some(subject) = &ctx.task.envelope.subject {
            let letters: Vec<char> = subject.chars().filter(|c| c.is_alphabetic()).collect();
            let shouting = letters.len() >= 6 && letters.iter().all(|c| c.is_uppercase());
            if shouting {
                if let Some(metric) = active_metric(&ctx, &ctx.worker.metrics) {
                    insert_result(&ctx.task, metric, "SUBJECT_SHOUTING", 1.0, None);
                }
            }
        }
        RuleOutcome::Finished
    }
}

struct RawIpHeloRule;

#[async_trait]
impl NativeRule for RawIpHeloRule {
    async fn run(&self, ctx: RuleContext) -> RuleOutcome {
        let is_raw_ip = ctx
            .task
            .envelope
            .helo
            .as_ref()
            .map(|helo| {
                let bare = helo.trim_start_matches('[').trim_end_matches(']');
                bare.parse::<std::net::IpAddr>().is_ok()
            })
            .unwrap_or(false);
        if is_raw_ip {
            if let Some(metric) = active_metric(&ctx, &ctx.worker.metrics) {
                insert_result(&ctx.task, metric, "HELO_RAW_IP", 1.0, None);
            }
        }
        RuleOutcome::Finished
    }
}

struct ManyRecipientsRule {
    threshold: usize,
}

#[async_trait]
impl NativeRule for ManyRecipientsRule {
    async fn run(&self, ctx: RuleContext) -> RuleOutcome {
        let count = ctx.task.envelope.recipients.len();
        if count > self.threshold {
            if let Some(metric) = active_metric(&ctx, &ctx.worker.metrics) {
                insert_result(&ctx.task, metric, "MANY_RECIPIENTS", 1.0, Some(count.to_string()));
            }
        }
        RuleOutcome::Finished
    }
}

struct EmptyBodyRule;

#[async_trait]
impl NativeRule for EmptyBodyRule {
    async fn run(&self, ctx: RuleContext) -> RuleOutcome {
        let empty = ctx.task.message.iter().all(|b| b.is_ascii_whitespace());
        if empty {
            if let Some(metric) = active_metric(&ctx, &ctx.worker.metrics) {
                insert_result(&ctx.task, metric, "EMPTY_BODY", 1.0, None);
            }
        }
        RuleOutcome::Finished
    }
}

/// Sender/HELO mismatch: the envelope sender's domain doesn't appear
/// anywhere in the HELO/EHLO string the peer presented.
struct SenderHeloMismatchRule;

#[async_trait]
impl NativeRule for SenderHeloMismatchRule {
    async fn run(&self, ctx: RuleContext) -> RuleOutcome {
        let envelope = &ctx.task.envelope;
        let mismatch = match (&envelope.mail_from, &envelope.helo) {
            (Some(from), Some(helo)) => {
                let domain = from.rsplit('@').next().unwrap_or("").to_ascii_lowercase();
                !domain.is_empty() && !helo.to_ascii_lowercase().contains(&domain)
            }
            _ => false,
        };
        if mismatch {
            if let Some(metric) = active_metric(&ctx, &ctx.worker.metrics) {
                insert_result(&ctx.task, metric, "SENDER_HELO_MISMATCH", 1.0, None);
            }
        }
        RuleOutcome::Finished
    }
}

fn native(name: &str, priority: i32, rule: impl NativeRule + 'static, cache: &mut SymbolCache) {
    cache.add_symbol(
        RuleName::new(name).expect("builtin rule name fits the 128-byte bound"),
        priority,
        RuleBody::Native(Arc::new(rule)),
        SymbolKind::Normal,
        None,
    );
}

/// Registers the built-in native rules into `cache`. Scoring for each is
/// entirely driven by the loaded metric config (spec §3 "Metric"); a rule
/// that fires but has no `RuleScoreDef` under the active metric contributes
/// zero (spec §4.3 steps 1-2), so these are safe to always register
/// regardless of which metrics a deployment actually configures.
pub fn register_builtin_rules(cache: &mut SymbolCache) {
    native("MISSING_SUBJECT", 0, MissingSubjectRule, cache);
    native("SUBJECT_SHOUTING", 0, ShoutingSubjectRule, cache);
    native("HELO_RAW_IP", 0, RawIpHeloRule, cache);
    native("MANY_RECIPIENTS", 0, ManyRecipientsRule { threshold: 20 }, cache);
    native("EMPTY_BODY", 0, EmptyBodyRule, cache);
    native("SENDER_HELO_MISMATCH", 0, SenderHeloMismatchRule, cache);
}
