//! Rule runner (component D, spec §4.4).

pub mod composite;

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug_span, Instrument};

use crate::cache::rule::{RuleBody, RuleDef};
use crate::cache::SymbolCache;
use crate::rule_impl::{RuleContext, RuleOutcome, ScriptEngine};
use crate::session::AsyncSession;

/// Dispatches to the polymorphic rule implementations and drives the
/// watcher protocol (spec §4.4) to completion.
pub struct RuleRunner {
    pub script_engine: Option<Arc<dyn ScriptEngine>>,
}

impl RuleRunner {
    pub fn new(script_engine: Option<Arc<dyn ScriptEngine>>) -> Self {
        Self { script_engine }
    }

    /// Runs one rule to full completion, including chasing any deferred
    /// continuation the watcher protocol produces. Updates the rule's
    /// frequency/stddev/mean-latency statistics on the shared
    /// [`SymbolCache`] when done.
    pub async fn run(&self, cache: &SymbolCache, session: &AsyncSession, ctx: RuleContext, rule: &RuleDef) {
        let span = debug_span!("rule_run", rule = %rule.name, kind = ?rule.kind);
        let start = Instant::now();

        let first_outcome = self.dispatch(ctx.clone(), rule).instrument(span.clone()).await;

        let mut outcome = first_outcome;
        loop {
            match outcome {
                RuleOutcome::Finished => break,
                RuleOutcome::Deferred(fut) => {
                    // A still-open watcher: the task cannot finalize until
                    // this deferred continuation resolves (spec §4.1/§4.4).
                    let watcher = session.push_watcher();
                    outcome = fut.instrument(span.clone()).await;
                    session.pop_watcher(watcher);
                }
            }
        }

        let latency = start.elapsed().as_secs_f64();
        let fired = ctx
            .task
            .all_metric_results()
            .values()
            .any(|m| m.hits.contains_key(rule.name.as_str()));
        cache.record_run(rule.id, fired, latency);
    }

    async fn dispatch(&self, ctx: RuleContext, rule: &RuleDef) -> RuleOutcome {
        match &rule.body {
            RuleBody::Native(native) => native.run(ctx).await,
            RuleBody::Script(callback_name) => match &self.script_engine {
                Some(engine) => engine.invoke(callback_name, ctx).await,
                None => RuleOutcome::Finished,
            },
        }
    }
}
