//! Execution algorithm over the [`super::SymbolCache`] (spec §4.2).
//!
//! Four queues derived from the rule table, drained in this order:
//! pre-filter (ascending priority), static (topological over the dependency
//! DAG, ties broken `(priority_descending, cost_ascending)`), virtual
//! (resolved alongside its parent Callback, never scheduled directly), and
//! post-filter (ascending priority, after every other rule is terminal).

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use siftmail_contracts::{RuleId, SymbolKind};
use tracing::{debug, warn};

use crate::cache::rule::RuleState;
use crate::cache::SymbolCache;
use crate::rule_impl::{RuleContext, ScriptEngine};
use crate::runner::RuleRunner;
use crate::task::Task;

/// Drives one task's rules through the scheduler's state machine to
/// completion. Not `Clone`/`Send` across tasks — one instance per task run.
pub struct Scheduler<'a> {
    cache: &'a SymbolCache,
    states: Vec<RuleState>,
}

impl<'a> Scheduler<'a> {
    pub fn new(cache: &'a SymbolCache) -> Self {
        let states = vec![RuleState::Pending; cache.symbols_count()];
        Self { cache, states }
    }

    /// Runs every queue to completion for one task, in order (spec §4.2).
    pub async fn run(
        &mut self,
        task: &Arc<Task>,
        worker: &Arc<crate::worker::WorkerContext>,
        script_engine: Option<Arc<dyn ScriptEngine>>,
        pass_all: bool,
    ) {
        let runner = RuleRunner::new(script_engine);

        self.mark_virtuals_skipped_or_pending();
        self.drain_priority_ordered(task, worker, &runner, pass_all, QueueSelector::PreFilter)
            .await;
        self.drain_static_queue(task, worker, &runner, pass_all).await;
        self.drain_priority_ordered(task, worker, &runner, pass_all, QueueSelector::PostFilter)
            .await;
    }

    fn mark_virtuals_skipped_or_pending(&mut self) {
        for rule in self.cache.all_rules() {
            if rule.kind == SymbolKind::Virtual {
                let parent_ok = rule
                    .parent_id
                    .map(|p| p.index() < self.cache.all_rules().len())
                    .unwrap_or(false);
                self.states[rule.id.index()] = if parent_ok {
                    RuleState::Pending
                } else {
                    warn!(symbol = %rule.name, "virtual symbol has unknown parent; skipped");
                    RuleState::Skipped
                };
            }
        }
    }

    /// Drains the pre-filter or post-filter queue: ascending priority, no
    /// dependency ordering within the queue (spec §4.2 points 1 and 4).
    async fn drain_priority_ordered(
        &mut self,
        task: &Arc<Task>,
        worker: &Arc<crate::worker::WorkerContext>,
        runner: &RuleRunner,
        pass_all: bool,
        selector: QueueSelector,
    ) {
        let mut members: Vec<RuleId> = self
            .cache
            .all_rules()
            .iter()
            .filter(|r| selector.matches(r.kind))
            .map(|r| r.id)
            .collect();
        members.sort_by_key(|id| self.cache.rule(*id).priority);

        for id in members {
            if matches!(selector, QueueSelector::PreFilter) && task.pre_result().is_some() {
                // A pre-result short-circuits remaining pre-filters, but
                // work already scheduled (there is none here, since this
                // loop runs sequentially) still completes (spec §4.2 point 1).
                debug!("pre-result already set; skipping remaining pre-filters");
                break;
            }
            self.run_one(task, worker, runner, pass_all, id).await;
        }
    }

    /// Drains the static queue (Normal/Callback rules) with dependency-DAG
    /// readiness evaluation and `(priority_descending, cost_ascending)`
    /// tie-breaks, running all currently-ready rules concurrently each round.
    async fn drain_static_queue(
        &mut self,
        task: &Arc<Task>,
        worker: &Arc<crate::worker::WorkerContext>,
        runner: &RuleRunner,
        pass_all: bool,
    ) {
        let members: Vec<RuleId> = self
            .cache
            .all_rules()
            .iter()
            .filter(|r| matches!(r.kind, SymbolKind::Normal | SymbolKind::Callback))
            .map(|r| r.id)
            .collect();

        loop {
            let ready = self.collect_ready(&members, task, pass_all);
            if ready.is_empty() {
                break;
            }

            let mut in_flight = FuturesUnordered::new();
            for id in ready {
                self.states[id.index()] = RuleState::Running;
                let cache = self.cache;
                let runner = runner;
                let task = task.clone();
                let worker = worker.clone();
                in_flight.push(async move {
                    let rule = cache.rule(id);
                    let session = task.session.clone();
                    let ctx = RuleContext { task, worker };
                    runner.run(cache, &session, ctx, rule).await;
                    id
                });
            }

            while let Some(finished_id) = in_flight.next().await {
                self.states[finished_id.index()] = RuleState::Finished;
                self.contribute_virtual_children(finished_id, task);
            }
        }

        // Any rule never reached (a cycle would have failed `validate`
        // already, so this only covers disabled/condition-false leftovers)
        // is explicitly Skipped so dependents and post-filters see a
        // terminal state (spec §4.2: "A rule becomes ready when all its
        // dependencies are in terminal state").
        for id in &members {
            if !self.states[id.index()].is_terminal() {
                self.states[id.index()] = RuleState::Skipped;
            }
        }
    }

    /// Runs a single pre-/post-filter rule to completion, honoring the
    /// administrative `ignore`/`skipped` flags and its conditions the same
    /// way the static queue's [`Self::is_ready`] does, but without
    /// dependency-DAG gating: pre/post filters are drained strictly by
    /// priority (spec §4.2 queues 1 and 4).
    async fn run_one(
        &mut self,
        task: &Arc<Task>,
        worker: &Arc<crate::worker::WorkerContext>,
        runner: &RuleRunner,
        pass_all: bool,
        id: RuleId,
    ) {
        let rule = self.cache.rule(id);

        if rule.flags.ignore || !self.cache.is_enabled(id) {
            self.states[id.index()] = RuleState::Skipped;
            return;
        }
        if !pass_all && rule.flags.skipped {
            self.states[id.index()] = RuleState::Skipped;
            return;
        }
        if !rule.evaluate_conditions(task) {
            self.states[id.index()] = RuleState::Skipped;
            return;
        }

        self.states[id.index()] = RuleState::Running;
        let ctx = RuleContext { task: task.clone(), worker: worker.clone() };
        let session = task.session.clone();
        runner.run(self.cache, &session, ctx, rule).await;
        self.states[id.index()] = RuleState::Finished;
    }

    fn collect_ready(&mut self, members: &[RuleId], task: &Task, pass_all: bool) -> Vec<RuleId> {
        let mut ready: Vec<RuleId> = members
            .iter()
            .copied()
            .filter(|id| self.states[id.index()] == RuleState::Pending)
            .filter(|id| self.is_ready(*id, task, pass_all))
            .collect();

        // (priority_descending, cost_ascending) tie-break (spec §4.2 point 2).
        ready.sort_by(|a, b| {
            let ra = self.cache.rule(*a);
            let rb = self.cache.rule(*b);
            rb.priority
                .cmp(&ra.priority)
                .then(ra.cost().partial_cmp(&rb.cost()).unwrap_or(std::cmp::Ordering::Equal))
        });
        ready
    }

    fn is_ready(&self, id: RuleId, task: &Task, pass_all: bool) -> bool {
        let rule = self.cache.rule(id);

        if rule.flags.ignore || !self.cache.is_enabled(id) {
            return false;
        }
        if !pass_all && rule.flags.skipped {
            return false;
        }

        let deps_terminal = self
            .cache
            .dependencies_of(id)
            .iter()
            .all(|dep| self.states[dep.index()].is_terminal());
        if !deps_terminal {
            return false;
        }

        rule.evaluate_conditions(task)
    }

    /// When a Callback finishes, any Virtual child it owns becomes terminal
    /// too: its hit (if the parent inserted one under the child's name) is
    /// already on the task's hit table via ordinary `insert_result` calls
    /// made by the parent's implementation; the scheduler just needs to mark
    /// the state so dependents and post-filters see it as terminal, and feed
    /// its frequency statistics if it actually fired (spec §4.2 point 3).
    fn contribute_virtual_children(&mut self, parent: RuleId, task: &Task) {
        let children: Vec<RuleId> = self
            .cache
            .all_rules()
            .iter()
            .filter(|r| r.kind == SymbolKind::Virtual && r.parent_id == Some(parent))
            .map(|r| r.id)
            .collect();
        for child in children {
            if self.states[child.index()] == RuleState::Pending {
                let name = self.cache.rule(child).name.as_str().to_string();
                let fired = task
                    .all_metric_results()
                    .values()
                    .any(|r| r.hits.contains_key(&name));
                self.cache.record_run(child, fired, 0.0);
                self.states[child.index()] = RuleState::Finished;
            }
        }
    }

    pub fn state_of(&self, id: RuleId) -> RuleState {
        self.states[id.index()]
    }

    pub fn states_snapshot(&self) -> HashMap<RuleId, RuleState> {
        self.states
            .iter()
            .enumerate()
            .map(|(i, s)| (RuleId(i as u32), *s))
            .collect()
    }
}

#[derive(Clone, Copy)]
enum QueueSelector {
    PreFilter,
    PostFilter,
}

impl QueueSelector {
    fn matches(self, kind: SymbolKind) -> bool {
        match self {
            QueueSelector::PreFilter => kind == SymbolKind::PreFilter,
            QueueSelector::PostFilter => kind == SymbolKind::PostFilter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule_impl::{NativeRule, RuleOutcome};
    use crate::scoring::engine::insert_result;
    use crate::scoring::metric::{Metric, MetricTable};
    use crate::task::Envelope;
    use crate::worker::WorkerContext;
    use async_trait::async_trait;
    use siftmail_contracts::RuleName;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MarkRule {
        name: &'static str,
        flag: Arc<AtomicBool>,
    }

    #[async_trait]
    impl NativeRule for MarkRule {
        async fn run(&self, ctx: RuleContext) -> RuleOutcome {
            self.flag.store(true, Ordering::SeqCst);
            let metric = ctx.worker.metrics.default_metric().unwrap();
            insert_result(&ctx.task, metric, self.name, 1.0, None);
            RuleOutcome::Finished
        }
    }

    fn new_worker(cache: Arc<SymbolCache>) -> Arc<WorkerContext> {
        let mut metrics = MetricTable::new();
        metrics.insert(Metric::new(MetricTable::DEFAULT_METRIC));
        Arc::new(WorkerContext::new(cache, Arc::new(metrics)))
    }

    #[tokio::test]
    async fn dependency_gates_ready_even_with_lower_priority() {
        let mut cache = SymbolCache::new();
        let b_ran = Arc::new(AtomicBool::new(false));
        let a_ran = Arc::new(AtomicBool::new(false));

        let a = cache.add_symbol(
            RuleName::new("A").unwrap(),
            0,
            crate::cache::rule::RuleBody::Native(Arc::new(MarkRule {
                name: "A",
                flag: a_ran.clone(),
            })),
            SymbolKind::Normal,
            None,
        );
        let b = cache.add_symbol(
            RuleName::new("B").unwrap(),
            10,
            crate::cache::rule::RuleBody::Native(Arc::new(MarkRule {
                name: "B",
                flag: b_ran.clone(),
            })),
            SymbolKind::Normal,
            None,
        );
        cache.add_dependency(b, a);
        assert!(cache.validate(|_| true, false));

        let cache = Arc::new(cache);
        let worker = new_worker(cache.clone());
        let (task, _rx) = Task::new(b"hi".to_vec(), Envelope::default());
        let task = Arc::new(task);

        let mut scheduler = Scheduler::new(&cache);
        scheduler.run(&task, &worker, None, false).await;

        assert!(a_ran.load(Ordering::SeqCst));
        assert!(b_ran.load(Ordering::SeqCst));
        assert_eq!(scheduler.state_of(a), RuleState::Finished);
        assert_eq!(scheduler.state_of(b), RuleState::Finished);
    }

    #[tokio::test]
    async fn disabled_symbol_is_skipped_not_run() {
        let mut cache = SymbolCache::new();
        let ran = Arc::new(AtomicBool::new(false));
        let id = cache.add_symbol(
            RuleName::new("OFF").unwrap(),
            0,
            crate::cache::rule::RuleBody::Native(Arc::new(MarkRule {
                name: "OFF",
                flag: ran.clone(),
            })),
            SymbolKind::Normal,
            None,
        );
        cache.disable_symbol("OFF");
        assert!(cache.validate(|_| true, false));

        let cache = Arc::new(cache);
        let worker = new_worker(cache.clone());
        let (task, _rx) = Task::new(b"hi".to_vec(), Envelope::default());
        let task = Arc::new(task);

        let mut scheduler = Scheduler::new(&cache);
        scheduler.run(&task, &worker, None, false).await;

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(scheduler.state_of(id), RuleState::Skipped);
    }

    #[tokio::test]
    async fn prefilter_pre_result_short_circuits_remaining_prefilters() {
        use siftmail_contracts::Action;

        let mut cache = SymbolCache::new();
        let second_ran = Arc::new(AtomicBool::new(false));

        struct SetPreResult;
        #[async_trait]
        impl NativeRule for SetPreResult {
            async fn run(&self, ctx: RuleContext) -> RuleOutcome {
                ctx.task.set_pre_result(Action::Reject, Some("blocked".into()));
                RuleOutcome::Finished
            }
        }

        cache.add_symbol(
            RuleName::new("FIRST").unwrap(),
            0,
            crate::cache::rule::RuleBody::Native(Arc::new(SetPreResult)),
            SymbolKind::PreFilter,
            None,
        );
        cache.add_symbol(
            RuleName::new("SECOND").unwrap(),
            1,
            crate::cache::rule::RuleBody::Native(Arc::new(MarkRule {
                name: "SECOND",
                flag: second_ran.clone(),
            })),
            SymbolKind::PreFilter,
            None,
        );
        assert!(cache.validate(|_| true, false));

        let cache = Arc::new(cache);
        let worker = new_worker(cache.clone());
        let (task, _rx) = Task::new(b"hi".to_vec(), Envelope::default());
        let task = Arc::new(task);

        let mut scheduler = Scheduler::new(&cache);
        scheduler.run(&task, &worker, None, false).await;

        assert!(!second_ran.load(Ordering::SeqCst));
        assert_eq!(task.pre_result().unwrap().action, Action::Reject);
    }
}
