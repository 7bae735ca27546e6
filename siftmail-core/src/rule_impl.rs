//! The rule implementation contract (spec §4.4 "Rule runner").
//!
//! A rule may run to completion synchronously, or it may open watchers for
//! further async work and return a deferred continuation — the "closure"
//! return (`Q`) described in spec §4.4's watcher protocol. `Q` itself may
//! insert hits and return a further [`RuleOutcome::Deferred`], so the
//! protocol composes transitively without recursion limits beyond the
//! executor's own stack.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::task::Task;
use crate::worker::WorkerContext;

/// Bundles everything a running rule needs without reaching for statics
/// (spec §9 REDESIGN FLAG: "global and thread-local mutable state").
#[derive(Clone)]
pub struct RuleContext {
    pub task: Arc<Task>,
    pub worker: Arc<WorkerContext>,
}

/// What a rule run (or a deferred continuation `Q`) resolved to.
pub enum RuleOutcome {
    /// The rule (or `Q`) is fully finished; no further async work pending.
    Finished,
    /// Async sub-work was opened; `next` resolves once it completes and may
    /// itself insert hits and/or defer again.
    Deferred(BoxFuture<'static, RuleOutcome>),
}

impl RuleOutcome {
    pub fn is_finished(&self) -> bool {
        matches!(self, RuleOutcome::Finished)
    }
}

/// A non-scripted rule implementation: covers plain native-fn rules as well
/// as composite expressions and classifier scans, which dispatch through
/// this same trait rather than a dedicated enum arm (spec §4.4's
/// polymorphic rule dispatch).
#[async_trait]
pub trait NativeRule: Send + Sync {
    async fn run(&self, ctx: RuleContext) -> RuleOutcome;
}

/// The well-defined callback contract an embedded scripting VM's rules
/// interact with (spec §1: "its rules interact with the core only through a
/// well-defined callback contract"). The VM itself is out of scope; this
/// crate only defines the seam.
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    /// Invokes the named script callback, returning the same outcome shape
    /// as a native rule.
    async fn invoke(&self, callback_name: &str, ctx: RuleContext) -> RuleOutcome;
}

/// A rule backed by a plain synchronous closure, for tests and for small
/// built-in rules that never need to suspend.
pub struct SyncRule<F>(pub F)
where
    F: Fn(&RuleContext) + Send + Sync;

#[async_trait]
impl<F> NativeRule for SyncRule<F>
where
    F: Fn(&RuleContext) + Send + Sync,
{
    async fn run(&self, ctx: RuleContext) -> RuleOutcome {
        (self.0)(&ctx);
        RuleOutcome::Finished
    }
}
