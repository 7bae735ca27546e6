//! Per-worker shared context.
//!
//! Spec §5 calls for "global and thread-local mutable state" to be rewritten
//! as "a per-worker context struct passed explicitly to every operation."
//! [`WorkerContext`] is that struct: one instance per worker process, built
//! once at startup from the immutable, post-fork-frozen configuration, and
//! threaded through the scheduler, rule runner, and scoring engine instead of
//! reached for via statics.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use regex::Regex;
use uuid::Uuid;

use crate::cache::SymbolCache;
use crate::scoring::metric::MetricTable;
use crate::upstream::{UpstreamPool, UpstreamStrategy};

/// Regex compilation is expensive; rules that reference the same pattern
/// share one compiled [`Regex`] for the lifetime of the worker.
#[derive(Default)]
pub struct RegexCache {
    inner: dashmap::DashMap<String, Arc<Regex>>,
}

impl RegexCache {
    pub fn get_or_compile(&self, pattern: &str) -> Result<Arc<Regex>, regex::Error> {
        if let Some(existing) = self.inner.get(pattern) {
            return Ok(existing.clone());
        }
        let compiled = Arc::new(Regex::new(pattern)?);
        self.inner.insert(pattern.to_string(), compiled.clone());
        Ok(compiled)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Counters surfaced by the `counters` CLI command (spec §6.6). Fuzzy-store
/// counters live on `FuzzyStore` itself, not here, since a worker has no
/// fuzzy traffic of its own to count outside of what the store already
/// tracks.
#[derive(Default)]
pub struct WorkerCounters {
    pub tasks_scanned: AtomicU64,
    pub tasks_timed_out: AtomicU64,
}

impl WorkerCounters {
    pub fn inc_scanned(&self) {
        self.tasks_scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timed_out(&self) {
        self.tasks_timed_out.fetch_add(1, Ordering::Relaxed);
    }
}

/// Immutable-after-load state shared by every task a worker processes.
///
/// Built once before the worker's event loop starts; never mutated except
/// through the interior atomics/concurrent maps it explicitly exposes
/// (symbol frequency/stddev/mean-latency slots, regex cache, counters).
pub struct WorkerContext {
    pub worker_id: Uuid,
    pub symbol_cache: Arc<SymbolCache>,
    pub metrics: Arc<MetricTable>,
    pub regex_cache: Arc<RegexCache>,
    pub counters: Arc<WorkerCounters>,
    /// Named upstream pools (spec §4.7), available to any native rule that
    /// needs to pick a live peer for a logical endpoint (e.g. a DNSBL
    /// lookup rule); empty unless the deployment's config declares any.
    pub upstream_pools: HashMap<String, (UpstreamPool, UpstreamStrategy)>,
}

impl WorkerContext {
    pub fn new(symbol_cache: Arc<SymbolCache>, metrics: Arc<MetricTable>) -> Self {
        Self::with_upstream_pools(symbol_cache, metrics, HashMap::new())
    }

    pub fn with_upstream_pools(
        symbol_cache: Arc<SymbolCache>,
        metrics: Arc<MetricTable>,
        upstream_pools: HashMap<String, (UpstreamPool, UpstreamStrategy)>,
    ) -> Self {
        Self {
            worker_id: Uuid::now_v7(),
            symbol_cache,
            metrics,
            regex_cache: Arc::new(RegexCache::default()),
            counters: Arc::new(WorkerCounters::default()),
            upstream_pools,
        }
    }
}
