//! Symbol cache (component B, spec §4.2): the rule registry, its dependency
//! graph, and per-rule statistics. Scheduling itself (the execution
//! algorithm over this registry) lives in [`scheduler`].

pub mod rule;
pub mod scheduler;
pub mod stats;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use siftmail_contracts::{RuleFlags, RuleId, RuleName, SymbolKind};
use tracing::warn;

use self::rule::{Condition, RuleBody, RuleDef};
use self::stats::{PeakCallback, RuleStatsSnapshot};

struct DelayedDependency {
    source: RuleId,
    target_name: String,
}

/// The rule registry: an arena of [`RuleDef`] indexed by [`RuleId`], plus
/// dependency side tables (spec §9 REDESIGN FLAG: "pointer graphs with
/// embedded hash handles" become "an arena of rules with stable integer ids"
/// and "id-keyed side tables").
pub struct SymbolCache {
    rules: Vec<RuleDef>,
    name_to_id: HashMap<String, RuleId>,
    dependencies: Vec<Vec<RuleId>>,
    delayed: RwLock<Vec<DelayedDependency>>,
    enabled: Vec<AtomicBool>,
    peak_callback: RwLock<Option<PeakCallback>>,
    next_id: AtomicU64,
}

impl Default for SymbolCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolCache {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            name_to_id: HashMap::new(),
            dependencies: Vec::new(),
            delayed: RwLock::new(Vec::new()),
            enabled: Vec::new(),
            peak_callback: RwLock::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    /// `add_symbol(name, priority, callback, userdata, kind, parent_id) -> id`
    ///
    /// `userdata` has no Rust analogue: the closure/trait object in `body`
    /// captures whatever state it needs directly.
    pub fn add_symbol(
        &mut self,
        name: RuleName,
        priority: i32,
        body: RuleBody,
        kind: SymbolKind,
        parent_id: Option<RuleId>,
    ) -> RuleId {
        let id = RuleId(self.next_id.fetch_add(1, Ordering::Relaxed) as u32);
        if self.name_to_id.contains_key(name.as_str()) {
            warn!(rule = %name, "duplicate rule registration; first registration wins");
            return *self.name_to_id.get(name.as_str()).unwrap();
        }
        self.name_to_id.insert(name.as_str().to_string(), id);
        self.rules.push(RuleDef {
            id,
            name,
            kind,
            base_weight: 0.0,
            priority,
            parent_id,
            body,
            conditions: Vec::new(),
            flags: RuleFlags::default(),
            stats: stats::RuleStats::default(),
            cost_seconds: AtomicU64::new(0),
        });
        self.dependencies.push(Vec::new());
        self.enabled.push(AtomicBool::new(true));
        id
    }

    pub fn set_base_weight(&mut self, id: RuleId, weight: f64) {
        self.rules[id.index()].base_weight = weight;
    }

    pub fn set_flags(&mut self, id: RuleId, flags: RuleFlags) {
        self.rules[id.index()].flags = flags;
    }

    /// `add_dependency(id_or_name, target_name)`.
    pub fn add_dependency(&mut self, source: RuleId, target: RuleId) {
        self.dependencies[source.index()].push(target);
    }

    /// `add_delayed_dependency(source_name, target_name)` — resolved once
    /// every rule has been registered (spec §4.2).
    pub fn add_delayed_dependency(&self, source: RuleId, target_name: impl Into<String>) {
        self.delayed.write().push(DelayedDependency {
            source,
            target_name: target_name.into(),
        });
    }

    /// `add_condition(id, predicate)` — multiple conditions AND-compose.
    pub fn add_condition(&mut self, id: RuleId, predicate: Condition) {
        self.rules[id.index()].conditions.push(predicate);
    }

    pub fn enable_symbol(&self, name: &str) {
        if let Some(id) = self.find_symbol(name) {
            self.enabled[id.index()].store(true, Ordering::Relaxed);
        }
    }

    pub fn disable_symbol(&self, name: &str) {
        if let Some(id) = self.find_symbol(name) {
            self.enabled[id.index()].store(false, Ordering::Relaxed);
        }
    }

    pub fn is_enabled(&self, id: RuleId) -> bool {
        self.enabled[id.index()].load(Ordering::Relaxed)
    }

    pub fn find_symbol(&self, name: &str) -> Option<RuleId> {
        self.name_to_id.get(name).copied()
    }

    pub fn rule(&self, id: RuleId) -> &RuleDef {
        &self.rules[id.index()]
    }

    pub fn rule_by_name(&self, name: &str) -> Option<&RuleDef> {
        self.find_symbol(name).map(|id| self.rule(id))
    }

    pub fn dependencies_of(&self, id: RuleId) -> &[RuleId] {
        &self.dependencies[id.index()]
    }

    pub fn all_rules(&self) -> &[RuleDef] {
        &self.rules
    }

    /// `inc_frequency(name)` — called when a symbol reports a hit.
    pub fn inc_frequency(&self, name: &str) {
        if let Some(rule) = self.rule_by_name(name) {
            let peak = self.peak_callback.read();
            rule.stats.record(true, 0.0, name, peak.as_ref());
        }
    }

    pub fn record_run(&self, id: RuleId, fired: bool, latency_secs: f64) {
        let rule = &self.rules[id.index()];
        let peak = self.peak_callback.read();
        rule.stats.record(fired, latency_secs, rule.name.as_str(), peak.as_ref());
        rule.set_cost(latency_secs);
    }

    pub fn set_peak_callback(&self, callback: PeakCallback) {
        *self.peak_callback.write() = Some(callback);
    }

    /// `stat_symbol(name) -> {frequency, stddev, mean_time, hits}`
    pub fn stat_symbol(&self, name: &str) -> Option<RuleStatsSnapshot> {
        self.rule_by_name(name).map(|r| r.stats.snapshot())
    }

    pub fn symbols_count(&self) -> usize {
        self.rules.len()
    }

    /// `validate(config, strict)`.
    ///
    /// Resolves delayed dependencies, checks for dependency cycles, and (in
    /// strict mode) requires every registered symbol to be referenced by at
    /// least one metric.
    pub fn validate(&mut self, referenced_by_metric: impl Fn(&str) -> bool, strict: bool) -> bool {
        // Resolve delayed dependencies; an unknown target means the edge is
        // dropped and the source still runs unconditionally (spec §4.2).
        let delayed = std::mem::take(&mut *self.delayed.write());
        for dep in delayed {
            match self.name_to_id.get(&dep.target_name).copied() {
                Some(target) => self.dependencies[dep.source.index()].push(target),
                None => {
                    warn!(
                        target = %dep.target_name,
                        source = %self.rules[dep.source.index()].name,
                        "delayed dependency target unknown; source will run unconditionally"
                    );
                }
            }
        }

        if self.has_cycle() {
            warn!("dependency cycle detected; refusing to validate");
            return false;
        }

        // Unknown parents: a Virtual whose parent id doesn't exist is logged
        // (the scheduler Skips it at run time, spec §4.2).
        for rule in &self.rules {
            if rule.kind == SymbolKind::Virtual {
                if let Some(parent) = rule.parent_id {
                    if parent.index() >= self.rules.len() {
                        warn!(symbol = %rule.name, "virtual symbol has unknown parent");
                    }
                }
            }
        }

        if strict {
            for rule in &self.rules {
                if !referenced_by_metric(rule.name.as_str()) {
                    warn!(symbol = %rule.name, "symbol not referenced by any metric");
                    return false;
                }
            }
        }

        true
    }

    fn has_cycle(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }
        let mut marks = vec![Mark::Unvisited; self.rules.len()];

        fn visit(
            node: usize,
            deps: &[Vec<RuleId>],
            marks: &mut [Mark],
        ) -> bool {
            match marks[node] {
                Mark::InProgress => return true,
                Mark::Done => return false,
                Mark::Unvisited => {}
            }
            marks[node] = Mark::InProgress;
            for dep in &deps[node] {
                if visit(dep.index(), deps, marks) {
                    return true;
                }
            }
            marks[node] = Mark::Done;
            false
        }

        (0..self.rules.len()).any(|node| visit(node, &self.dependencies, &mut marks))
    }

    /// `get_cksum()` — a stable 64-bit hash over the sorted name set,
    /// deterministic across restarts for identical configurations.
    pub fn get_cksum(&self) -> u64 {
        let mut names: Vec<&str> = self.rules.iter().map(|r| r.name.as_str()).collect();
        names.sort_unstable();
        let mut hasher = DefaultHasher::new();
        for name in names {
            name.hash(&mut hasher);
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule_impl::{RuleOutcome, SyncRule};
    use std::sync::Arc;

    fn body() -> RuleBody {
        RuleBody::Native(Arc::new(SyncRule(|_ctx| {})))
    }

    #[test]
    fn duplicate_registration_keeps_first() {
        let mut cache = SymbolCache::new();
        let first = cache.add_symbol(RuleName::new("DUP").unwrap(), 0, body(), SymbolKind::Normal, None);
        let second = cache.add_symbol(RuleName::new("DUP").unwrap(), 0, body(), SymbolKind::Normal, None);
        assert_eq!(first, second);
        assert_eq!(cache.symbols_count(), 1);
    }

    #[test]
    fn validate_detects_cycle() {
        let mut cache = SymbolCache::new();
        let a = cache.add_symbol(RuleName::new("A").unwrap(), 0, body(), SymbolKind::Normal, None);
        let b = cache.add_symbol(RuleName::new("B").unwrap(), 0, body(), SymbolKind::Normal, None);
        cache.add_dependency(a, b);
        cache.add_dependency(b, a);
        assert!(!cache.validate(|_| true, false));
    }

    #[test]
    fn unknown_delayed_dependency_drops_edge_but_validates() {
        let mut cache = SymbolCache::new();
        let a = cache.add_symbol(RuleName::new("A").unwrap(), 0, body(), SymbolKind::Normal, None);
        cache.add_delayed_dependency(a, "GHOST");
        assert!(cache.validate(|_| true, false));
        assert!(cache.dependencies_of(a).is_empty());
    }

    #[test]
    fn cksum_is_stable_across_reordered_insertion_of_same_set() {
        let mut c1 = SymbolCache::new();
        c1.add_symbol(RuleName::new("A").unwrap(), 0, body(), SymbolKind::Normal, None);
        c1.add_symbol(RuleName::new("B").unwrap(), 0, body(), SymbolKind::Normal, None);

        let mut c2 = SymbolCache::new();
        c2.add_symbol(RuleName::new("B").unwrap(), 0, body(), SymbolKind::Normal, None);
        c2.add_symbol(RuleName::new("A").unwrap(), 0, body(), SymbolKind::Normal, None);

        assert_eq!(c1.get_cksum(), c2.get_cksum());
    }
}
