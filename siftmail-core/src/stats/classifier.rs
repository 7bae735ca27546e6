//! Per-classifier runtime and the scan/learn pipelines (spec §4.6 steps 2-5,
//! "Learning").

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::backend::{StatBackend, StatRuntimeHandle};
use super::tokenizer::{tokenize_osb, Token};
use crate::error::{EngineError, Result};
use crate::rule_impl::{NativeRule, RuleContext, RuleOutcome};
use crate::scoring::engine::insert_result;
use crate::scoring::SymbolHit;

/// Stage marker for a classifier's per-task runtime (spec §3 "Classifier
/// runtime"): `{Pre, Processed, Post}`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    Pre,
    Processed,
    Post,
}

/// A per-class persistent map definition (spec §3 "Statfile").
#[derive(Clone)]
pub struct StatfileDef {
    pub symbol: String,
    pub is_spam: bool,
    pub backend: Arc<dyn StatBackend>,
    pub path: String,
}

/// Learn cache outcome for one statfile (spec §4.6 "Learning" step 1).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LearnCacheVerdict {
    Allow,
    Ignore,
    Unlearn,
}

/// Deduplicates repeat-learn requests for the same message, mirroring spec's
/// "learn cache" backend contract without naming a concrete implementation.
pub trait LearnCache: Send + Sync {
    fn check(&self, message_digest: &str, classifier: &str, is_spam: bool) -> LearnCacheVerdict;
    fn record(&self, message_digest: &str, classifier: &str, is_spam: bool);
}

/// A classifier definition: its statfiles, and the token-count gates from
/// spec §4.6 step 3 ("Respect `min_tokens`... `max_tokens`").
pub struct ClassifierDef {
    pub name: String,
    pub statfiles: Vec<StatfileDef>,
    pub min_tokens: usize,
    pub max_tokens: usize,
}

/// Per-task, per-classifier runtime (spec §3): the deduplicated token tree,
/// each statfile's per-task handle, and the current [`Stage`].
pub struct ClassifierRuntime {
    pub classifier: String,
    pub tokens: Vec<Token>,
    pub statfile_handles: HashMap<String, StatRuntimeHandle>,
    pub stage: Stage,
    skipped: bool,
}

impl ClassifierRuntime {
    fn skipped_for_token_count(def: &ClassifierDef, token_count: usize) -> bool {
        token_count < def.min_tokens
    }

    /// Clips the token tree to `max_tokens`, matching "runner stops feeding
    /// tokens into a classifier once reached" (spec §4.6 step 3).
    fn clipped_tokens(def: &ClassifierDef, tokens: &[Token]) -> Vec<Token> {
        if tokens.len() > def.max_tokens {
            tokens[..def.max_tokens].to_vec()
        } else {
            tokens.to_vec()
        }
    }
}

/// Runs the scan-time pipeline for one classifier against already-tokenized
/// input (spec §4.6 steps 2-4): pre-process, process tokens respecting
/// `min_tokens`/`max_tokens`, then classify.
#[instrument(skip(def, tokens, classify_fn), fields(classifier = %def.name))]
pub async fn run_classifier_scan(
    def: &ClassifierDef,
    tokens: &[Token],
    classify_fn: impl Fn(&ClassifierRuntime, &HashMap<String, HashMap<u64, u64>>) -> Vec<SymbolHit>,
) -> Result<Vec<SymbolHit>> {
    if ClassifierRuntime::skipped_for_token_count(def, tokens.len()) {
        debug!(token_count = tokens.len(), min = def.min_tokens, "classifier skipped: below min_tokens");
        return Ok(Vec::new());
    }

    let clipped = ClassifierRuntime::clipped_tokens(def, tokens);

    let mut runtime = ClassifierRuntime {
        classifier: def.name.clone(),
        tokens: clipped.clone(),
        statfile_handles: HashMap::new(),
        stage: Stage::Pre,
        skipped: false,
    };

    let mut per_statfile_counts: HashMap<String, HashMap<u64, u64>> = HashMap::new();
    for statfile in &def.statfiles {
        let handle = statfile.backend.runtime(&statfile.path).await?;
        let counts = statfile.backend.process_tokens(&handle, &clipped).await?;
        statfile.backend.finalize_process(&handle).await?;
        per_statfile_counts.insert(statfile.symbol.clone(), counts);
        runtime.statfile_handles.insert(statfile.symbol.clone(), handle);
    }
    runtime.stage = Stage::Processed;

    let hits = classify_fn(&runtime, &per_statfile_counts);
    runtime.stage = Stage::Post;
    let _ = runtime.skipped;

    Ok(hits)
}

/// Runs `learn(task, is_spam, classifier_name)` (spec §4.6 "Learning").
///
/// `message_digest` identifies the message for the learn cache. Returns
/// `Err(EngineError::Protocol(...))` ("already learned") when the cache
/// reports [`LearnCacheVerdict::Ignore`] for every registered cache.
pub async fn learn(
    def: &ClassifierDef,
    message_digest: &str,
    is_spam: bool,
    tokens: &[Token],
    caches: &[Arc<dyn LearnCache>],
) -> Result<()> {
    let mut unlearn = false;
    for cache in caches {
        match cache.check(message_digest, &def.name, is_spam) {
            LearnCacheVerdict::Ignore => {
                return Err(EngineError::Protocol(format!(
                    "message already learned as {} for classifier {}",
                    if is_spam { "spam" } else { "ham" },
                    def.name
                )));
            }
            LearnCacheVerdict::Unlearn => unlearn = true,
            LearnCacheVerdict::Allow => {}
        }
    }

    let clipped = ClassifierRuntime::clipped_tokens(def, tokens);

    for statfile in &def.statfiles {
        let participates = statfile.is_spam == is_spam || unlearn;
        if !participates {
            continue;
        }

        let handle = statfile.backend.runtime(&statfile.path).await?;
        let delta: i64 = if statfile.is_spam == is_spam {
            1
        } else {
            // Opposite-class statfile during an unlearn: decrement (spec
            // §4.6 step 2: "the opposite-class statfiles decrement their
            // learn counts").
            -1
        };

        statfile.backend.learn_tokens(&handle, &clipped, delta).await?;

        if delta > 0 {
            statfile.backend.inc_learns(&statfile.path).await?;
        } else {
            statfile.backend.dec_learns(&statfile.path).await?;
        }

        statfile.backend.finalize_learn(&handle).await?;
    }

    for cache in caches {
        cache.record(message_digest, &def.name, is_spam);
    }

    if unlearn {
        warn!(classifier = %def.name, "unlearn applied: opposite-class statfiles decremented");
    }

    Ok(())
}

/// Default classify function (spec §4.6 step 4: "bayes-style classifier").
///
/// Each statfile's vote is the token-count-weighted sum of its per-token
/// learn counts, divided by how many times that statfile has been learned
/// overall so a heavily-trained statfile doesn't win purely on volume.
/// Votes are then normalized into a `[0, 1]` confidence across every
/// statfile in the classifier; only the statfile holding an outright
/// majority fires, and its confidence becomes the hit's multiplier (spec:
/// "emits 0, 1, or more symbol hits with weights").
pub fn bayes_vote(
    tokens: &[Token],
    counts: &HashMap<String, HashMap<u64, u64>>,
    total_learns: &HashMap<String, i64>,
) -> Vec<SymbolHit> {
    let mut votes: HashMap<&str, f64> = HashMap::new();
    for (symbol, statfile_counts) in counts {
        let raw: f64 = tokens
            .iter()
            .filter_map(|t| statfile_counts.get(&t.hash).map(|c| *c as f64 * t.count as f64))
            .sum();
        let learned = total_learns.get(symbol.as_str()).copied().unwrap_or(0).max(0) as f64;
        votes.insert(symbol.as_str(), raw / (learned + 1.0));
    }

    let total: f64 = votes.values().sum();
    if total <= 0.0 {
        return Vec::new();
    }

    votes
        .into_iter()
        .map(|(symbol, score)| (symbol, score / total))
        .filter(|(_, confidence)| *confidence > 0.5)
        .map(|(symbol, confidence)| SymbolHit {
            rule_name: symbol.to_string(),
            score: confidence,
            options: Vec::new(),
            shots: 0,
        })
        .collect()
}

/// Wires one classifier into the live scan path as a [`NativeRule`] (spec
/// §4.4's "classifier-batch" dispatch variant), the same way composite
/// rules wire in through [`RuleBody::Native`][crate::cache::rule::RuleBody]
/// rather than a dedicated enum arm: it tokenizes the task's raw message,
/// runs the scan pipeline, and scores whichever statfile wins the vote.
pub struct ClassifierScanRule {
    def: Arc<ClassifierDef>,
}

impl ClassifierScanRule {
    pub fn new(def: Arc<ClassifierDef>) -> Self {
        Self { def }
    }
}

#[async_trait]
impl NativeRule for ClassifierScanRule {
    async fn run(&self, ctx: RuleContext) -> RuleOutcome {
        let text = String::from_utf8_lossy(&ctx.task.message);
        let tokens = tokenize_osb(&text);

        let mut total_learns = HashMap::new();
        for statfile in &self.def.statfiles {
            match statfile.backend.total_learns(&statfile.path).await {
                Ok(total) => {
                    total_learns.insert(statfile.symbol.clone(), total);
                }
                Err(err) => {
                    warn!(
                        classifier = %self.def.name,
                        symbol = %statfile.symbol,
                        error = %err,
                        "failed to read statfile learn count; scan continues without it"
                    );
                }
            }
        }

        let hits = run_classifier_scan(&self.def, &tokens, |runtime, counts| {
            bayes_vote(&runtime.tokens, counts, &total_learns)
        })
        .await;

        match hits {
            Ok(hits) => {
                if let Some(metric) = ctx.worker.metrics.active_for(&ctx.task) {
                    for hit in &hits {
                        insert_result(&ctx.task, metric, &hit.rule_name, hit.score, None);
                    }
                }
            }
            Err(err) => {
                warn!(classifier = %self.def.name, error = %err, "classifier scan failed");
            }
        }

        RuleOutcome::Finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    struct CountingBackend {
        counts: Mutex<HashMap<u64, u64>>,
        learn_calls: Mutex<u32>,
        learns_total: Mutex<i64>,
    }

    impl CountingBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                counts: Mutex::new(HashMap::new()),
                learn_calls: Mutex::new(0),
                learns_total: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl StatBackend for CountingBackend {
        async fn init(&self, _statfile: &str) -> Result<()> {
            Ok(())
        }

        async fn runtime(&self, statfile: &str) -> Result<StatRuntimeHandle> {
            Ok(StatRuntimeHandle {
                statfile: statfile.to_string(),
            })
        }

        async fn process_tokens(
            &self,
            _handle: &StatRuntimeHandle,
            tokens: &[Token],
        ) -> Result<HashMap<u64, u64>> {
            let counts = self.counts.lock();
            Ok(tokens
                .iter()
                .filter_map(|t| counts.get(&t.hash).map(|c| (t.hash, *c)))
                .collect())
        }

        async fn finalize_process(&self, _handle: &StatRuntimeHandle) -> Result<()> {
            Ok(())
        }

        async fn learn_tokens(&self, _handle: &StatRuntimeHandle, tokens: &[Token], delta: i64) -> Result<()> {
            *self.learn_calls.lock() += 1;
            let mut counts = self.counts.lock();
            for token in tokens {
                let entry = counts.entry(token.hash).or_insert(0);
                *entry = (*entry as i64 + delta * token.count as i64).max(0) as u64;
            }
            Ok(())
        }

        async fn finalize_learn(&self, _handle: &StatRuntimeHandle) -> Result<()> {
            Ok(())
        }

        async fn total_learns(&self, _statfile: &str) -> Result<i64> {
            Ok(*self.learns_total.lock())
        }

        async fn inc_learns(&self, _statfile: &str) -> Result<i64> {
            let mut total = self.learns_total.lock();
            *total += 1;
            Ok(*total)
        }

        async fn dec_learns(&self, _statfile: &str) -> Result<i64> {
            let mut total = self.learns_total.lock();
            *total -= 1;
            Ok(*total)
        }

        async fn get_stat(&self, _statfile: &str, token_hash: u64) -> Result<u64> {
            Ok(*self.counts.lock().get(&token_hash).unwrap_or(&0))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct NoopCache;
    impl LearnCache for NoopCache {
        fn check(&self, _digest: &str, _classifier: &str, _is_spam: bool) -> LearnCacheVerdict {
            LearnCacheVerdict::Allow
        }
        fn record(&self, _digest: &str, _classifier: &str, _is_spam: bool) {}
    }

    struct SeenOnceCache {
        seen: Mutex<HashSet<(String, String, bool)>>,
    }
    impl SeenOnceCache {
        fn new() -> Self {
            Self { seen: Mutex::new(HashSet::new()) }
        }
    }
    impl LearnCache for SeenOnceCache {
        fn check(&self, digest: &str, classifier: &str, is_spam: bool) -> LearnCacheVerdict {
            if self.seen.lock().contains(&(digest.to_string(), classifier.to_string(), is_spam)) {
                LearnCacheVerdict::Ignore
            } else {
                LearnCacheVerdict::Allow
            }
        }
        fn record(&self, digest: &str, classifier: &str, is_spam: bool) {
            self.seen.lock().insert((digest.to_string(), classifier.to_string(), is_spam));
        }
    }

    fn def_with(statfiles: Vec<StatfileDef>) -> ClassifierDef {
        ClassifierDef {
            name: "bayes".to_string(),
            statfiles,
            min_tokens: 1,
            max_tokens: 10_000,
        }
    }

    #[tokio::test]
    async fn learn_increments_matching_statfile_once() {
        let spam_backend = CountingBackend::new();
        let ham_backend = CountingBackend::new();
        let def = def_with(vec![
            StatfileDef { symbol: "BAYES_SPAM".into(), is_spam: true, backend: spam_backend.clone(), path: "spam".into() },
            StatfileDef { symbol: "BAYES_HAM".into(), is_spam: false, backend: ham_backend.clone(), path: "ham".into() },
        ]);
        let tokens = vec![Token { hash: 42, count: 1 }];
        let caches: Vec<Arc<dyn LearnCache>> = vec![Arc::new(NoopCache)];

        learn(&def, "digest-1", true, &tokens, &caches).await.unwrap();

        assert_eq!(spam_backend.total_learns("spam").await.unwrap(), 1);
        assert_eq!(ham_backend.total_learns("ham").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn repeated_learn_of_same_class_is_rejected_by_cache() {
        let spam_backend = CountingBackend::new();
        let def = def_with(vec![StatfileDef {
            symbol: "BAYES_SPAM".into(),
            is_spam: true,
            backend: spam_backend,
            path: "spam".into(),
        }]);
        let tokens = vec![Token { hash: 7, count: 1 }];
        let caches: Vec<Arc<dyn LearnCache>> = vec![Arc::new(SeenOnceCache::new())];

        learn(&def, "digest-2", true, &tokens, &caches).await.unwrap();
        let second = learn(&def, "digest-2", true, &tokens, &caches).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn unlearn_decrements_opposite_class_statfile() {
        let spam_backend = CountingBackend::new();
        let ham_backend = CountingBackend::new();
        let def = def_with(vec![
            StatfileDef { symbol: "BAYES_SPAM".into(), is_spam: true, backend: spam_backend.clone(), path: "spam".into() },
            StatfileDef { symbol: "BAYES_HAM".into(), is_spam: false, backend: ham_backend.clone(), path: "ham".into() },
        ]);
        let tokens = vec![Token { hash: 9, count: 1 }];

        struct UnlearnCache;
        impl LearnCache for UnlearnCache {
            fn check(&self, _d: &str, _c: &str, _spam: bool) -> LearnCacheVerdict {
                LearnCacheVerdict::Unlearn
            }
            fn record(&self, _d: &str, _c: &str, _spam: bool) {}
        }
        let caches: Vec<Arc<dyn LearnCache>> = vec![Arc::new(UnlearnCache)];

        learn(&def, "digest-3", false, &tokens, &caches).await.unwrap();

        assert_eq!(spam_backend.total_learns("spam").await.unwrap(), -1);
        assert_eq!(ham_backend.total_learns("ham").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scan_skips_classifier_below_min_tokens() {
        let backend = CountingBackend::new();
        let mut def = def_with(vec![StatfileDef {
            symbol: "BAYES_SPAM".into(),
            is_spam: true,
            backend,
            path: "spam".into(),
        }]);
        def.min_tokens = 5;
        let tokens = vec![Token { hash: 1, count: 1 }];

        let hits = run_classifier_scan(&def, &tokens, |_rt, _counts| vec![]).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn learning_spam_then_scanning_fires_bayes_spam() {
        let spam_backend = CountingBackend::new();
        let ham_backend = CountingBackend::new();
        let def = def_with(vec![
            StatfileDef { symbol: "BAYES_SPAM".into(), is_spam: true, backend: spam_backend.clone(), path: "spam".into() },
            StatfileDef { symbol: "BAYES_HAM".into(), is_spam: false, backend: ham_backend.clone(), path: "ham".into() },
        ]);
        let tokens = vec![Token { hash: 42, count: 3 }, Token { hash: 43, count: 1 }];
        let caches: Vec<Arc<dyn LearnCache>> = vec![Arc::new(NoopCache)];

        learn(&def, "digest-bayes", true, &tokens, &caches).await.unwrap();

        let spam_total = spam_backend.total_learns("spam").await.unwrap();
        let ham_total = ham_backend.total_learns("ham").await.unwrap();
        let mut totals = HashMap::new();
        totals.insert("BAYES_SPAM".to_string(), spam_total);
        totals.insert("BAYES_HAM".to_string(), ham_total);

        let hits = run_classifier_scan(&def, &tokens, |runtime, counts| bayes_vote(&runtime.tokens, counts, &totals))
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].rule_name, "BAYES_SPAM");
        assert!(hits[0].score > 0.0);
    }

    #[test]
    fn bayes_vote_is_empty_when_no_statfile_has_seen_any_token() {
        let counts = HashMap::new();
        let totals = HashMap::new();
        let tokens = vec![Token { hash: 1, count: 1 }];
        assert!(bayes_vote(&tokens, &counts, &totals).is_empty());
    }
}
