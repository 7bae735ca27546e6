//! End-to-end task-ingress protocol tests (spec §6.1, §8 scenarios 1/3),
//! driven through the real `axum::Router` via `tower::ServiceExt::oneshot`
//! rather than against the scoring engine directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use tower::ServiceExt;

use siftmail_contracts::{Action, RuleFlags, RuleName, SymbolKind};
use siftmail_core::cache::rule::RuleBody;
use siftmail_core::fuzzy::backend::embedded::EmbeddedFuzzyBackend;
use siftmail_core::fuzzy::store::{FuzzyStore, FuzzyStoreConfig};
use siftmail_core::pool::{ConnectionPool, ConnectionPoolConfig};
use siftmail_core::roll_history::RollHistory;
use siftmail_core::scoring::metric::{GroupDef, Metric, MetricTable, RuleScoreDef};
use siftmail_core::stats::backend::{StatBackend, StatRuntimeHandle};
use siftmail_core::stats::classifier::{ClassifierDef, LearnCache, StatfileDef};
use siftmail_core::stats::tokenizer::Token;
use siftmail_core::worker::WorkerContext;
use siftmail_core::{Result as EngineResult, SymbolCache};

use siftmail_server::app_state::AppState;
use siftmail_server::learn_cache::MemoryLearnCache;
use siftmail_server::routes::create_api_router;
use siftmail_server::rules::register_builtin_rules;

/// An in-memory [`StatBackend`] good enough to exercise the learn endpoint
/// without a real Postgres/Redis instance.
struct InMemoryStatBackend {
    counts: Mutex<HashMap<u64, u64>>,
    learns: Mutex<i64>,
}

impl InMemoryStatBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self { counts: Mutex::new(HashMap::new()), learns: Mutex::new(0) })
    }
}

#[async_trait]
impl StatBackend for InMemoryStatBackend {
    async fn init(&self, _statfile: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn runtime(&self, statfile: &str) -> EngineResult<StatRuntimeHandle> {
        Ok(StatRuntimeHandle { statfile: statfile.to_string() })
    }

    async fn process_tokens(&self, _handle: &StatRuntimeHandle, tokens: &[Token]) -> EngineResult<HashMap<u64, u64>> {
        let counts = self.counts.lock();
        Ok(tokens.iter().filter_map(|t| counts.get(&t.hash).map(|c| (t.hash, *c))).collect())
    }

    async fn finalize_process(&self, _handle: &StatRuntimeHandle) -> EngineResult<()> {
        Ok(())
    }

    async fn learn_tokens(&self, _handle: &StatRuntimeHandle, tokens: &[Token], delta: i64) -> EngineResult<()> {
        let mut counts = self.counts.lock();
        for token in tokens {
            let entry = counts.entry(token.hash).or_insert(0);
            *entry = (*entry as i64 + delta * token.count as i64).max(0) as u64;
        }
        Ok(())
    }

    async fn finalize_learn(&self, _handle: &StatRuntimeHandle) -> EngineResult<()> {
        Ok(())
    }

    async fn total_learns(&self, _statfile: &str) -> EngineResult<i64> {
        Ok(*self.learns.lock())
    }

    async fn inc_learns(&self, _statfile: &str) -> EngineResult<i64> {
        let mut total = self.learns.lock();
        *total += 1;
        Ok(*total)
    }

    async fn dec_learns(&self, _statfile: &str) -> EngineResult<i64> {
        let mut total = self.learns.lock();
        *total -= 1;
        Ok(*total)
    }

    async fn get_stat(&self, _statfile: &str, token_hash: u64) -> EngineResult<u64> {
        Ok(*self.counts.lock().get(&token_hash).unwrap_or(&0))
    }

    async fn close(&self) -> EngineResult<()> {
        Ok(())
    }
}

/// Builds an [`AppState`] wired the same way `main.rs` does, but with every
/// backend swapped for an in-process equivalent so the suite needs no
/// external services.
async fn test_state() -> AppState {
    // Two distinct backend instances: the spam and ham statfiles must not
    // share token counts, or a learned token would count equally toward
    // both sides and `bayes_vote` could never clear the majority threshold.
    let spam_backend = InMemoryStatBackend::new();
    let ham_backend = InMemoryStatBackend::new();
    let classifier = Arc::new(ClassifierDef {
        name: "bayes".to_string(),
        statfiles: vec![
            StatfileDef { symbol: "BAYES_SPAM".to_string(), is_spam: true, backend: spam_backend, path: "spam".to_string() },
            StatfileDef { symbol: "BAYES_HAM".to_string(), is_spam: false, backend: ham_backend, path: "ham".to_string() },
        ],
        min_tokens: 1,
        max_tokens: 10_000,
    });

    let mut cache = SymbolCache::new();
    register_builtin_rules(&mut cache);
    // An extra pair of rules sharing a scoring group, used by the group-cap
    // test below (spec §8 scenario 2); built-ins alone can't all fire
    // together on one request.
    cache.add_symbol(
        RuleName::new("GROUP_A").unwrap(),
        0,
        RuleBody::Native(Arc::new(rule_that_always_fires("GROUP_A"))),
        SymbolKind::Normal,
        None,
    );
    cache.add_symbol(
        RuleName::new("GROUP_B").unwrap(),
        0,
        RuleBody::Native(Arc::new(rule_that_always_fires("GROUP_B"))),
        SymbolKind::Normal,
        None,
    );
    cache.add_symbol(
        RuleName::new("GROUP_C").unwrap(),
        0,
        RuleBody::Native(Arc::new(rule_that_always_fires("GROUP_C"))),
        SymbolKind::Normal,
        None,
    );
    cache.add_symbol(
        RuleName::new("CLASSIFIER_BAYES").unwrap(),
        0,
        RuleBody::Native(Arc::new(siftmail_core::ClassifierScanRule::new(classifier.clone()))),
        SymbolKind::Normal,
        None,
    );
    assert!(cache.validate(|_| true, false));

    let mut metric = Metric::new(MetricTable::DEFAULT_METRIC);
    metric.rules.insert(
        "MISSING_SUBJECT".to_string(),
        RuleScoreDef { score: 2.0, description: None, group: None, flags: RuleFlags::default(), nshots: None },
    );
    metric.rules.insert(
        "EMPTY_BODY".to_string(),
        RuleScoreDef { score: -1.0, description: None, group: None, flags: RuleFlags::default(), nshots: None },
    );
    metric.groups.insert("G".to_string(), GroupDef { name: "G".to_string(), max_score: 3.0 });
    for name in ["GROUP_A", "GROUP_B", "GROUP_C"] {
        metric.rules.insert(
            name.to_string(),
            RuleScoreDef {
                score: 1.5,
                description: None,
                group: Some("G".to_string()),
                flags: RuleFlags::default(),
                nshots: None,
            },
        );
    }
    metric.rules.insert(
        "BAYES_SPAM".to_string(),
        RuleScoreDef { score: 4.0, description: None, group: None, flags: RuleFlags::default(), nshots: None },
    );
    metric.rules.insert(
        "BAYES_HAM".to_string(),
        RuleScoreDef { score: -4.0, description: None, group: None, flags: RuleFlags::default(), nshots: None },
    );
    metric.action_thresholds.insert(Action::AddHeader, 1.5);
    metric.action_thresholds.insert(Action::Reject, 5.0);

    let mut metrics = MetricTable::new();
    metrics.insert(metric);

    let worker = Arc::new(WorkerContext::new(Arc::new(cache), Arc::new(metrics)));

    let dir = tempfile::tempdir().unwrap();
    let fuzzy_backend = Arc::new(EmbeddedFuzzyBackend::new(dir.path().join("fuzzy.db")));
    let fuzzy_store = Arc::new(FuzzyStore::new(
        fuzzy_backend,
        FuzzyStoreConfig {
            expire_secs: 3600,
            sync_timeout: std::time::Duration::from_secs(3600),
            allow_update: vec!["127.0.0.1/32".parse().unwrap()],
            key_prefix: "test:".to_string(),
        },
    ));

    let learn_caches: Vec<Arc<dyn LearnCache>> = vec![Arc::new(MemoryLearnCache::new())];

    AppState {
        worker,
        fuzzy_store,
        roll_history: Arc::new(RollHistory::new(64)),
        classifiers: Arc::new(vec![classifier]),
        learn_caches: Arc::new(learn_caches),
        connection_pool: Arc::new(ConnectionPool::new(ConnectionPoolConfig {
            idle_timeout: std::time::Duration::from_secs(60),
            max_conns: 4,
        })),
        started_at: Instant::now(),
    }
}

fn rule_that_always_fires(name: &'static str) -> impl siftmail_core::NativeRule {
    struct AlwaysFire(&'static str);
    #[async_trait]
    impl siftmail_core::NativeRule for AlwaysFire {
        async fn run(&self, ctx: siftmail_core::RuleContext) -> siftmail_core::RuleOutcome {
            if let Some(metric) = ctx.worker.metrics.default_metric() {
                siftmail_core::insert_result(&ctx.task, metric, self.0, 1.0, None);
            }
            siftmail_core::RuleOutcome::Finished
        }
    }
    AlwaysFire(name)
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Spec §8 scenario 1, driven through the real HTTP surface: a message with
/// no `Subject` header fires `MISSING_SUBJECT` (score 2.0) and nothing else,
/// clearing the `add-header` threshold but not `reject`.
#[tokio::test]
async fn check_endpoint_scores_missing_subject_and_selects_add_header() {
    let state = test_state().await;
    let router = create_api_router(state.clone()).with_state(state);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/check")
        .header("Helo", "mail.example.com")
        .body(Body::from("hello there, this is a perfectly normal message body"))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    let metric = &body["metrics"]["default"];
    assert_eq!(metric["score"], 2.0);
    assert_eq!(metric["action"], "add-header");
    let names: Vec<&str> = metric["symbols"].as_array().unwrap().iter().map(|s| s["name"].as_str().unwrap()).collect();
    assert!(names.contains(&"MISSING_SUBJECT"));
    assert!(!names.contains(&"EMPTY_BODY"));
}

/// A message with a subject and a non-empty body fires neither built-in
/// scored rule: score stays at 0 and the action is `no-action`.
#[tokio::test]
async fn check_endpoint_no_action_when_nothing_fires() {
    let state = test_state().await;
    let router = create_api_router(state.clone()).with_state(state);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/check")
        .header("Subject", "a perfectly reasonable subject line")
        .body(Body::from("hello there, this is a perfectly normal message body"))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    let body = json_body(response).await;
    let metric = &body["metrics"]["default"];
    assert_eq!(metric["score"], 0.0);
    assert_eq!(metric["action"], "no-action");
}

/// Spec §8 scenario 2 (group cap), driven end-to-end: three rules sharing
/// group `G` (max_score 3.0, each worth 1.5) all fire on every request, so
/// the group — and therefore the metric — never exceeds 3.0 even though the
/// raw sum of contributions would be 4.5.
#[tokio::test]
async fn check_endpoint_enforces_group_cap() {
    let state = test_state().await;
    let router = create_api_router(state.clone()).with_state(state);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/check")
        .header("Subject", "fine")
        .body(Body::from("non-empty body"))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    let body = json_body(response).await;
    let metric = &body["metrics"]["default"];
    assert_eq!(metric["score"], 3.0);
}

/// Spec §8 round-trip: `Learn(spam)` then `Learn(spam)` again on the same
/// message is rejected by the learn cache on the second call.
#[tokio::test]
async fn learn_spam_twice_is_rejected_on_second_call() {
    let state = test_state().await;
    let router = create_api_router(state.clone()).with_state(state);

    let first = Request::builder()
        .method("POST")
        .uri("/v1/learn/spam")
        .body(Body::from("buy cheap watches now"))
        .unwrap();
    let response = router.clone().oneshot(first).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let second = Request::builder()
        .method("POST")
        .uri("/v1/learn/spam")
        .body(Body::from("buy cheap watches now"))
        .unwrap();
    let response = router.oneshot(second).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// `/v1/counters` and `/v1/uptime` back the CLI's introspection commands
/// (spec §6.6) and should reflect scans that already ran.
#[tokio::test]
async fn counters_reflect_prior_scans() {
    let state = test_state().await;
    let router = create_api_router(state.clone()).with_state(state);

    let scan = Request::builder()
        .method("POST")
        .uri("/v1/check")
        .body(Body::from("x"))
        .unwrap();
    router.clone().oneshot(scan).await.unwrap();

    let counters_req = Request::builder().method("GET").uri("/v1/counters").body(Body::empty()).unwrap();
    let response = router.oneshot(counters_req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["tasks_scanned"], 1);
    assert_eq!(body["classifiers"], 1);
}

/// Spec §4.6 step 4 / §8 scenario 6: learning a message as spam, then
/// scanning the same content, fires `BAYES_SPAM` on the registered
/// classifier rule instead of the statistical pipeline silently never
/// running on a live request.
#[tokio::test]
async fn learning_spam_then_scanning_fires_bayes_symbol() {
    let state = test_state().await;
    let router = create_api_router(state.clone()).with_state(state);

    let body_text = "cheap replica watches discount offer buy now limited time";

    let learn = Request::builder()
        .method("POST")
        .uri("/v1/learn/spam")
        .body(Body::from(body_text))
        .unwrap();
    let response = router.clone().oneshot(learn).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let scan = Request::builder()
        .method("POST")
        .uri("/v1/check")
        .header("Subject", "unrelated")
        .body(Body::from(body_text))
        .unwrap();
    let response = router.oneshot(scan).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    let metric = &body["metrics"]["default"];
    let symbols = metric["symbols"].as_array().unwrap();
    let bayes_spam = symbols.iter().find(|s| s["name"] == "BAYES_SPAM").expect("BAYES_SPAM did not fire after learning spam");
    assert!(bayes_spam["score"].as_f64().unwrap() > 0.0);
}
