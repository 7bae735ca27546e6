//! # siftmaild
//!
//! Content-analysis daemon: scores inbound mail against configurable rules,
//! fuzzy hashes, and statistical classifiers, then replies with a verdict
//! over the task ingress protocol (spec §6.1). A separate UDP listener
//! serves the fuzzy-hash datagram protocol (spec §6.2) against its own
//! dedicated worker, matching spec §5's "no other worker touches the fuzzy
//! store directly".
//!
//! ## Architecture
//!
//! - `axum` serves the task ingress and learn routes
//! - the symbol cache / scheduler / scoring engine run in-process as a
//!   library (`siftmail-core`)
//! - the fuzzy store and statistical classifiers persist through pluggable
//!   backends (embedded file, Redis, Postgres) selected by configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use siftmail_config::convert::RuntimeConfig;
use siftmail_config::loader::ConfigLoader;
use siftmail_config::schema::FuzzyBackendKind;
use siftmail_core::cache::rule::RuleBody;
use siftmail_core::cache::SymbolCache;
use siftmail_core::fuzzy::backend::embedded::EmbeddedFuzzyBackend;
use siftmail_core::fuzzy::backend::redis::RedisFuzzyBackend;
use siftmail_core::fuzzy::backend::FuzzyBackend;
use siftmail_core::fuzzy::store::FuzzyStore;
use siftmail_core::pool::ConnectionPool;
use siftmail_core::roll_history::RollHistory;
use siftmail_core::stats::classifier::{ClassifierDef, ClassifierScanRule, LearnCache};
use siftmail_core::worker::WorkerContext;
use siftmail_contracts::{RuleName, SymbolKind};

use siftmail_server::app_state::AppState;
use siftmail_server::learn_cache::MemoryLearnCache;
use siftmail_server::{classifiers, fuzzy_listener, routes, rules};

/// Command line overrides for `siftmaild`: CLI flags layer on top of the
/// TOML config, mirroring the way most daemons let flags override file
/// config for the handful of settings needed at process start.
#[derive(Parser, Debug)]
#[command(name = "siftmaild")]
#[command(about = "Content-analysis daemon for inbound mail")]
struct Args {
    /// Path to the TOML configuration file (defaults to siftmail.toml /
    /// config/siftmail.toml / /etc/siftmail/siftmail.toml, first match wins).
    #[arg(long, env = "SIFTMAIL_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides the task-ingress listen address from the config file.
    #[arg(long, env = "SIFTMAIL_LISTEN_ADDR")]
    listen_addr: Option<SocketAddr>,
}

async fn open_fuzzy_backend(kind: &FuzzyBackendKind) -> anyhow::Result<Arc<dyn FuzzyBackend>> {
    match kind {
        FuzzyBackendKind::Embedded { path } => {
            let backend = EmbeddedFuzzyBackend::new(path.clone());
            backend.load().await?;
            Ok(Arc::new(backend))
        }
        FuzzyBackendKind::Redis { url } => {
            let backend = RedisFuzzyBackend::new(url, "sm:fz:").await?;
            Ok(Arc::new(backend))
        }
    }
}

/// Registers the built-in rules plus one [`ClassifierScanRule`] per
/// configured classifier (spec §4.6 step 4, wired into the live scan path
/// the same way composite rules dispatch through `RuleBody::Native`), then
/// validates the dependency graph. Strict mode (every symbol must be
/// referenced by a metric) is left off here: the built-ins and classifiers
/// are always registered regardless of which metrics a deployment
/// configures (see `rules::register_builtin_rules`'s own doc comment).
fn build_symbol_cache(config: &RuntimeConfig, classifiers: &[Arc<ClassifierDef>]) -> anyhow::Result<Arc<SymbolCache>> {
    let mut cache = SymbolCache::new();
    rules::register_builtin_rules(&mut cache);

    for def in classifiers {
        let rule_name = format!("CLASSIFIER_{}", def.name.to_uppercase());
        cache.add_symbol(
            RuleName::new(rule_name).map_err(|e| anyhow::anyhow!("classifier name too long to become a rule name: {e}"))?,
            0,
            RuleBody::Native(Arc::new(ClassifierScanRule::new(def.clone()))),
            SymbolKind::Normal,
            None,
        );
    }

    let referenced_by_metric = |name: &str| {
        config
            .metrics
            .default_metric()
            .map(|m| m.rule_def(name).is_some())
            .unwrap_or(true)
    };
    if !cache.validate(referenced_by_metric, false) {
        anyhow::bail!("symbol cache failed validation (dependency cycle detected)");
    }

    Ok(Arc::new(cache))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "siftmail_server=info,siftmail_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_file(path.clone());
    }
    let loaded = loader.load()?;
    let mut config = loaded.config;
    if let Some(path) = &loaded.source_path {
        info!(path = %path.display(), "configuration loaded");
    } else {
        warn!("no configuration file found; running on defaults plus environment overrides");
    }
    if let Some(listen_addr) = args.listen_addr {
        config.listen_addr = listen_addr;
    }

    let classifiers = classifiers::build_classifiers(&config.statfiles).await?;
    info!(count = classifiers.len(), "classifiers initialized");

    let symbol_cache = build_symbol_cache(&config, &classifiers)?;
    let metrics = Arc::new(config.metrics);
    let worker = Arc::new(WorkerContext::with_upstream_pools(symbol_cache, metrics, config.upstream_pools));
    info!(worker_id = %worker.worker_id, symbols = worker.symbol_cache.symbols_count(), "worker context initialized");

    let fuzzy_backend = open_fuzzy_backend(&config.fuzzy_backend).await?;
    let fuzzy_store = Arc::new(FuzzyStore::new(fuzzy_backend, config.fuzzy_store_config));
    tokio::spawn(fuzzy_store.clone().run_sync_loop());
    tokio::spawn(fuzzy_listener::run(fuzzy_store.clone(), config.fuzzy_listen_addr));
    info!(addr = %config.fuzzy_listen_addr, "fuzzy datagram listener spawned");

    let connection_pool = Arc::new(ConnectionPool::new(config.pool_config));
    {
        let pool = connection_pool.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                ticker.tick().await;
                pool.sweep_idle(tokio::time::Instant::now());
            }
        });
    }

    let roll_history = Arc::new(RollHistory::new(config.roll_history_capacity));

    let learn_caches: Vec<Arc<dyn LearnCache>> = vec![Arc::new(MemoryLearnCache::new())];

    let state = AppState {
        worker,
        fuzzy_store,
        roll_history,
        classifiers: Arc::new(classifiers),
        learn_caches: Arc::new(learn_caches),
        connection_pool,
        started_at: Instant::now(),
    };

    let router = routes::create_api_router(state.clone())
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "task ingress listener bound");

    if let Err(e) = axum::serve(listener, router).await {
        error!(error = %e, "server exited with error");
        return Err(e.into());
    }

    Ok(())
}
