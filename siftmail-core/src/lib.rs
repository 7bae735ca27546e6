pub mod cache;
pub mod error;
pub mod fuzzy;
pub mod pool;
pub mod roll_history;
pub mod rule_impl;
pub mod runner;
pub mod scoring;
pub mod session;
pub mod stats;
pub mod task;
pub mod upstream;
pub mod worker;

pub use cache::SymbolCache;
pub use cache::scheduler::Scheduler;
pub use error::{EngineError, Result};
pub use fuzzy::store::FuzzyStore;
pub use fuzzy::wire::{FuzzyCmd, FuzzyFrame, FuzzyReply, FuzzyRequest};
pub use pool::{ConnectionPool, PooledConnection};
pub use roll_history::{RollHistory, VerdictRecord};
pub use rule_impl::{NativeRule, RuleContext, RuleOutcome, ScriptEngine, SyncRule};
pub use runner::RuleRunner;
pub use runner::composite::{AtomPolicy, CompositeExpr, CompositeRule};
pub use scoring::{check_action, insert_result, Metric, MetricResult, MetricTable, SymbolHit};
pub use session::{AsyncSession, EventHandle, FinalizeReason, Watcher};
pub use stats::classifier::{ClassifierRuntime, ClassifierScanRule, Stage};
pub use stats::tokenizer::{tokenize_osb, Token};
pub use task::{Envelope, PreResult, Settings, Task};
pub use upstream::{Upstream, UpstreamPool, UpstreamStrategy};
pub use worker::{RegexCache, WorkerContext, WorkerCounters};
