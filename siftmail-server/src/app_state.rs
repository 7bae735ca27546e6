//! Shared daemon state (spec §5 "per-worker shared immutable state"):
//! `Clone` + a manual `Debug` that doesn't try to print every `Arc`'s
//! pointee.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use siftmail_core::fuzzy::store::FuzzyStore;
use siftmail_core::pool::ConnectionPool;
use siftmail_core::roll_history::RollHistory;
use siftmail_core::stats::classifier::{ClassifierDef, LearnCache};
use siftmail_core::worker::WorkerContext;

#[derive(Clone)]
pub struct AppState {
    pub worker: Arc<WorkerContext>,
    pub fuzzy_store: Arc<FuzzyStore>,
    pub roll_history: Arc<RollHistory>,
    pub classifiers: Arc<Vec<Arc<ClassifierDef>>>,
    pub learn_caches: Arc<Vec<Arc<dyn LearnCache>>>,
    /// Kept for its periodic idle sweep (spec §4.7 "Connection pool"); the
    /// fuzzy and stat backends open their own connections directly rather
    /// than drawing from this pool, so it currently has no active borrowers
    /// — see DESIGN.md for that Open Question's resolution.
    pub connection_pool: Arc<ConnectionPool>,
    pub started_at: Instant,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("classifiers", &self.classifiers.len())
            .field("roll_history_len", &self.roll_history.len())
            .finish_non_exhaustive()
    }
}
