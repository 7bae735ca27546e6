//! Statfile persistence backend interface (spec §4.6).
//!
//! Mirrors [`crate::fuzzy::backend::FuzzyBackend`]'s "two interchangeable
//! back ends" shape: the statistical pipeline only ever talks to this trait,
//! never to a concrete store directly.

#[cfg(feature = "redis-backend")]
pub mod redis;

#[cfg(feature = "postgres-backend")]
pub mod postgres;

use async_trait::async_trait;

use crate::error::Result;
use crate::stats::tokenizer::Token;

/// An opaque per-task handle into one statfile, obtained from
/// [`StatBackend::runtime`] (spec §4.6 stage 2: "the backend is opened with
/// a per-task handle").
#[derive(Clone, Debug)]
pub struct StatRuntimeHandle {
    pub statfile: String,
}

/// Backends implement all of: `init, runtime, process_tokens,
/// finalize_process, learn_tokens, finalize_learn, total_learns, inc_learns,
/// dec_learns, get_stat, close` (spec §4.6). "A backend must be
/// deterministic under a single-writer discipline but may serve multiple
/// concurrent readers."
#[async_trait]
pub trait StatBackend: Send + Sync {
    async fn init(&self, statfile: &str) -> Result<()>;

    async fn runtime(&self, statfile: &str) -> Result<StatRuntimeHandle>;

    /// Looks up every token's learn count for this statfile, returning
    /// `token hash -> count` (spec step 3: "fills the slot with the
    /// per-class learn count for that token").
    async fn process_tokens(
        &self,
        handle: &StatRuntimeHandle,
        tokens: &[Token],
    ) -> Result<std::collections::HashMap<u64, u64>>;

    async fn finalize_process(&self, handle: &StatRuntimeHandle) -> Result<()>;

    /// `delta` is `+1` for a plain learn, `-1` for the opposite-class
    /// decrement performed during an unlearn (spec §4.6 "Learning" step 2).
    async fn learn_tokens(&self, handle: &StatRuntimeHandle, tokens: &[Token], delta: i64) -> Result<()>;

    async fn finalize_learn(&self, handle: &StatRuntimeHandle) -> Result<()>;

    async fn total_learns(&self, statfile: &str) -> Result<i64>;

    async fn inc_learns(&self, statfile: &str) -> Result<i64>;

    async fn dec_learns(&self, statfile: &str) -> Result<i64>;

    async fn get_stat(&self, statfile: &str, token_hash: u64) -> Result<u64>;

    async fn close(&self) -> Result<()>;
}
