//! Fuzzy-hash persistence backend interface (spec §4.5 "Persistence").

#[cfg(feature = "redis-backend")]
pub mod redis;

pub mod embedded;

use async_trait::async_trait;

use crate::error::Result;

#[derive(Clone, Copy, Debug, Default)]
pub struct FuzzyValue {
    pub flag: u8,
    pub value: i32,
}

/// One write queued against a hash key, applied transactionally on the sync
/// tick (spec §4.5 "Persistence": `MULTI` → per-hash op → shingle ops →
/// `INCR <prefix||src>` → `EXEC`).
#[derive(Clone, Debug)]
pub enum FuzzyWrite {
    Set {
        key: String,
        flag: u8,
        value: i32,
        expire_secs: u64,
        shingles: Vec<(String, String, u64)>, // (shingle_key, digest_key, ttl)
        count_key: String,
    },
    Delete {
        key: String,
        shingle_keys: Vec<String>,
        count_key: String,
    },
}

/// Persists fuzzy digests and shingle indices. Two implementations satisfy
/// this interface interchangeably (spec §4.5): an out-of-process KV store
/// and an embedded local file-backed store.
#[async_trait]
pub trait FuzzyBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<FuzzyValue>>;

    async fn get_shingle(&self, shingle_key: &str) -> Result<Option<String>>;

    /// Applies a queued batch of writes as a single transaction. On failure
    /// the whole batch should be treated as not-yet-applied by the caller
    /// (spec: "the batch is re-attempted on the next tick").
    async fn apply_batch(&self, writes: &[FuzzyWrite]) -> Result<()>;

    /// Removes entries past their expiry; returns the number removed (fed
    /// into the `fuzzy_hashes_expired` counter).
    async fn expire_scan(&self) -> Result<u64>;
}
