//! Fuzzy digest/shingle store: check/write/delete against a pluggable
//! [`FuzzyBackend`], a write queue drained by a jittered sync timer, and the
//! update-allow-list gate (spec §4.5, §6.2).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use rand::Rng;
use std::net::IpAddr;
use tracing::{debug, warn};

use super::backend::{FuzzyBackend, FuzzyValue, FuzzyWrite};
use super::wire::{FuzzyCmd, FuzzyReply, FuzzyRequest, SHINGLE_COUNT};
use crate::error::Result;

/// Majority threshold for shingle-based fuzzy matching (spec §4.5: "more
/// than 16 agree").
const SHINGLE_MAJORITY_THRESHOLD: usize = 16;

#[derive(Default)]
pub struct FuzzyCounters {
    pub checked: AtomicU64,
    pub found: AtomicU64,
    pub expired: AtomicU64,
}

pub struct FuzzyStoreConfig {
    pub expire_secs: u64,
    pub sync_timeout: Duration,
    pub allow_update: Vec<IpNetwork>,
    pub key_prefix: String,
}

pub struct FuzzyStore {
    backend: Arc<dyn FuzzyBackend>,
    config: FuzzyStoreConfig,
    queue: Mutex<Vec<FuzzyWrite>>,
    pub counters: FuzzyCounters,
}

impl FuzzyStore {
    pub fn new(backend: Arc<dyn FuzzyBackend>, config: FuzzyStoreConfig) -> Self {
        Self {
            backend,
            config,
            queue: Mutex::new(Vec::new()),
            counters: FuzzyCounters::default(),
        }
    }

    pub fn is_allowed_to_update(&self, source: IpAddr) -> bool {
        self.config.allow_update.iter().any(|net| net.contains(source))
    }

    fn digest_key(&self, digest: &[u8]) -> String {
        format!("{}{}", self.config.key_prefix, hex(digest))
    }

    fn shingle_key(&self, hash: u64) -> String {
        format!("{}sgl:{:x}", self.config.key_prefix, hash)
    }

    fn count_key(&self, tag: u32) -> String {
        format!("{}count:{}", self.config.key_prefix, tag)
    }

    /// Handles `Check`: direct digest lookup, falling back to shingle
    /// majority-vote when the request carried shingles (spec §4.5).
    pub async fn check(&self, req: &FuzzyRequest) -> Result<FuzzyReply> {
        self.counters.checked.fetch_add(1, Ordering::Relaxed);

        let key = self.digest_key(&req.digest);
        if let Some(value) = self.backend.get(&key).await? {
            self.counters.found.fetch_add(1, Ordering::Relaxed);
            return Ok(FuzzyReply {
                value: value.value,
                flag: value.flag,
                prob: 1.0,
                tag: req.tag,
            });
        }

        if let Some(shingles) = &req.shingles {
            return self.check_shingles(shingles, req.tag).await;
        }

        Ok(FuzzyReply::miss(req.tag))
    }

    async fn check_shingles(&self, shingles: &[u64; SHINGLE_COUNT], tag: u32) -> Result<FuzzyReply> {
        use std::collections::HashMap;

        let mut votes: HashMap<String, usize> = HashMap::new();
        for hash in shingles {
            let shingle_key = self.shingle_key(*hash);
            if let Some(digest_key) = self.backend.get_shingle(&shingle_key).await? {
                *votes.entry(digest_key).or_insert(0) += 1;
            }
        }

        let Some((digest_key, count)) = votes.into_iter().max_by_key(|(_, count)| *count) else {
            return Ok(FuzzyReply::miss(tag));
        };
        if count <= SHINGLE_MAJORITY_THRESHOLD {
            return Ok(FuzzyReply::miss(tag));
        }

        match self.backend.get(&digest_key).await? {
            Some(value) => {
                self.counters.found.fetch_add(1, Ordering::Relaxed);
                Ok(FuzzyReply {
                    value: value.value,
                    flag: value.flag,
                    prob: count as f32 / SHINGLE_COUNT as f32,
                    tag,
                })
            }
            None => Ok(FuzzyReply::miss(tag)),
        }
    }

    /// Handles `Write`: queues the transaction for the next sync tick rather
    /// than writing synchronously (spec §4.5 "Persistence").
    pub fn write(&self, req: &FuzzyRequest) {
        let key = self.digest_key(&req.digest);
        let shingles = req
            .shingles
            .map(|hashes| {
                hashes
                    .iter()
                    .map(|h| (self.shingle_key(*h), key.clone(), self.config.expire_secs))
                    .collect()
            })
            .unwrap_or_default();
        self.queue.lock().push(FuzzyWrite::Set {
            key,
            flag: req.flag,
            value: req.value,
            expire_secs: self.config.expire_secs,
            shingles,
            count_key: self.count_key(req.tag),
        });
    }

    /// Handles `Del`.
    pub fn delete(&self, req: &FuzzyRequest) {
        let key = self.digest_key(&req.digest);
        let shingle_keys = req
            .shingles
            .map(|hashes| hashes.iter().map(|h| self.shingle_key(*h)).collect())
            .unwrap_or_default();
        self.queue.lock().push(FuzzyWrite::Delete {
            key,
            shingle_keys,
            count_key: self.count_key(req.tag),
        });
    }

    /// Drains the write queue as one backend transaction. On failure the
    /// batch is put back for the next tick (spec: "the batch is
    /// re-attempted on the next tick").
    pub async fn drain_queue(&self) {
        let batch = std::mem::take(&mut *self.queue.lock());
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.backend.apply_batch(&batch).await {
            warn!(error = %e, batch_len = batch.len(), "fuzzy write batch failed; re-queuing for next tick");
            self.queue.lock().extend(batch);
        }
    }

    pub async fn expire_scan(&self) -> Result<()> {
        let expired = self.backend.expire_scan().await?;
        if expired > 0 {
            self.counters.expired.fetch_add(expired, Ordering::Relaxed);
            debug!(expired, "fuzzy expire scan removed entries");
        }
        Ok(())
    }

    /// One sync tick: expiry scan then queue drain, at a jittered interval
    /// (±25% around `sync_timeout`, spec §4.5).
    pub async fn run_sync_loop(self: Arc<Self>) {
        loop {
            let jittered = jittered_interval(self.config.sync_timeout);
            tokio::time::sleep(jittered).await;
            if let Err(e) = self.expire_scan().await {
                warn!(error = %e, "fuzzy expire scan failed");
            }
            self.drain_queue().await;
        }
    }
}

fn jittered_interval(base: Duration) -> Duration {
    let jitter_fraction = rand::thread_rng().gen_range(-0.25..=0.25);
    let secs = base.as_secs_f64() * (1.0 + jitter_fraction);
    Duration::from_secs_f64(secs.max(0.001))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzzy::backend::embedded::EmbeddedFuzzyBackend;
    use crate::fuzzy::wire::DIGEST_LEN;

    fn config() -> FuzzyStoreConfig {
        FuzzyStoreConfig {
            expire_secs: 3600,
            sync_timeout: Duration::from_secs(10),
            allow_update: vec!["127.0.0.1/32".parse().unwrap()],
            key_prefix: "fz:".into(),
        }
    }

    #[tokio::test]
    async fn write_then_check_after_drain() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(EmbeddedFuzzyBackend::new(dir.path().join("f.db")));
        let store = FuzzyStore::new(backend, config());

        let req = FuzzyRequest {
            version: 4,
            cmd: FuzzyCmd::Write,
            flag: 1,
            value: 10,
            tag: 1,
            digest: [9u8; DIGEST_LEN],
            shingles: None,
        };
        store.write(&req);
        store.drain_queue().await;

        let reply = store.check(&req).await.unwrap();
        assert_eq!(reply.value, 10);
        assert_eq!(reply.prob, 1.0);
    }

    #[tokio::test]
    async fn miss_before_write_drains() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(EmbeddedFuzzyBackend::new(dir.path().join("f.db")));
        let store = FuzzyStore::new(backend, config());
        let req = FuzzyRequest {
            version: 4,
            cmd: FuzzyCmd::Check,
            flag: 0,
            value: 0,
            tag: 5,
            digest: [1u8; DIGEST_LEN],
            shingles: None,
        };
        let reply = store.check(&req).await.unwrap();
        assert_eq!(reply.prob, 0.0);
    }

    #[test]
    fn allow_list_gates_by_cidr() {
        let dir_backend: Arc<dyn FuzzyBackend> = {
            struct Noop;
            #[async_trait::async_trait]
            impl FuzzyBackend for Noop {
                async fn get(&self, _key: &str) -> Result<Option<FuzzyValue>> {
                    Ok(None)
                }
                async fn get_shingle(&self, _key: &str) -> Result<Option<String>> {
                    Ok(None)
                }
                async fn apply_batch(&self, _w: &[FuzzyWrite]) -> Result<()> {
                    Ok(())
                }
                async fn expire_scan(&self) -> Result<u64> {
                    Ok(0)
                }
            }
            Arc::new(Noop)
        };
        let store = FuzzyStore::new(dir_backend, config());
        assert!(store.is_allowed_to_update("127.0.0.1".parse().unwrap()));
        assert!(!store.is_allowed_to_update("10.0.0.5".parse().unwrap()));
    }
}
