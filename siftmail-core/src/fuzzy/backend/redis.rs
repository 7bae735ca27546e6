//! Out-of-process fuzzy backend (spec §6.3 KV wire requirements): a
//! `redis::aio::ConnectionManager` extended with the hash/shingle command
//! set §4.5 requires.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, warn};

use super::{FuzzyBackend, FuzzyValue, FuzzyWrite};
use crate::error::{EngineError, Result};

#[derive(Clone)]
pub struct RedisFuzzyBackend {
    conn: ConnectionManager,
    expire_prefix: String,
}

impl RedisFuzzyBackend {
    pub async fn new(redis_url: &str, expire_prefix: impl Into<String>) -> Result<Self> {
        debug!(url = %redis_url, "connecting fuzzy backend to redis");
        let client = redis::Client::open(redis_url)
            .map_err(|e| EngineError::Configuration(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| EngineError::Transient(format!("redis connect failed: {e}")))?;
        Ok(Self {
            conn,
            expire_prefix: expire_prefix.into(),
        })
    }
}

#[async_trait::async_trait]
impl FuzzyBackend for RedisFuzzyBackend {
    async fn get(&self, key: &str) -> Result<Option<FuzzyValue>> {
        let mut conn = self.conn.clone();
        let result: Option<(Option<u8>, Option<i32>)> = redis::pipe()
            .hget(key, "F")
            .hget(key, "V")
            .query_async(&mut conn)
            .await
            .map_err(|e| EngineError::Transient(format!("redis HGET failed: {e}")))?;

        Ok(result.and_then(|(flag, value)| match (flag, value) {
            (Some(flag), Some(value)) => Some(FuzzyValue { flag, value }),
            _ => None,
        }))
    }

    async fn get_shingle(&self, shingle_key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(shingle_key)
            .await
            .map_err(|e| EngineError::Transient(format!("redis GET shingle failed: {e}")))
    }

    async fn apply_batch(&self, writes: &[FuzzyWrite]) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for write in writes {
            match write {
                FuzzyWrite::Set {
                    key,
                    flag,
                    value,
                    expire_secs,
                    shingles,
                    count_key,
                } => {
                    pipe.hset(key, "F", *flag).ignore();
                    pipe.hincr(key, "V", *value).ignore();
                    pipe.expire(key, *expire_secs as i64).ignore();
                    pipe.incr(count_key, 1).ignore();
                    for (shingle_key, digest_key, ttl) in shingles {
                        pipe.set_ex::<_, _>(shingle_key, digest_key, *ttl).ignore();
                    }
                }
                FuzzyWrite::Delete {
                    key,
                    shingle_keys,
                    count_key,
                } => {
                    pipe.del(key).ignore();
                    pipe.decr(count_key, 1).ignore();
                    for shingle_key in shingle_keys {
                        pipe.del(shingle_key).ignore();
                    }
                }
            }
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn).await.map_err(|e| {
            warn!(error = %e, "fuzzy write batch failed; upstream will be marked failed by the caller");
            EngineError::Transient(format!("redis MULTI/EXEC failed: {e}"))
        })
    }

    async fn expire_scan(&self) -> Result<u64> {
        // Redis enforces TTLs itself via EXPIRE; there is nothing to scan.
        // Expiry accounting here always reports zero, matching the "two
        // interchangeable back ends" contract without duplicating Redis's
        // own eviction.
        let _ = &self.expire_prefix;
        Ok(0)
    }
}
