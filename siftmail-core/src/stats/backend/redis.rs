//! Redis-backed statfile store, grounded the same way as
//! [`crate::fuzzy::backend::redis::RedisFuzzyBackend`]: one hash per
//! statfile, keyed by token hash, plus a `learns` counter key.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use super::{StatBackend, StatRuntimeHandle};
use crate::error::{EngineError, Result};
use crate::stats::tokenizer::Token;

#[derive(Clone)]
pub struct RedisStatBackend {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisStatBackend {
    pub async fn new(redis_url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| EngineError::Configuration(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| EngineError::Transient(format!("redis connect failed: {e}")))?;
        Ok(Self {
            conn,
            key_prefix: key_prefix.into(),
        })
    }

    fn tokens_key(&self, statfile: &str) -> String {
        format!("{}st:{statfile}:tokens", self.key_prefix)
    }

    fn learns_key(&self, statfile: &str) -> String {
        format!("{}st:{statfile}:learns", self.key_prefix)
    }
}

#[async_trait]
impl StatBackend for RedisStatBackend {
    async fn init(&self, statfile: &str) -> Result<()> {
        debug!(statfile, "initializing redis statfile backend");
        Ok(())
    }

    async fn runtime(&self, statfile: &str) -> Result<StatRuntimeHandle> {
        Ok(StatRuntimeHandle {
            statfile: statfile.to_string(),
        })
    }

    async fn process_tokens(
        &self,
        handle: &StatRuntimeHandle,
        tokens: &[Token],
    ) -> Result<HashMap<u64, u64>> {
        if tokens.is_empty() {
            return Ok(HashMap::new());
        }
        let key = self.tokens_key(&handle.statfile);
        let fields: Vec<String> = tokens.iter().map(|t| t.hash.to_string()).collect();
        let mut conn = self.conn.clone();
        let values: Vec<Option<u64>> = conn
            .hget(&key, fields)
            .await
            .map_err(|e| EngineError::Transient(format!("redis HMGET failed: {e}")))?;
        Ok(tokens
            .iter()
            .zip(values)
            .filter_map(|(token, v)| v.map(|v| (token.hash, v)))
            .collect())
    }

    async fn finalize_process(&self, _handle: &StatRuntimeHandle) -> Result<()> {
        Ok(())
    }

    async fn learn_tokens(&self, handle: &StatRuntimeHandle, tokens: &[Token], delta: i64) -> Result<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        let key = self.tokens_key(&handle.statfile);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for token in tokens {
            pipe.hincr(&key, token.hash.to_string(), delta * token.count as i64).ignore();
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| EngineError::Transient(format!("redis learn HINCRBY failed: {e}")))
    }

    async fn finalize_learn(&self, _handle: &StatRuntimeHandle) -> Result<()> {
        Ok(())
    }

    async fn total_learns(&self, statfile: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn
            .get(self.learns_key(statfile))
            .await
            .map_err(|e| EngineError::Transient(format!("redis GET learns failed: {e}")))?;
        Ok(value.unwrap_or(0))
    }

    async fn inc_learns(&self, statfile: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.incr(self.learns_key(statfile), 1)
            .await
            .map_err(|e| EngineError::Transient(format!("redis INCR learns failed: {e}")))
    }

    async fn dec_learns(&self, statfile: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.decr(self.learns_key(statfile), 1)
            .await
            .map_err(|e| EngineError::Transient(format!("redis DECR learns failed: {e}")))
    }

    async fn get_stat(&self, statfile: &str, token_hash: u64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = conn
            .hget(self.tokens_key(statfile), token_hash.to_string())
            .await
            .map_err(|e| EngineError::Transient(format!("redis HGET token failed: {e}")))?;
        Ok(value.unwrap_or(0))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
