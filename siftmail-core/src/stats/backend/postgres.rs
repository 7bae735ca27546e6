//! Postgres-backed statfile store: a `sqlx::PgPool`, `ON CONFLICT ... DO
//! UPDATE` upserts, and migrations run externally.
//!
//! Schema (one shared table, partitioned by `statfile` name):
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS stat_tokens (
//!     statfile TEXT NOT NULL,
//!     token_hash BIGINT NOT NULL,
//!     learn_count BIGINT NOT NULL DEFAULT 0,
//!     PRIMARY KEY (statfile, token_hash)
//! );
//! CREATE TABLE IF NOT EXISTS stat_learns (
//!     statfile TEXT PRIMARY KEY,
//!     total BIGINT NOT NULL DEFAULT 0
//! );
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

use super::{StatBackend, StatRuntimeHandle};
use crate::error::{EngineError, Result};
use crate::stats::tokenizer::Token;

#[derive(Clone)]
pub struct PostgresStatBackend {
    pool: PgPool,
}

impl PostgresStatBackend {
    pub async fn new(connection_string: &str) -> Result<Self> {
        info!("connecting statistical pipeline to postgres");
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(connection_string)
            .await
            .map_err(|e| EngineError::Transient(format!("postgres connect failed: {e}")))?;
        Ok(Self { pool })
    }

    /// Assumes migrations are run externally, ahead of process start.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stat_tokens (
                statfile TEXT NOT NULL,
                token_hash BIGINT NOT NULL,
                learn_count BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (statfile, token_hash)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Fatal(format!("stat_tokens migration failed: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stat_learns (
                statfile TEXT PRIMARY KEY,
                total BIGINT NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Fatal(format!("stat_learns migration failed: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl StatBackend for PostgresStatBackend {
    async fn init(&self, _statfile: &str) -> Result<()> {
        self.migrate().await
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
        let hashes: Vec<i64> = tokens.iter().map(|t| t.hash as i64).collect();
        let rows = sqlx::query(
            "SELECT token_hash, learn_count FROM stat_tokens WHERE statfile = $1 AND token_hash = ANY($2)",
        )
        .bind(&handle.statfile)
        .bind(&hashes)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Transient(format!("postgres token lookup failed: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let hash: i64 = row.get("token_hash");
                let count: i64 = row.get("learn_count");
                (hash as u64, count.max(0) as u64)
            })
            .collect())
    }

    async fn finalize_process(&self, _handle: &StatRuntimeHandle) -> Result<()> {
        Ok(())
    }

    async fn learn_tokens(&self, handle: &StatRuntimeHandle, tokens: &[Token], delta: i64) -> Result<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineError::Transient(format!("postgres begin failed: {e}")))?;

        for token in tokens {
            sqlx::query(
                r#"
                INSERT INTO stat_tokens (statfile, token_hash, learn_count)
                VALUES ($1, $2, $3)
                ON CONFLICT (statfile, token_hash) DO UPDATE
                SET learn_count = stat_tokens.learn_count + EXCLUDED.learn_count
                "#,
            )
            .bind(&handle.statfile)
            .bind(token.hash as i64)
            .bind(delta * token.count as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineError::Transient(format!("postgres token upsert failed: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| EngineError::Transient(format!("postgres commit failed: {e}")))
    }

    async fn finalize_learn(&self, _handle: &StatRuntimeHandle) -> Result<()> {
        Ok(())
    }

    async fn total_learns(&self, statfile: &str) -> Result<i64> {
        let row = sqlx::query("SELECT total FROM stat_learns WHERE statfile = $1")
            .bind(statfile)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EngineError::Transient(format!("postgres total_learns failed: {e}")))?;
        Ok(row.map(|r| r.get::<i64, _>("total")).unwrap_or(0))
    }

    async fn inc_learns(&self, statfile: &str) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO stat_learns (statfile, total) VALUES ($1, 1)
            ON CONFLICT (statfile) DO UPDATE SET total = stat_learns.total + 1
            RETURNING total
            "#,
        )
        .bind(statfile)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| EngineError::Transient(format!("postgres inc_learns failed: {e}")))?;
        Ok(row.get("total"))
    }

    async fn dec_learns(&self, statfile: &str) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO stat_learns (statfile, total) VALUES ($1, -1)
            ON CONFLICT (statfile) DO UPDATE SET total = stat_learns.total - 1
            RETURNING total
            "#,
        )
        .bind(statfile)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| EngineError::Transient(format!("postgres dec_learns failed: {e}")))?;
        Ok(row.get("total"))
    }

    async fn get_stat(&self, statfile: &str, token_hash: u64) -> Result<u64> {
        let row = sqlx::query("SELECT learn_count FROM stat_tokens WHERE statfile = $1 AND token_hash = $2")
            .bind(statfile)
            .bind(token_hash as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EngineError::Transient(format!("postgres get_stat failed: {e}")))?;
        Ok(row.map(|r| r.get::<i64, _>("learn_count").max(0) as u64).unwrap_or(0))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
