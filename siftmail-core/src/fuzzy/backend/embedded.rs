//! Embedded (single-process) fuzzy backend: a small versioned-header binary
//! file plus an in-memory [`DashMap`] index, flushed on the sync tick.
//!
//! No embedded KV crate is pulled in for this; a custom on-disk format plus
//! an in-memory index keeps the dependency surface the same shape as the
//! other persistence backends instead of adding a one-off dependency just
//! for this path. See DESIGN.md for the rationale.

use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::fs;
use tracing::warn;

use super::{FuzzyBackend, FuzzyValue, FuzzyWrite};
use crate::error::{EngineError, Result};

const FILE_MAGIC: &[u8; 4] = b"SFZ1";

struct Entry {
    flag: u8,
    value: i32,
    expire_at_secs: u64,
}

pub struct EmbeddedFuzzyBackend {
    path: PathBuf,
    index: DashMap<String, Entry>,
    shingles: DashMap<String, String>,
    counts: DashMap<String, i64>,
    /// Guards the on-disk file during a flush; the in-memory index remains
    /// lock-free for reads.
    flush_lock: RwLock<()>,
}

impl EmbeddedFuzzyBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            index: DashMap::new(),
            shingles: DashMap::new(),
            counts: DashMap::new(),
            flush_lock: RwLock::new(()),
        }
    }

    /// Loads the on-disk index at startup; a missing file starts empty.
    pub async fn load(&self) -> Result<()> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(EngineError::Io(e)),
        };
        if bytes.len() < 4 || &bytes[0..4] != FILE_MAGIC {
            warn!(path = %self.path.display(), "fuzzy store file has unknown header; starting empty");
            return Ok(());
        }
        let mut offset = 4;
        while offset + 2 <= bytes.len() {
            let key_len = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]) as usize;
            offset += 2;
            if offset + key_len + 13 > bytes.len() {
                break;
            }
            let key = String::from_utf8_lossy(&bytes[offset..offset + key_len]).into_owned();
            offset += key_len;
            let flag = bytes[offset];
            offset += 1;
            let value = i32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());
            offset += 4;
            let expire_at_secs = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap());
            offset += 8;
            self.index.insert(key, Entry { flag, value, expire_at_secs });
        }
        Ok(())
    }

    fn now_secs() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
    }

    /// Serializes the current index and writes it to `path` atomically via a
    /// temp-file rename, the usual pattern for crash-safe on-disk artifacts.
    async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.write();
        let mut buf = Vec::new();
        buf.extend_from_slice(FILE_MAGIC);
        for entry in self.index.iter() {
            let key = entry.key();
            buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
            buf.extend_from_slice(key.as_bytes());
            buf.push(entry.flag);
            buf.extend_from_slice(&entry.value.to_le_bytes());
            buf.extend_from_slice(&entry.expire_at_secs.to_le_bytes());
        }

        let tmp_path = self.path.with_extension("tmp");
        let mut file = std::fs::File::create(&tmp_path).map_err(EngineError::Io)?;
        file.write_all(&buf).map_err(EngineError::Io)?;
        file.sync_all().map_err(EngineError::Io)?;
        std::fs::rename(&tmp_path, &self.path).map_err(EngineError::Io)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl FuzzyBackend for EmbeddedFuzzyBackend {
    async fn get(&self, key: &str) -> Result<Option<FuzzyValue>> {
        let now = Self::now_secs();
        Ok(self.index.get(key).and_then(|e| {
            if e.expire_at_secs > now {
                Some(FuzzyValue { flag: e.flag, value: e.value })
            } else {
                None
            }
        }))
    }

    async fn get_shingle(&self, shingle_key: &str) -> Result<Option<String>> {
        Ok(self.shingles.get(shingle_key).map(|v| v.clone()))
    }

    async fn apply_batch(&self, writes: &[FuzzyWrite]) -> Result<()> {
        let now = Self::now_secs();
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
                    self.index
                        .entry(key.clone())
                        .and_modify(|e| {
                            e.flag = *flag;
                            e.value += value;
                            e.expire_at_secs = now + expire_secs;
                        })
                        .or_insert(Entry {
                            flag: *flag,
                            value: *value,
                            expire_at_secs: now + expire_secs,
                        });
                    for (shingle_key, digest_key, _ttl) in shingles {
                        self.shingles.insert(shingle_key.clone(), digest_key.clone());
                    }
                    *self.counts.entry(count_key.clone()).or_insert(0) += 1;
                }
                FuzzyWrite::Delete { key, shingle_keys, count_key } => {
                    self.index.remove(key);
                    for shingle_key in shingle_keys {
                        self.shingles.remove(shingle_key);
                    }
                    *self.counts.entry(count_key.clone()).or_insert(0) -= 1;
                }
            }
        }
        self.flush().await
    }

    async fn expire_scan(&self) -> Result<u64> {
        let now = Self::now_secs();
        let expired: Vec<String> = self
            .index
            .iter()
            .filter(|e| e.expire_at_secs <= now)
            .map(|e| e.key().clone())
            .collect();
        for key in &expired {
            self.index.remove(key);
        }
        if !expired.is_empty() {
            self.flush().await?;
        }
        Ok(expired.len() as u64)
    }
}
