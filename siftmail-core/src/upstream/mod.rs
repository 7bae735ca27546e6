//! Upstream pool (component G, spec §4.7).
//!
//! Selects a live peer for a logical endpoint, tracking recent errors and a
//! dead/alive state transition: a small state machine with explicit failure
//! counters and a timed "dead until" recovery, rather than a generic
//! circuit-breaker crate.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

/// How `UpstreamPool::get` picks among live peers (spec §4.7).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpstreamStrategy {
    RoundRobin,
    MasterSlave,
    ConsistentHash,
}

struct UpstreamInner {
    addr: SocketAddr,
    name: String,
    recent_errors: AtomicU64,
    last_error_at: Mutex<Option<SystemTime>>,
    dead_until: Mutex<Option<SystemTime>>,
}

/// One physical peer behind a logical endpoint.
#[derive(Clone)]
pub struct Upstream {
    inner: Arc<UpstreamInner>,
}

impl Upstream {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            inner: Arc::new(UpstreamInner {
                addr,
                name: name.into(),
                recent_errors: AtomicU64::new(0),
                last_error_at: Mutex::new(None),
                dead_until: Mutex::new(None),
            }),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_dead(&self) -> bool {
        match *self.inner.dead_until.lock() {
            Some(until) => SystemTime::now() < until,
            None => false,
        }
    }

    /// `upstream_fail(u)`: increments the error counter; crossing
    /// `max_errors` within `error_time` marks the peer dead for `dead_time`.
    pub fn fail(&self, max_errors: u64, error_time: Duration, dead_time: Duration) {
        let now = SystemTime::now();
        let mut last_error = self.inner.last_error_at.lock();
        let within_window = last_error
            .map(|prev| now.duration_since(prev).unwrap_or_default() <= error_time)
            .unwrap_or(false);

        let errors = if within_window {
            self.inner.recent_errors.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.inner.recent_errors.store(1, Ordering::SeqCst);
            1
        };
        *last_error = Some(now);

        if errors >= max_errors {
            *self.inner.dead_until.lock() = Some(now + dead_time);
        }
    }

    /// `upstream_ok(u)`: resets error counters.
    pub fn ok(&self) {
        self.inner.recent_errors.store(0, Ordering::SeqCst);
        *self.inner.last_error_at.lock() = None;
        *self.inner.dead_until.lock() = None;
    }

    pub fn recent_errors(&self) -> u64 {
        self.inner.recent_errors.load(Ordering::SeqCst)
    }
}

/// Failure policy shared by every upstream in a pool.
#[derive(Clone, Copy, Debug)]
pub struct UpstreamPolicy {
    pub max_errors: u64,
    pub error_time: Duration,
    pub dead_time: Duration,
}

impl Default for UpstreamPolicy {
    fn default() -> Self {
        Self {
            max_errors: 10,
            error_time: Duration::from_secs(10),
            dead_time: Duration::from_secs(40),
        }
    }
}

/// A logical endpoint backed by one or more physical peers (spec §4.7).
pub struct UpstreamPool {
    upstreams: Vec<Upstream>,
    policy: UpstreamPolicy,
    round_robin_cursor: AtomicU64,
}

impl UpstreamPool {
    /// `upstreams_from_config(list) -> pool`.
    pub fn upstreams_from_config(upstreams: Vec<Upstream>, policy: UpstreamPolicy) -> Self {
        Self {
            upstreams,
            policy,
            round_robin_cursor: AtomicU64::new(0),
        }
    }

    pub fn fail(&self, upstream: &Upstream) {
        upstream.fail(self.policy.max_errors, self.policy.error_time, self.policy.dead_time);
    }

    pub fn ok(&self, upstream: &Upstream) {
        upstream.ok();
    }

    /// `get(pool, strategy, key?, key_len) -> upstream`.
    ///
    /// Never returns a dead upstream unless every one is dead (spec §4.7).
    pub fn get(&self, strategy: UpstreamStrategy, key: Option<&[u8]>) -> Option<Upstream> {
        if self.upstreams.is_empty() {
            return None;
        }
        let live: Vec<&Upstream> = self.upstreams.iter().filter(|u| !u.is_dead()).collect();
        let pool: &[&Upstream] = if live.is_empty() {
            let all: Vec<&Upstream> = self.upstreams.iter().collect();
            return all.first().map(|u| (*u).clone());
        } else {
            &live
        };

        let chosen = match strategy {
            UpstreamStrategy::RoundRobin => {
                let idx = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) as usize % pool.len();
                pool[idx]
            }
            UpstreamStrategy::MasterSlave => pool[0],
            UpstreamStrategy::ConsistentHash => {
                let hash = key.map(fnv1a).unwrap_or(0);
                pool[(hash as usize) % pool.len()]
            }
        };
        Some(chosen.clone())
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    pub fn all(&self) -> &[Upstream] {
        &self.upstreams
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
