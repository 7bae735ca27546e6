//! Serde-shaped TOML schema for the daemon's configuration file.
//!
//! These types mirror `siftmail_core`'s runtime types (`Metric`, `GroupDef`,
//! `RuleScoreDef`, ...) but stay plain-data and serde-friendly — action
//! thresholds are keyed by string here, not by `Action`, so the table can
//! round-trip through TOML without a custom map-key impl. [`crate::convert`]
//! turns a validated [`RawConfig`] into the core types.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RawConfig {
    pub workers: usize,
    pub listen_addr: String,
    pub fuzzy: FuzzyConfig,
    pub pool: ConnectionPoolConfig,
    pub metrics: HashMap<String, MetricConfig>,
    pub upstreams: Vec<UpstreamConfig>,
    pub statfiles: Vec<StatfileConfig>,
    pub roll_history_capacity: usize,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            listen_addr: default_listen_addr(),
            fuzzy: FuzzyConfig::default(),
            pool: ConnectionPoolConfig::default(),
            metrics: HashMap::new(),
            upstreams: Vec::new(),
            statfiles: Vec::new(),
            roll_history_capacity: 4096,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn default_listen_addr() -> String {
    "127.0.0.1:11333".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub enum FuzzyBackendKind {
    Embedded { path: PathBuf },
    Redis { url: String },
}

impl Default for FuzzyBackendKind {
    fn default() -> Self {
        FuzzyBackendKind::Embedded { path: PathBuf::from("fuzzy.db") }
    }
}

/// Schema for `siftmail_core::fuzzy::store::FuzzyStoreConfig` plus the
/// listening address for the datagram protocol (spec §4.5, §6.2).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FuzzyConfig {
    pub listen_addr: String,
    pub expire_secs: u64,
    pub sync_timeout_secs: u64,
    /// CIDR ranges allowed to send `Write`/`Del` (spec §6.2).
    pub allow_update: Vec<String>,
    pub key_prefix: String,
    pub backend: FuzzyBackendKind,
}

impl Default for FuzzyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:11334".to_string(),
            expire_secs: 172_800,
            sync_timeout_secs: 10,
            allow_update: vec!["127.0.0.1/32".to_string()],
            key_prefix: "fz:".to_string(),
            backend: FuzzyBackendKind::default(),
        }
    }
}

/// Schema for `siftmail_core::pool::ConnectionPoolConfig` (component H).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    pub idle_timeout_secs: u64,
    pub max_conns: usize,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self { idle_timeout_secs: 300, max_conns: 32 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GroupConfig {
    pub max_score: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RuleScoreConfig {
    pub score: f64,
    pub description: Option<String>,
    pub group: Option<String>,
    #[serde(default)]
    pub fine: bool,
    #[serde(default)]
    pub nice: bool,
    #[serde(default)]
    pub one_param: bool,
    #[serde(default)]
    pub one_shot: bool,
    #[serde(default)]
    pub ignore: bool,
    pub nshots: Option<u32>,
}

/// Schema for `siftmail_core::scoring::metric::Metric` (spec §3 "Metric").
///
/// `action_thresholds` is keyed by the action's kebab-case name (`"reject"`,
/// `"add-header"`, ...), matching `Action`'s own `Serialize` impl.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct MetricConfig {
    pub rules: HashMap<String, RuleScoreConfig>,
    pub action_thresholds: HashMap<String, f64>,
    pub grow_factor: f64,
    pub groups: HashMap<String, GroupConfig>,
    pub default_max_shots: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamStrategyConfig {
    #[default]
    RoundRobin,
    MasterSlave,
    ConsistentHash,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub name: String,
    pub addr: String,
    pub strategy: UpstreamStrategyConfig,
    pub max_errors: u64,
    pub error_time_secs: u64,
    pub dead_time_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            addr: String::new(),
            strategy: UpstreamStrategyConfig::default(),
            max_errors: 10,
            error_time_secs: 10,
            dead_time_secs: 40,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub enum StatBackendKind {
    Redis { url: String },
    Postgres { dsn: String },
}

impl Default for StatBackendKind {
    fn default() -> Self {
        StatBackendKind::Redis { url: "redis://127.0.0.1:6379/0".to_string() }
    }
}

/// Schema for one `StatfileDef` (spec §3 "Statfile", §4.6).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatfileConfig {
    pub classifier: String,
    pub symbol: String,
    pub is_spam: bool,
    pub backend: StatBackendKind,
    pub min_tokens: usize,
    pub max_tokens: usize,
}

impl Default for StatfileConfig {
    fn default() -> Self {
        Self {
            classifier: String::new(),
            symbol: String::new(),
            is_spam: false,
            backend: StatBackendKind::default(),
            min_tokens: 11,
            max_tokens: 1024,
        }
    }
}
