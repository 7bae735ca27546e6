use std::path::PathBuf;

use thiserror::Error;

/// Startup-time validation failures that refuse the daemon from starting
/// (spec §7 "Configuration": "dependency cycle → validation fails and daemon
/// refuses to start").
#[derive(Error, Debug)]
pub enum ConfigGuardRailError {
    #[error("metric '{metric}' references unknown group '{group}' for rule '{rule}'")]
    UnknownGroup { metric: String, rule: String, group: String },

    #[error("metric '{metric}' has action threshold for unrecognized action '{action}'")]
    UnknownAction { metric: String, action: String },

    #[error("no metric named 'default' is configured")]
    MissingDefaultMetric,

    #[error("upstream '{name}' has an unparseable address '{addr}': {source}")]
    InvalidUpstreamAddr {
        name: String,
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("fuzzy allow_update entry '{entry}' is not a valid CIDR: {source}")]
    InvalidCidr {
        entry: String,
        #[source]
        source: ipnetwork::IpNetworkError,
    },

    #[error("statfile #{index} ('{symbol}') is the only polarity registered for classifier '{classifier}'; a classifier needs both a spam and a ham statfile to vote")]
    DanglingStatfile { index: usize, symbol: String, classifier: String },
}

/// Errors while locating, reading, or parsing the configuration source
/// itself, as distinct from semantic validation ([`ConfigGuardRailError`]).
#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] config::ConfigError),

    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
}
