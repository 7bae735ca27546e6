//! Turns a parsed [`RawConfig`](crate::schema::RawConfig) into the runtime
//! types `siftmail_core` actually operates on, collecting
//! [`ConfigWarning`]s along the way and failing hard on
//! [`ConfigGuardRailError`]s (spec §7 "Configuration").

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use ipnetwork::IpNetwork;
use siftmail_contracts::{Action, RuleFlags};
use siftmail_core::fuzzy::store::FuzzyStoreConfig;
use siftmail_core::pool::ConnectionPoolConfig;
use siftmail_core::scoring::metric::{GroupDef, Metric, MetricTable, RuleScoreDef};
use siftmail_core::upstream::{Upstream, UpstreamPolicy, UpstreamPool, UpstreamStrategy};

use crate::error::ConfigGuardRailError;
use crate::schema::{
    FuzzyBackendKind, MetricConfig, RawConfig, StatBackendKind, StatfileConfig, UpstreamConfig,
    UpstreamStrategyConfig,
};
use crate::warnings::{ConfigWarning, ConfigWarnings};

/// The fully validated, ready-to-use shape of the configuration: runtime
/// types from `siftmail_core` rather than the serde schema.
pub struct RuntimeConfig {
    pub workers: usize,
    pub listen_addr: SocketAddr,
    pub metrics: MetricTable,
    pub fuzzy_store_config: FuzzyStoreConfig,
    pub fuzzy_listen_addr: SocketAddr,
    pub fuzzy_backend: FuzzyBackendKind,
    pub pool_config: ConnectionPoolConfig,
    pub upstream_pools: HashMap<String, (UpstreamPool, UpstreamStrategy)>,
    pub statfiles: Vec<StatfileConfig>,
    pub roll_history_capacity: usize,
}

fn parse_action(name: &str) -> Option<Action> {
    // `Action`'s `Serialize` impl is `#[serde(rename_all = "kebab-case")]`;
    // round-trip through that representation rather than hand-matching each
    // variant name twice.
    serde_json::from_value(serde_json::Value::String(name.to_string())).ok()
}

fn build_metric(name: &str, config: &MetricConfig, warnings: &mut ConfigWarnings) -> Result<Metric, ConfigGuardRailError> {
    let mut metric = Metric::new(name);
    metric.grow_factor = config.grow_factor;
    metric.default_max_shots = config.default_max_shots.max(1);

    for (group_name, group) in &config.groups {
        if group.max_score <= 0.0 {
            warnings.push(ConfigWarning::UncappedGroup {
                metric: name.to_string(),
                group: group_name.clone(),
            });
        }
        metric.groups.insert(
            group_name.clone(),
            GroupDef { name: group_name.clone(), max_score: group.max_score },
        );
    }

    for (rule_name, rule) in &config.rules {
        if let Some(group) = &rule.group {
            if !metric.groups.contains_key(group) {
                return Err(ConfigGuardRailError::UnknownGroup {
                    metric: name.to_string(),
                    rule: rule_name.clone(),
                    group: group.clone(),
                });
            }
        }
        let flags = RuleFlags {
            fine: rule.fine,
            nice: rule.nice,
            empty_allowed: false,
            skipped: false,
            one_param: rule.one_param,
            one_shot: rule.one_shot,
            ignore: rule.ignore,
        };
        if metric
            .rules
            .insert(
                rule_name.clone(),
                RuleScoreDef {
                    score: rule.score,
                    description: rule.description.clone(),
                    group: rule.group.clone(),
                    flags,
                    nshots: rule.nshots,
                },
            )
            .is_some()
        {
            warnings.push(ConfigWarning::DuplicateRuleScore {
                metric: name.to_string(),
                rule: rule_name.clone(),
            });
        }
    }

    for (action_name, threshold) in &config.action_thresholds {
        let action = parse_action(action_name).ok_or_else(|| ConfigGuardRailError::UnknownAction {
            metric: name.to_string(),
            action: action_name.clone(),
        })?;
        metric.action_thresholds.insert(action, *threshold);
    }

    Ok(metric)
}

fn build_upstream_pools(
    upstreams: &[UpstreamConfig],
    warnings: &mut ConfigWarnings,
) -> Result<HashMap<String, (UpstreamPool, UpstreamStrategy)>, ConfigGuardRailError> {
    let mut grouped: HashMap<String, Vec<&UpstreamConfig>> = HashMap::new();
    for entry in upstreams {
        grouped.entry(entry.name.clone()).or_default().push(entry);
    }

    let mut pools = HashMap::new();
    for (name, entries) in grouped {
        let policy_source = entries[0];
        let policy = UpstreamPolicy {
            max_errors: policy_source.max_errors,
            error_time: Duration::from_secs(policy_source.error_time_secs),
            dead_time: Duration::from_secs(policy_source.dead_time_secs),
        };
        let strategy = match policy_source.strategy {
            UpstreamStrategyConfig::RoundRobin => UpstreamStrategy::RoundRobin,
            UpstreamStrategyConfig::MasterSlave => UpstreamStrategy::MasterSlave,
            UpstreamStrategyConfig::ConsistentHash => UpstreamStrategy::ConsistentHash,
        };

        if entries.is_empty() {
            warnings.push(ConfigWarning::EmptyUpstreamPool { name: name.clone() });
        }

        let mut members = Vec::with_capacity(entries.len());
        for entry in &entries {
            let addr: SocketAddr = entry.addr.parse().map_err(|source| ConfigGuardRailError::InvalidUpstreamAddr {
                name: name.clone(),
                addr: entry.addr.clone(),
                source,
            })?;
            members.push(Upstream::new(entry.name.clone(), addr));
        }
        let pool = UpstreamPool::upstreams_from_config(members, policy);
        pools.insert(name, (pool, strategy));
    }
    Ok(pools)
}

fn build_fuzzy_store_config(raw: &RawConfig, warnings: &mut ConfigWarnings) -> Result<FuzzyStoreConfig, ConfigGuardRailError> {
    let _ = warnings;
    let mut allow_update = Vec::with_capacity(raw.fuzzy.allow_update.len());
    for entry in &raw.fuzzy.allow_update {
        let net: IpNetwork = entry.parse().map_err(|source| ConfigGuardRailError::InvalidCidr {
            entry: entry.clone(),
            source,
        })?;
        allow_update.push(net);
    }
    Ok(FuzzyStoreConfig {
        expire_secs: raw.fuzzy.expire_secs,
        sync_timeout: Duration::from_secs(raw.fuzzy.sync_timeout_secs),
        allow_update,
        key_prefix: raw.fuzzy.key_prefix.clone(),
    })
}

/// Validates the statfile list (spec §4.6/§6.5): every classifier name
/// groups its statfiles implicitly (there is no separate classifier
/// registry, see DESIGN.md), so a classifier with only spam or only ham
/// statfiles can never produce a meaningful vote. That case is a guard-rail
/// error rather than a warning, matching the severity of the other
/// structural checks in `validate`.
fn validate_statfiles(statfiles: &[StatfileConfig], warnings: &mut ConfigWarnings) -> Result<(), ConfigGuardRailError> {
    for (index, statfile) in statfiles.iter().enumerate() {
        if statfile.classifier.is_empty() {
            warnings.push(ConfigWarning::ClassifierNeverRuns {
                classifier: format!("#{index}"),
                symbol: statfile.symbol.clone(),
            });
        }
        if statfile.max_tokens < statfile.min_tokens {
            warnings.push(ConfigWarning::ClassifierNeverRuns {
                classifier: statfile.classifier.clone(),
                symbol: statfile.symbol.clone(),
            });
        }
    }

    let mut polarities: HashMap<&str, (bool, bool)> = HashMap::new();
    for statfile in statfiles {
        if statfile.classifier.is_empty() {
            continue;
        }
        let entry = polarities.entry(statfile.classifier.as_str()).or_insert((false, false));
        if statfile.is_spam {
            entry.0 = true;
        } else {
            entry.1 = true;
        }
    }

    for (index, statfile) in statfiles.iter().enumerate() {
        if statfile.classifier.is_empty() {
            continue;
        }
        let (has_spam, has_ham) = polarities[statfile.classifier.as_str()];
        if !(has_spam && has_ham) {
            return Err(ConfigGuardRailError::DanglingStatfile {
                index,
                symbol: statfile.symbol.clone(),
                classifier: statfile.classifier.clone(),
            });
        }
    }

    Ok(())
}

/// Validates and lowers a [`RawConfig`] into a [`RuntimeConfig`], per spec
/// §7 ("dependency cycle → validation fails and daemon refuses to start";
/// here the analogous guard rails are unknown groups/actions/addresses).
pub fn validate(raw: RawConfig) -> Result<(RuntimeConfig, ConfigWarnings), ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::new();

    let mut metrics = MetricTable::new();
    for (name, metric_config) in &raw.metrics {
        metrics.insert(build_metric(name, metric_config, &mut warnings)?);
    }
    if metrics.default_metric().is_none() {
        return Err(ConfigGuardRailError::MissingDefaultMetric);
    }

    let listen_addr: SocketAddr = raw
        .listen_addr
        .parse()
        .map_err(|source| ConfigGuardRailError::InvalidUpstreamAddr {
            name: "listen_addr".to_string(),
            addr: raw.listen_addr.clone(),
            source,
        })?;
    let fuzzy_listen_addr: SocketAddr =
        raw.fuzzy
            .listen_addr
            .parse()
            .map_err(|source| ConfigGuardRailError::InvalidUpstreamAddr {
                name: "fuzzy.listen_addr".to_string(),
                addr: raw.fuzzy.listen_addr.clone(),
                source,
            })?;

    let fuzzy_store_config = build_fuzzy_store_config(&raw, &mut warnings)?;
    let upstream_pools = build_upstream_pools(&raw.upstreams, &mut warnings)?;
    validate_statfiles(&raw.statfiles, &mut warnings)?;

    let runtime = RuntimeConfig {
        workers: raw.workers.max(1),
        listen_addr,
        metrics,
        fuzzy_store_config,
        fuzzy_listen_addr,
        fuzzy_backend: raw.fuzzy.backend.clone(),
        pool_config: ConnectionPoolConfig {
            idle_timeout: Duration::from_secs(raw.pool.idle_timeout_secs),
            max_conns: raw.pool.max_conns,
        },
        statfiles: raw.statfiles,
        roll_history_capacity: raw.roll_history_capacity,
    };
    Ok((runtime, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{GroupConfig, RuleScoreConfig};

    fn default_metric() -> MetricConfig {
        let mut metric = MetricConfig::default();
        metric.action_thresholds.insert("reject".to_string(), 5.0);
        metric.rules.insert(
            "FOO".to_string(),
            RuleScoreConfig { score: 2.0, ..Default::default() },
        );
        metric
    }

    #[test]
    fn missing_default_metric_is_a_guard_rail_error() {
        let raw = RawConfig::default();
        let err = validate(raw).unwrap_err();
        assert!(matches!(err, ConfigGuardRailError::MissingDefaultMetric));
    }

    #[test]
    fn unknown_group_reference_is_rejected() {
        let mut raw = RawConfig::default();
        let mut metric = default_metric();
        metric.rules.get_mut("FOO").unwrap().group = Some("nosuchgroup".to_string());
        raw.metrics.insert("default".to_string(), metric);

        let err = validate(raw).unwrap_err();
        assert!(matches!(err, ConfigGuardRailError::UnknownGroup { .. }));
    }

    #[test]
    fn unrecognized_action_name_is_rejected() {
        let mut raw = RawConfig::default();
        let mut metric = default_metric();
        metric.action_thresholds.insert("quarantine".to_string(), 1.0);
        raw.metrics.insert("default".to_string(), metric);

        let err = validate(raw).unwrap_err();
        assert!(matches!(err, ConfigGuardRailError::UnknownAction { .. }));
    }

    #[test]
    fn uncapped_group_is_a_warning_not_an_error() {
        let mut raw = RawConfig::default();
        let mut metric = default_metric();
        metric.groups.insert("G".to_string(), GroupConfig { max_score: 0.0 });
        raw.metrics.insert("default".to_string(), metric);

        let (_runtime, warnings) = validate(raw).unwrap();
        assert!(!warnings.is_empty());
    }

    #[test]
    fn valid_config_lowers_into_runtime_metric() {
        let mut raw = RawConfig::default();
        raw.metrics.insert("default".to_string(), default_metric());

        let (runtime, _warnings) = validate(raw).unwrap();
        let metric = runtime.metrics.get("default").unwrap();
        assert_eq!(metric.rule_def("FOO").unwrap().score, 2.0);
        assert_eq!(metric.threshold(Action::Reject), 5.0);
    }

    #[test]
    fn invalid_cidr_in_allow_update_is_rejected() {
        let mut raw = RawConfig::default();
        raw.metrics.insert("default".to_string(), default_metric());
        raw.fuzzy.allow_update = vec!["not-a-cidr".to_string()];

        let err = validate(raw).unwrap_err();
        assert!(matches!(err, ConfigGuardRailError::InvalidCidr { .. }));
    }

    fn statfile(classifier: &str, symbol: &str, is_spam: bool) -> StatfileConfig {
        StatfileConfig {
            classifier: classifier.to_string(),
            symbol: symbol.to_string(),
            is_spam,
            min_tokens: 1,
            max_tokens: 100,
            ..StatfileConfig::default()
        }
    }

    #[test]
    fn statfile_with_no_opposite_polarity_counterpart_is_rejected() {
        let mut raw = RawConfig::default();
        raw.metrics.insert("default".to_string(), default_metric());
        raw.statfiles = vec![statfile("bayes", "BAYES_SPAM", true)];

        let err = validate(raw).unwrap_err();
        assert!(matches!(err, ConfigGuardRailError::DanglingStatfile { .. }));
    }

    #[test]
    fn statfile_pair_with_both_polarities_is_accepted() {
        let mut raw = RawConfig::default();
        raw.metrics.insert("default".to_string(), default_metric());
        raw.statfiles = vec![statfile("bayes", "BAYES_SPAM", true), statfile("bayes", "BAYES_HAM", false)];

        let (runtime, _warnings) = validate(raw).unwrap();
        assert_eq!(runtime.statfiles.len(), 2);
    }
}
