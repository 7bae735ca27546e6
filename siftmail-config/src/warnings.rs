//! Non-fatal configuration issues surfaced at startup (spec §7:
//! "Configuration: rule registered twice → first wins, second logged as
//! duplicate"). Unlike [`crate::error::ConfigGuardRailError`], a warning
//! never stops the daemon from starting.

use std::fmt;

#[derive(Debug, Clone)]
pub enum ConfigWarning {
    /// A rule score entry appeared in more than one metric's `rules` table
    /// under the same name with differing scores; the first metric's value
    /// was used for both (this mirrors `SymbolCache::add_symbol`'s
    /// first-registration-wins rule for duplicate symbol definitions).
    DuplicateRuleScore { metric: String, rule: String },
    /// A group has `max_score <= 0`, which `Metric::group_max_score` treats
    /// as "uncapped" rather than an error.
    UncappedGroup { metric: String, group: String },
    /// An upstream pool has zero entries; the pool falls back to returning
    /// `None` on every `get()` rather than failing to start.
    EmptyUpstreamPool { name: String },
    /// A statfile's `max_tokens` is smaller than its `min_tokens`, which
    /// means `run_classifier_scan` will always skip it as below the minimum.
    ClassifierNeverRuns { classifier: String, symbol: String },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::DuplicateRuleScore { metric, rule } => write!(
                f,
                "metric '{metric}': rule '{rule}' is configured more than once; first definition wins"
            ),
            ConfigWarning::UncappedGroup { metric, group } => write!(
                f,
                "metric '{metric}': group '{group}' has max_score <= 0 and is treated as uncapped"
            ),
            ConfigWarning::EmptyUpstreamPool { name } => {
                write!(f, "upstream pool '{name}' has no configured peers")
            }
            ConfigWarning::ClassifierNeverRuns { classifier, symbol } => write!(
                f,
                "classifier '{classifier}' statfile '{symbol}': max_tokens < min_tokens, scan will always skip"
            ),
        }
    }
}

/// An ordered collection of [`ConfigWarning`]s accumulated while building a
/// [`crate::RuntimeConfig`] from a [`crate::schema::RawConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConfigWarnings(Vec<ConfigWarning>);

impl ConfigWarnings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, warning: ConfigWarning) {
        self.0.push(warning);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.0.iter()
    }

    pub fn log_all(&self) {
        for warning in &self.0 {
            tracing::warn!(%warning, "configuration warning");
        }
    }
}

impl IntoIterator for ConfigWarnings {
    type Item = ConfigWarning;
    type IntoIter = std::vec::IntoIter<ConfigWarning>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
