//! Per-rule running statistics (spec §4.2 "Statistics").

use parking_lot::Mutex;

/// Default EMA coefficient. Spec §9 Open Questions: "the frequency EMA
/// coefficient α is not exposed as a configuration value in the source;
/// treat its numeric value as implementation-defined but document it."
/// 1/64 matches the smoothing window used elsewhere in the spec's source
/// material for similar running-average counters.
pub const DEFAULT_FREQUENCY_ALPHA: f64 = 1.0 / 64.0;

#[derive(Clone, Copy, Debug, Default)]
pub struct RuleStatsSnapshot {
    pub hits: u64,
    pub frequency: f64,
    pub stddev: f64,
    pub mean_time_secs: f64,
}

struct RuleStatsInner {
    hits: u64,
    frequency: f64,
    /// EMA of squared deviation; `stddev` is its square root.
    variance_ema: f64,
    mean_time_secs: f64,
    alpha: f64,
}

/// Running hit-rate, variance, and latency statistics for one rule.
///
/// A [`PeakCallback`] may be registered to observe large swings (spec §4.2:
/// "when |frequency - ema| > 2*stddev over a window").
pub struct RuleStats {
    inner: Mutex<RuleStatsInner>,
}

pub type PeakCallback = Box<dyn Fn(&str, f64, f64, f64, f64) + Send + Sync>;

impl RuleStats {
    pub fn new(alpha: f64) -> Self {
        Self {
            inner: Mutex::new(RuleStatsInner {
                hits: 0,
                frequency: 0.0,
                variance_ema: 0.0,
                mean_time_secs: 0.0,
                alpha,
            }),
        }
    }

    /// Records one rule run: `fired` increments the hit counter and feeds
    /// the frequency EMA; `latency_secs` feeds the mean-latency EMA.
    /// Returns the squared error term (`error^2`) for an optional peak
    /// callback to evaluate against `2*stddev`.
    pub fn record(&self, fired: bool, latency_secs: f64, name: &str, peak: Option<&PeakCallback>) {
        let mut inner = self.inner.lock();
        if fired {
            inner.hits += 1;
        }
        let sample = if fired { 1.0 } else { 0.0 };
        let alpha = inner.alpha;

        let previous_frequency = inner.frequency;
        inner.frequency = ema(previous_frequency, sample, alpha);

        let deviation = sample - previous_frequency;
        inner.variance_ema = ema(inner.variance_ema, deviation * deviation, alpha);

        inner.mean_time_secs = ema(inner.mean_time_secs, latency_secs, alpha);

        let stddev = inner.variance_ema.sqrt();
        let error_sq = deviation * deviation;
        if let Some(peak) = peak {
            if (sample - inner.frequency).abs() > 2.0 * stddev {
                peak(name, inner.mean_time_secs, stddev, sample, error_sq);
            }
        }
    }

    pub fn snapshot(&self) -> RuleStatsSnapshot {
        let inner = self.inner.lock();
        RuleStatsSnapshot {
            hits: inner.hits,
            frequency: inner.frequency,
            stddev: inner.variance_ema.sqrt(),
            mean_time_secs: inner.mean_time_secs,
        }
    }
}

impl Default for RuleStats {
    fn default() -> Self {
        Self::new(DEFAULT_FREQUENCY_ALPHA)
    }
}

fn ema(previous: f64, sample: f64, alpha: f64) -> f64 {
    previous + alpha * (sample - previous)
}
