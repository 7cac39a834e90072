//! Resolution metrics.
//!
//! Lock-free counters with relaxed ordering, a fixed-bucket latency histogram,
//! and an error-rate alert over the most recent request outcomes. Exact
//! cross-counter consistency is not required; [`Metrics::snapshot`] is a
//! best-effort serializable view.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

use crate::config::AlertConfig;
use crate::pipeline::{SkipReason, Source};

/// Upper bounds (inclusive, ms) of the latency buckets. Slower requests land in
/// an overflow bucket.
pub const LATENCY_BUCKETS_MS: [u64; 10] = [10, 25, 50, 100, 250, 500, 1_000, 2_500, 10_000, 30_000];

#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    total_ms: AtomicU64,
    count: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            total_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }
}

impl LatencyHistogram {
    pub fn record(&self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        let slot = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts = self
            .buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_ms.load(Ordering::Relaxed);
        HistogramSnapshot {
            bounds_ms: LATENCY_BUCKETS_MS.to_vec(),
            counts,
            count,
            mean_ms: if count == 0 {
                0.0
            } else {
                total as f64 / count as f64
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub bounds_ms: Vec<u64>,
    /// One more entry than `bounds_ms`; the last is the overflow bucket.
    pub counts: Vec<u64>,
    pub count: u64,
    pub mean_ms: f64,
}

#[derive(Debug, Default)]
struct AlertWindow {
    outcomes: VecDeque<bool>,
    errors: usize,
    firing: bool,
}

/// Fires once when the error fraction of the last `window` outcomes exceeds
/// `threshold` (after `min_samples`), and re-arms when it drops back to or
/// below the threshold.
#[derive(Debug)]
pub struct ErrorRateAlert {
    window: usize,
    min_samples: usize,
    threshold: f64,
    state: Mutex<AlertWindow>,
    fired: AtomicU64,
}

impl ErrorRateAlert {
    pub fn new(config: &AlertConfig) -> Self {
        Self {
            window: config.window.max(1),
            min_samples: config.min_samples.max(1),
            threshold: config.threshold,
            state: Mutex::new(AlertWindow::default()),
            fired: AtomicU64::new(0),
        }
    }

    /// Record one outcome. Returns `true` when this outcome tripped the alert.
    pub fn record(&self, is_error: bool) -> bool {
        let mut state = self.state.lock();
        state.outcomes.push_back(is_error);
        if is_error {
            state.errors += 1;
        }
        while state.outcomes.len() > self.window {
            if state.outcomes.pop_front() == Some(true) {
                state.errors -= 1;
            }
        }

        let samples = state.outcomes.len();
        let rate = state.errors as f64 / samples as f64;

        if !state.firing && samples >= self.min_samples && rate > self.threshold {
            state.firing = true;
            self.fired.fetch_add(1, Ordering::Relaxed);
            error!(
                "error rate {:.1}% over last {samples} requests exceeds {:.1}%",
                rate * 100.0,
                self.threshold * 100.0
            );
            return true;
        }
        if state.firing && rate <= self.threshold {
            state.firing = false;
            info!("error rate back to {:.1}%", rate * 100.0);
        }
        false
    }

    pub fn is_firing(&self) -> bool {
        self.state.lock().firing
    }

    pub fn error_rate(&self) -> f64 {
        let state = self.state.lock();
        if state.outcomes.is_empty() {
            0.0
        } else {
            state.errors as f64 / state.outcomes.len() as f64
        }
    }

    pub fn times_fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }
}

/// All counters of one resolver.
#[derive(Debug)]
pub struct Metrics {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    keyword_hits: AtomicU64,
    vector_general_hits: AtomicU64,
    vector_technical_hits: AtomicU64,
    generative_hits: AtomicU64,
    no_answer: AtomicU64,
    errors: AtomicU64,
    rate_limited: AtomicU64,
    paused: AtomicU64,
    ignored: AtomicU64,
    guard_vetoes: AtomicU64,
    sync_successes: AtomicU64,
    sync_failures: AtomicU64,
    latency: LatencyHistogram,
    alert: ErrorRateAlert,
}

impl Metrics {
    pub fn new(alerting: &AlertConfig) -> Self {
        Self {
            requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            keyword_hits: AtomicU64::new(0),
            vector_general_hits: AtomicU64::new(0),
            vector_technical_hits: AtomicU64::new(0),
            generative_hits: AtomicU64::new(0),
            no_answer: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            paused: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            guard_vetoes: AtomicU64::new(0),
            sync_successes: AtomicU64::new(0),
            sync_failures: AtomicU64::new(0),
            latency: LatencyHistogram::default(),
            alert: ErrorRateAlert::new(alerting),
        }
    }

    /// A request that ran the pipeline to a terminal state.
    ///
    /// `stage_errors` counts operational failures seen on the way; NoAnswer by
    /// itself is not an error.
    pub fn record_resolution(&self, source: Source, latency: Duration, stage_errors: usize) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let counter = match source {
            Source::Cache => &self.cache_hits,
            Source::Keyword => &self.keyword_hits,
            Source::VectorGeneral => &self.vector_general_hits,
            Source::VectorTechnical => &self.vector_technical_hits,
            Source::Generative => &self.generative_hits,
            Source::None => &self.no_answer,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if source != Source::Cache {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
        if stage_errors > 0 {
            self.errors.fetch_add(stage_errors as u64, Ordering::Relaxed);
        }
        self.latency.record(latency);
        self.alert.record(stage_errors > 0);
    }

    pub fn record_skip(&self, reason: SkipReason) {
        let counter = match reason {
            SkipReason::Paused => &self.paused,
            SkipReason::RateLimited => &self.rate_limited,
            SkipReason::Ignored => &self.ignored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_guard_veto(&self) {
        self.guard_vetoes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync(&self, ok: bool) {
        let counter = if ok {
            &self.sync_successes
        } else {
            &self.sync_failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alert(&self) -> &ErrorRateAlert {
        &self.alert
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            requests: load(&self.requests),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            keyword_hits: load(&self.keyword_hits),
            vector_general_hits: load(&self.vector_general_hits),
            vector_technical_hits: load(&self.vector_technical_hits),
            generative_hits: load(&self.generative_hits),
            no_answer: load(&self.no_answer),
            errors: load(&self.errors),
            rate_limited: load(&self.rate_limited),
            paused: load(&self.paused),
            ignored: load(&self.ignored),
            guard_vetoes: load(&self.guard_vetoes),
            sync_successes: load(&self.sync_successes),
            sync_failures: load(&self.sync_failures),
            error_rate: self.alert.error_rate(),
            alert_firing: self.alert.is_firing(),
            latency: self.latency.snapshot(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub keyword_hits: u64,
    pub vector_general_hits: u64,
    pub vector_technical_hits: u64,
    pub generative_hits: u64,
    pub no_answer: u64,
    pub errors: u64,
    pub rate_limited: u64,
    pub paused: u64,
    pub ignored: u64,
    pub guard_vetoes: u64,
    pub sync_successes: u64,
    pub sync_failures: u64,
    pub error_rate: f64,
    pub alert_firing: bool,
    pub latency: HistogramSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert_config(window: usize, min_samples: usize, threshold: f64) -> AlertConfig {
        AlertConfig {
            window,
            min_samples,
            threshold,
        }
    }

    #[test]
    fn test_histogram_buckets() {
        let histogram = LatencyHistogram::default();
        histogram.record(Duration::from_millis(5));
        histogram.record(Duration::from_millis(10));
        histogram.record(Duration::from_millis(11));
        histogram.record(Duration::from_secs(60));

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.counts.len(), LATENCY_BUCKETS_MS.len() + 1);
        assert_eq!(snapshot.counts[0], 2);
        assert_eq!(snapshot.counts[1], 1);
        assert_eq!(*snapshot.counts.last().unwrap(), 1);
        assert_eq!(snapshot.count, 4);
    }

    #[test]
    fn test_alert_needs_min_samples() {
        let alert = ErrorRateAlert::new(&alert_config(10, 5, 0.5));
        for _ in 0..4 {
            assert!(!alert.record(true));
        }
        assert!(alert.record(true));
        assert!(alert.is_firing());
        // stays quiet while firing
        assert!(!alert.record(true));
        assert_eq!(alert.times_fired(), 1);
    }

    #[test]
    fn test_alert_rearms() {
        let alert = ErrorRateAlert::new(&alert_config(4, 2, 0.5));
        alert.record(true);
        assert!(alert.record(true));
        for _ in 0..4 {
            alert.record(false);
        }
        assert!(!alert.is_firing());
        // [F, F, F, T] then [F, F, T, T]: at the threshold, not above it
        assert!(!alert.record(true));
        assert!(!alert.record(true));
        // [F, T, T, T]
        assert!(alert.record(true));
        assert_eq!(alert.times_fired(), 2);
    }

    #[test]
    fn test_alert_thresholds() {
        for (threshold, errors_in_ten, fires) in [(0.1, 1, false), (0.1, 2, true), (0.5, 5, false), (0.5, 6, true)] {
            let alert = ErrorRateAlert::new(&alert_config(10, 10, threshold));
            let mut fired = false;
            for i in 0..10 {
                fired |= alert.record(i < errors_in_ten);
            }
            assert_eq!(fired, fires, "threshold {threshold} errors {errors_in_ten}");
        }
    }

    #[test]
    fn test_resolution_counters() {
        let metrics = Metrics::new(&AlertConfig::default());
        metrics.record_resolution(Source::Keyword, Duration::from_millis(3), 0);
        metrics.record_resolution(Source::Cache, Duration::from_millis(1), 0);
        metrics.record_resolution(Source::None, Duration::from_millis(30), 2);
        metrics.record_skip(SkipReason::RateLimited);
        metrics.record_sync(true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests, 3);
        assert_eq!(snapshot.keyword_hits, 1);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 2);
        assert_eq!(snapshot.no_answer, 1);
        assert_eq!(snapshot.errors, 2);
        assert_eq!(snapshot.rate_limited, 1);
        assert_eq!(snapshot.sync_successes, 1);
        assert_eq!(snapshot.latency.count, 3);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["keyword_hits"], 1);
    }
}
