//! Completion time estimation
//!
//! Two signals live here: a shared exponential moving average of tokens per
//! request (cost is driven by response length, not device speed, so one
//! average serves every device), and a bounded window of recent completion
//! durations per device.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Default smoothing factor for the running token average
pub const DEFAULT_ALPHA: f64 = 0.3;

/// Starting value for the running token average
pub const DEFAULT_AVERAGE_TOKENS: f64 = 50.0;

/// Default number of completion samples kept per device
pub const DEFAULT_HISTORY_WINDOW: usize = 10;

/// Converts queue depth and request cost into an expected wait
#[derive(Debug, Clone)]
pub struct CompletionTimeEstimator {
    avg_tokens_per_request: f64,
    alpha: f64,
}

impl Default for CompletionTimeEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA, DEFAULT_AVERAGE_TOKENS)
    }
}

impl CompletionTimeEstimator {
    pub fn new(alpha: f64, initial_average_tokens: f64) -> Self {
        let alpha = if alpha > 0.0 && alpha <= 1.0 {
            alpha
        } else {
            DEFAULT_ALPHA
        };
        Self {
            avg_tokens_per_request: initial_average_tokens.max(0.0),
            alpha,
        }
    }

    /// Expected seconds until a new request of `estimated_tokens` finishes
    /// on a device running at `tps` with `queue_size` items ahead of it.
    ///
    /// A device with no throughput never finishes.
    pub fn estimate(&self, tps: f64, queue_size: usize, estimated_tokens: f64) -> f64 {
        if tps <= 0.0 || !tps.is_finite() {
            return f64::INFINITY;
        }
        let queued = queue_size as f64 * self.avg_tokens_per_request / tps;
        queued + estimated_tokens / tps
    }

    /// Fold an observed token count into the running average
    pub fn update_average_tokens(&mut self, actual_tokens: f64) {
        if !actual_tokens.is_finite() || actual_tokens < 0.0 {
            return;
        }
        self.avg_tokens_per_request =
            self.alpha * actual_tokens + (1.0 - self.alpha) * self.avg_tokens_per_request;
    }

    pub fn average_tokens(&self) -> f64 {
        self.avg_tokens_per_request
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

/// A single finished request
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionSample {
    pub timestamp: DateTime<Utc>,
    pub duration_ms: f64,
}

/// Bounded per-device completion history
#[derive(Debug, Clone)]
pub struct CompletionHistory {
    samples: HashMap<String, VecDeque<CompletionSample>>,
    window: usize,
}

impl Default for CompletionHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_WINDOW)
    }
}

impl CompletionHistory {
    pub fn new(window: usize) -> Self {
        Self {
            samples: HashMap::new(),
            window: window.max(1),
        }
    }

    /// Record a completion stamped with the current time
    pub fn record(&mut self, device: &str, duration_ms: f64) {
        self.record_at(device, duration_ms, Utc::now());
    }

    pub fn record_at(&mut self, device: &str, duration_ms: f64, timestamp: DateTime<Utc>) {
        let window = self.window;
        let samples = self.samples.entry(device.to_string()).or_default();
        samples.push_back(CompletionSample {
            timestamp,
            duration_ms: duration_ms.max(0.0),
        });
        while samples.len() > window {
            samples.pop_front();
        }
    }

    pub fn samples(&self, device: &str) -> Option<&VecDeque<CompletionSample>> {
        self.samples.get(device)
    }

    /// Mean completion time in milliseconds.
    ///
    /// With fewer than two samples this falls back to the time `tps` needs to
    /// produce `avg_tokens`.
    pub fn average_completion_ms(&self, device: &str, tps: f64, avg_tokens: f64) -> f64 {
        match self.samples.get(device) {
            Some(samples) if samples.len() >= 2 => {
                samples.iter().map(|s| s.duration_ms).sum::<f64>() / samples.len() as f64
            }
            _ if tps > 0.0 => avg_tokens / tps * 1000.0,
            _ => 0.0,
        }
    }

    /// Completed requests per second over the sample span.
    ///
    /// Falls back to `tps / avg_tokens` with fewer than two samples or a
    /// zero-length span.
    pub fn processing_rate(&self, device: &str, tps: f64, avg_tokens: f64) -> f64 {
        let fallback = if tps > 0.0 && avg_tokens > 0.0 {
            tps / avg_tokens
        } else {
            0.0
        };

        let samples = match self.samples.get(device) {
            Some(samples) if samples.len() >= 2 => samples,
            _ => return fallback,
        };

        let (first, last) = match (samples.front(), samples.back()) {
            (Some(first), Some(last)) => (first, last),
            _ => return fallback,
        };
        let span_ms = (last.timestamp - first.timestamp).num_milliseconds();
        if span_ms <= 0 {
            return fallback;
        }
        // n samples bound n-1 intervals
        (samples.len() - 1) as f64 / (span_ms as f64 / 1000.0)
    }

    pub fn window(&self) -> usize {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_estimate_formula() {
        let estimator = CompletionTimeEstimator::new(0.3, 50.0);

        // 2 queued * 50 / 100 + 30 / 100
        let eta = estimator.estimate(100.0, 2, 30.0);
        assert!((eta - 1.3).abs() < 1e-9);

        let empty = estimator.estimate(200.0, 0, 100.0);
        assert!((empty - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_offline_is_infinite() {
        let estimator = CompletionTimeEstimator::default();
        assert!(estimator.estimate(0.0, 0, 10.0).is_infinite());
        assert!(estimator.estimate(-1.0, 3, 10.0).is_infinite());
    }

    #[test]
    fn test_ema_update() {
        let mut estimator = CompletionTimeEstimator::new(0.3, 50.0);
        estimator.update_average_tokens(150.0);
        // 0.3 * 150 + 0.7 * 50
        assert!((estimator.average_tokens() - 80.0).abs() < 1e-9);

        estimator.update_average_tokens(80.0);
        assert!((estimator.average_tokens() - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_ema_ignores_invalid_input() {
        let mut estimator = CompletionTimeEstimator::default();
        estimator.update_average_tokens(f64::NAN);
        estimator.update_average_tokens(-10.0);
        assert_eq!(estimator.average_tokens(), DEFAULT_AVERAGE_TOKENS);
    }

    #[test]
    fn test_invalid_alpha_uses_default() {
        let estimator = CompletionTimeEstimator::new(1.5, 50.0);
        assert_eq!(estimator.alpha(), DEFAULT_ALPHA);
    }

    #[test]
    fn test_history_window_trims_oldest() {
        let mut history = CompletionHistory::new(3);
        for ms in [100.0, 200.0, 300.0, 400.0] {
            history.record("gpu-0", ms);
        }

        let samples = history.samples("gpu-0").unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples.front().unwrap().duration_ms, 200.0);
    }

    #[test]
    fn test_average_completion_falls_back_to_tps() {
        let mut history = CompletionHistory::default();
        assert_eq!(history.average_completion_ms("gpu-0", 100.0, 50.0), 500.0);

        history.record("gpu-0", 120.0);
        assert_eq!(history.average_completion_ms("gpu-0", 100.0, 50.0), 500.0);

        history.record("gpu-0", 180.0);
        assert_eq!(history.average_completion_ms("gpu-0", 100.0, 50.0), 150.0);

        assert_eq!(history.average_completion_ms("offline", 0.0, 50.0), 0.0);
    }

    #[test]
    fn test_processing_rate_from_samples() {
        let mut history = CompletionHistory::default();
        let start = Utc::now();
        for i in 0..5 {
            history.record_at("gpu-0", 100.0, start + Duration::milliseconds(i * 500));
        }

        // 4 intervals over 2 seconds
        let rate = history.processing_rate("gpu-0", 100.0, 50.0);
        assert!((rate - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_processing_rate_fallback() {
        let history = CompletionHistory::default();
        assert_eq!(history.processing_rate("gpu-0", 100.0, 50.0), 2.0);
        assert_eq!(history.processing_rate("gpu-0", 0.0, 50.0), 0.0);
    }
}
