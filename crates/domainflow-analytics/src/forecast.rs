//! Completion forecasting from observed processing rates.
//!
//! Two sliding windows are kept over the sample history: a short one that
//! reacts to the current burst rate and a long one that smooths it out. The
//! forecast blends the two, weighted toward the short window.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use domainflow_types::ProgressUpdate;

#[derive(Debug, Clone, Copy)]
struct RateSample {
    at: DateTime<Utc>,
    analyzed: u64,
}

/// A completion estimate derived from recent throughput.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Forecast {
    pub items_per_second: f64,
    pub remaining_items: u64,
    pub eta: DateTime<Utc>,
}

/// Accumulates progress samples and projects a completion time.
pub struct ProgressForecaster {
    samples: VecDeque<RateSample>,
    short_window: Duration,
    long_window: Duration,
    /// Weight on the short-window rate; the long window gets the rest.
    short_weight: f64,
}

impl ProgressForecaster {
    pub fn new() -> Self {
        Self::with_windows(Duration::seconds(30), Duration::minutes(5), 0.7)
    }

    pub fn with_windows(short_window: Duration, long_window: Duration, short_weight: f64) -> Self {
        Self {
            samples: VecDeque::new(),
            short_window,
            long_window,
            short_weight: short_weight.clamp(0.0, 1.0),
        }
    }

    /// Record an update. Updates without an analyzed-domain count contribute
    /// nothing; updates without a timestamp are stamped on arrival.
    pub fn record(&mut self, update: &ProgressUpdate) {
        let analyzed = match update.analyzed_domains {
            Some(n) => n,
            None => return,
        };
        let at = update.updated_at.unwrap_or_else(Utc::now);
        // Out-of-order or regressing samples would poison the rate.
        if let Some(last) = self.samples.back() {
            if at <= last.at || analyzed < last.analyzed {
                tracing::debug!(%at, analyzed, "discarding non-monotonic rate sample");
                return;
            }
        }
        self.samples.push_back(RateSample { at, analyzed });
        let cutoff = at - self.long_window;
        while self
            .samples
            .front()
            .is_some_and(|s| s.at < cutoff && self.samples.len() > 2)
        {
            self.samples.pop_front();
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Blended items-per-second rate, or `None` with fewer than two samples.
    pub fn rate(&self) -> Option<f64> {
        let newest = self.samples.back()?;
        let short = self.window_rate(newest.at - self.short_window);
        let long = self.window_rate(newest.at - self.long_window)?;
        Some(match short {
            Some(short) => self.short_weight * short + (1.0 - self.short_weight) * long,
            None => long,
        })
    }

    /// Project when `total` items will be done, given the current rate.
    pub fn forecast(&self, total: u64) -> Option<Forecast> {
        let rate = self.rate()?;
        if rate <= 0.0 {
            return None;
        }
        let newest = self.samples.back()?;
        let remaining = total.saturating_sub(newest.analyzed);
        let secs = remaining as f64 / rate;
        let eta = newest.at + Duration::milliseconds((secs * 1000.0) as i64);
        Some(Forecast {
            items_per_second: rate,
            remaining_items: remaining,
            eta,
        })
    }

    /// Rate across the samples newer than `cutoff`; needs two spanning points.
    fn window_rate(&self, cutoff: DateTime<Utc>) -> Option<f64> {
        let newest = self.samples.back()?;
        let oldest = self.samples.iter().find(|s| s.at >= cutoff)?;
        let span = (newest.at - oldest.at).num_milliseconds();
        if span <= 0 {
            return None;
        }
        let items = newest.analyzed.saturating_sub(oldest.analyzed);
        Some(items as f64 * 1000.0 / span as f64)
    }
}

impl Default for ProgressForecaster {
    fn default() -> Self {
        Self::new()
    }
}
