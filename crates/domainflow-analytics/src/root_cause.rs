//! Root-cause attribution over stream error counters.
//!
//! Errors observed by a session are bucketed into coarse categories; once a
//! single category dominates, the analyzer names it so operators alert on the
//! cause instead of the symptom.

use std::collections::HashMap;

use serde::Serialize;

use domainflow_types::DomainflowError;

/// Coarse failure buckets, one per distinct remediation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Socket-level and request failures.
    Network,
    /// Non-success HTTP status from the server.
    Server,
    /// Undecodable payloads and malformed patches.
    Payload,
    /// Session lifecycle misuse.
    Lifecycle,
    Other,
}

pub fn categorize(err: &DomainflowError) -> ErrorCategory {
    match err {
        DomainflowError::Transport { .. } | DomainflowError::ConnectionFailed { .. } => {
            ErrorCategory::Network
        }
        DomainflowError::Http { .. } => ErrorCategory::Server,
        DomainflowError::PatchPath { .. }
        | DomainflowError::PatchIndex { .. }
        | DomainflowError::Json(_) => ErrorCategory::Payload,
        DomainflowError::SessionDestroyed | DomainflowError::InvalidSessionState { .. } => {
            ErrorCategory::Lifecycle
        }
        DomainflowError::Other(_) => ErrorCategory::Other,
    }
}

/// A dominant failure category and its share of all observed errors.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RootCause {
    pub category: ErrorCategory,
    pub count: u64,
    pub share: f64,
}

/// Counts errors by category and attributes a root cause once one category
/// accounts for the configured share of the total.
pub struct RootCauseAnalyzer {
    counters: HashMap<ErrorCategory, u64>,
    total: u64,
    dominance_share: f64,
    min_samples: u64,
}

impl RootCauseAnalyzer {
    pub fn new() -> Self {
        Self::with_thresholds(0.5, 3)
    }

    pub fn with_thresholds(dominance_share: f64, min_samples: u64) -> Self {
        Self {
            counters: HashMap::new(),
            total: 0,
            dominance_share: dominance_share.clamp(0.0, 1.0),
            min_samples,
        }
    }

    pub fn record(&mut self, err: &DomainflowError) {
        let category = categorize(err);
        *self.counters.entry(category).or_default() += 1;
        self.total += 1;
        tracing::debug!(?category, total = self.total, "error recorded");
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// The dominant category, if any category holds the required share and
    /// enough samples have accumulated to trust it.
    pub fn attribute(&self) -> Option<RootCause> {
        if self.total < self.min_samples {
            return None;
        }
        let (category, count) = self
            .counters
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(c, n)| (*c, *n))?;
        let share = count as f64 / self.total as f64;
        (share >= self.dominance_share).then_some(RootCause {
            category,
            count,
            share,
        })
    }

    /// All categories with counts, highest first.
    pub fn breakdown(&self) -> Vec<(ErrorCategory, u64)> {
        let mut entries: Vec<_> = self.counters.iter().map(|(c, n)| (*c, *n)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries
    }

    pub fn reset(&mut self) {
        self.counters.clear();
        self.total = 0;
    }
}

impl Default for RootCauseAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> DomainflowError {
        DomainflowError::Transport {
            message: "reset".into(),
            retryable: true,
        }
    }

    fn http(status: u16) -> DomainflowError {
        DomainflowError::Http {
            status,
            message: "bad".into(),
        }
    }

    #[test]
    fn no_attribution_below_sample_floor() {
        let mut a = RootCauseAnalyzer::new();
        a.record(&transport());
        a.record(&transport());
        assert!(a.attribute().is_none());
        a.record(&transport());
        assert!(a.attribute().is_some());
    }

    #[test]
    fn dominant_category_is_attributed() {
        let mut a = RootCauseAnalyzer::new();
        for _ in 0..4 {
            a.record(&transport());
        }
        a.record(&http(503));
        let cause = a.attribute().unwrap();
        assert_eq!(cause.category, ErrorCategory::Network);
        assert_eq!(cause.count, 4);
        assert!((cause.share - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn even_split_attributes_nothing() {
        let mut a = RootCauseAnalyzer::with_thresholds(0.6, 2);
        a.record(&transport());
        a.record(&http(500));
        a.record(&DomainflowError::SessionDestroyed);
        assert!(a.attribute().is_none());
        assert_eq!(a.breakdown().len(), 3);
    }

    #[test]
    fn categories_map_per_variant() {
        assert_eq!(categorize(&transport()), ErrorCategory::Network);
        assert_eq!(categorize(&http(500)), ErrorCategory::Server);
        assert_eq!(
            categorize(&DomainflowError::PatchPath {
                path: "a.b".into(),
                segment: "b".into()
            }),
            ErrorCategory::Payload
        );
        assert_eq!(
            categorize(&DomainflowError::SessionDestroyed),
            ErrorCategory::Lifecycle
        );
        assert_eq!(
            categorize(&DomainflowError::Other("?".into())),
            ErrorCategory::Other
        );
    }

    #[test]
    fn reset_clears_counters() {
        let mut a = RootCauseAnalyzer::new();
        for _ in 0..5 {
            a.record(&transport());
        }
        a.reset();
        assert_eq!(a.total(), 0);
        assert!(a.attribute().is_none());
    }
}
