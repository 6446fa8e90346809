//! Consumers that sit downstream of a progress stream: completion
//! forecasting, error root-cause attribution, and bounded history retention.
//!
//! Nothing here touches the transport. Each component is fed from session
//! callbacks and can be dropped without affecting delivery.

pub mod forecast;
pub mod retention;
pub mod root_cause;

pub use forecast::{Forecast, ProgressForecaster};
pub use retention::{HistoryBuffer, RetentionPolicy};
pub use root_cause::{ErrorCategory, RootCause, RootCauseAnalyzer};
