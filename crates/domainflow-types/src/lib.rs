//! Shared types and errors for the DomainFlow streaming client.
//!
//! This crate provides the foundational types used across the other
//! domainflow crates:
//! - `DomainflowError` — unified error taxonomy
//! - `DifferentialPatch` / `PatchOp` — the incremental-update wire format
//! - `ProgressUpdate` — the normalized update delivered to consumers
//! - `QualityMetrics` — connection quality bookkeeping for pooled streams

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unified error type for all domainflow subsystems.
#[derive(Debug, thiserror::Error)]
pub enum DomainflowError {
    // === Transport Errors ===
    #[error("Transport error: {message}")]
    Transport { message: String, retryable: bool },

    #[error("Connection to {url} failed after {attempts} attempts")]
    ConnectionFailed { url: String, attempts: usize },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    // === Patch Errors ===
    #[error("Cannot traverse through non-container value at segment '{segment}' of path '{path}'")]
    PatchPath { path: String, segment: String },

    #[error("Array index {index} out of bounds at path '{path}'")]
    PatchIndex { path: String, index: usize },

    // === Session Errors ===
    #[error("Session has been destroyed and cannot be restarted")]
    SessionDestroyed,

    #[error("Session cannot start from state '{state}'")]
    InvalidSessionState { state: String },

    // === Generic ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl DomainflowError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            DomainflowError::Transport { retryable, .. } => *retryable,
            DomainflowError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// A convenience alias for `Result<T, DomainflowError>`.
pub type Result<T> = std::result::Result<T, DomainflowError>;

// ---------------------------------------------------------------------------
// Patch operations
// ---------------------------------------------------------------------------

/// A single path-addressed operation inside a differential patch.
///
/// Paths are dot-separated; numeric segments index into arrays. Order within
/// one patch is significant: later operations win on conflicting paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    /// Set the value at `path`, creating intermediate objects as needed.
    Set { path: String, value: serde_json::Value },
    /// Shallow-merge an object into the value at `path`; plain set when the
    /// existing value is absent or not an object.
    Merge { path: String, value: serde_json::Value },
    /// Remove the value at `path`. No-op when the path is absent.
    Delete { path: String },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Set { path, .. } | PatchOp::Merge { path, .. } | PatchOp::Delete { path } => {
                path
            }
        }
    }
}

/// Whether a patch carries incremental changes or a full document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchKind {
    Delta,
    FullSnapshot,
}

/// An incremental change set pushed over the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DifferentialPatch {
    #[serde(rename = "type")]
    pub kind: PatchKind,
    pub timestamp: DateTime<Utc>,
    pub changes: Vec<PatchOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Campaign progress
// ---------------------------------------------------------------------------

/// Pipeline phases a campaign moves through, as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CampaignPhase {
    DomainGeneration,
    DnsValidation,
    HttpKeywordValidation,
    Completed,
    Failed,
    Cancelled,
    Other(String),
}

impl CampaignPhase {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "domain_generation" => CampaignPhase::DomainGeneration,
            "dns_validation" => CampaignPhase::DnsValidation,
            "http_keyword_validation" => CampaignPhase::HttpKeywordValidation,
            "completed" | "finished" => CampaignPhase::Completed,
            "failed" => CampaignPhase::Failed,
            "cancelled" => CampaignPhase::Cancelled,
            _ => CampaignPhase::Other(s.to_string()),
        }
    }

    /// Terminal phases end a progress session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CampaignPhase::Completed | CampaignPhase::Failed | CampaignPhase::Cancelled
        )
    }
}

/// Returns `true` for phases that end a progress session
/// (`completed`, `failed`, `cancelled`, `finished` — case-insensitive).
pub fn is_terminal_phase(phase: &str) -> bool {
    CampaignPhase::parse(phase).is_terminal()
}

/// The normalized update delivered to consumers, identical for the push and
/// poll transports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    #[serde(alias = "currentPhase")]
    pub phase: String,
    #[serde(default, alias = "phaseStatus", skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, alias = "progress", skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<f64>,
    #[serde(default, alias = "processedItems", skip_serializing_if = "Option::is_none")]
    pub analyzed_domains: Option<u64>,
    #[serde(default, alias = "totalItems", skip_serializing_if = "Option::is_none")]
    pub total_domains: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProgressUpdate {
    /// Terminal when either the phase or the status names a terminal value;
    /// servers report completion on whichever field the transport fills in.
    pub fn is_terminal(&self) -> bool {
        is_terminal_phase(&self.phase)
            || self.status.as_deref().is_some_and(is_terminal_phase)
    }
}

// ---------------------------------------------------------------------------
// Quality metrics
// ---------------------------------------------------------------------------

/// Advisory connection quality for one pooled stream entry.
///
/// Recomputed continuously by the pool; never externally mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetrics {
    /// 0–100; starts at 100 and is penalized by latency, errors, missed
    /// updates, and missed heartbeats.
    pub score: u32,
    pub latency_ms: f64,
    pub error_rate: f64,
    pub update_count: u64,
    pub missed_updates: u64,
}

impl Default for QualityMetrics {
    fn default() -> Self {
        Self {
            score: 100,
            latency_ms: 0.0,
            error_rate: 0.0,
            update_count: 0,
            missed_updates: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_display_transport() {
        let err = DomainflowError::Transport {
            message: "connection reset".into(),
            retryable: true,
        };
        assert_eq!(err.to_string(), "Transport error: connection reset");
    }

    #[test]
    fn error_display_connection_failed() {
        let err = DomainflowError::ConnectionFailed {
            url: "https://api.example.com/progress/stream".into(),
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "Connection to https://api.example.com/progress/stream failed after 3 attempts"
        );
    }

    #[test]
    fn error_display_patch_path() {
        let err = DomainflowError::PatchPath {
            path: "status.detail".into(),
            segment: "detail".into(),
        };
        assert_eq!(
            err.to_string(),
            "Cannot traverse through non-container value at segment 'detail' of path 'status.detail'"
        );
    }

    #[test]
    fn retryable_transport_when_flagged() {
        let err = DomainflowError::Transport {
            message: "timeout".into(),
            retryable: true,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn not_retryable_transport_when_not_flagged() {
        let err = DomainflowError::Transport {
            message: "bad url".into(),
            retryable: false,
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn retryable_http_5xx_and_429() {
        let err = DomainflowError::Http {
            status: 503,
            message: "unavailable".into(),
        };
        assert!(err.is_retryable());
        let err = DomainflowError::Http {
            status: 429,
            message: "slow down".into(),
        };
        assert!(err.is_retryable());
        let err = DomainflowError::Http {
            status: 404,
            message: "not found".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn not_retryable_session_destroyed() {
        assert!(!DomainflowError::SessionDestroyed.is_retryable());
    }

    // --- PatchOp / DifferentialPatch wire format ---

    #[test]
    fn patch_op_serializes_with_op_tag() {
        let op = PatchOp::Set {
            path: "status".into(),
            value: json!("running"),
        };
        let wire = serde_json::to_value(&op).unwrap();
        assert_eq!(wire["op"], "set");
        assert_eq!(wire["path"], "status");
        assert_eq!(wire["value"], "running");
    }

    #[test]
    fn patch_op_round_trip() {
        let ops = vec![
            PatchOp::Set {
                path: "a.b".into(),
                value: json!(1),
            },
            PatchOp::Merge {
                path: "meta".into(),
                value: json!({"k": "v"}),
            },
            PatchOp::Delete { path: "old".into() },
        ];
        let wire = serde_json::to_string(&ops).unwrap();
        let back: Vec<PatchOp> = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, ops);
    }

    #[test]
    fn differential_patch_deserializes_camel_case() {
        let patch: DifferentialPatch = serde_json::from_value(json!({
            "type": "delta",
            "timestamp": "2025-06-01T12:00:00Z",
            "changes": [{"op": "set", "path": "status", "value": "running"}],
            "sequenceNumber": 7,
            "campaignId": "c-123"
        }))
        .unwrap();
        assert_eq!(patch.kind, PatchKind::Delta);
        assert_eq!(patch.sequence_number, Some(7));
        assert_eq!(patch.campaign_id.as_deref(), Some("c-123"));
        assert_eq!(patch.changes.len(), 1);
    }

    #[test]
    fn differential_patch_sequence_number_optional() {
        let patch: DifferentialPatch = serde_json::from_value(json!({
            "type": "full_snapshot",
            "timestamp": "2025-06-01T12:00:00Z",
            "changes": []
        }))
        .unwrap();
        assert_eq!(patch.kind, PatchKind::FullSnapshot);
        assert_eq!(patch.sequence_number, None);
    }

    // --- Phases ---

    #[test]
    fn phase_parsing() {
        assert_eq!(
            CampaignPhase::parse("domain_generation"),
            CampaignPhase::DomainGeneration
        );
        assert_eq!(
            CampaignPhase::parse("dns_validation"),
            CampaignPhase::DnsValidation
        );
        assert_eq!(
            CampaignPhase::parse("http_keyword_validation"),
            CampaignPhase::HttpKeywordValidation
        );
        assert_eq!(
            CampaignPhase::parse("warming_up"),
            CampaignPhase::Other("warming_up".into())
        );
    }

    #[test]
    fn terminal_phases_case_insensitive() {
        assert!(is_terminal_phase("completed"));
        assert!(is_terminal_phase("COMPLETED"));
        assert!(is_terminal_phase("Failed"));
        assert!(is_terminal_phase("cancelled"));
        assert!(is_terminal_phase("finished"));
        assert!(!is_terminal_phase("dns_validation"));
        assert!(!is_terminal_phase("in_progress"));
    }

    #[test]
    fn progress_update_wire_round_trip() {
        let update: ProgressUpdate = serde_json::from_value(json!({
            "phase": "dns_validation",
            "status": "in_progress",
            "analyzedDomains": 420,
            "totalDomains": 1000
        }))
        .unwrap();
        assert_eq!(update.phase, "dns_validation");
        assert_eq!(update.analyzed_domains, Some(420));
        assert!(!update.is_terminal());

        let terminal = ProgressUpdate {
            phase: "completed".into(),
            ..Default::default()
        };
        assert!(terminal.is_terminal());

        let by_status = ProgressUpdate {
            phase: "http_keyword_validation".into(),
            status: Some("completed".into()),
            ..Default::default()
        };
        assert!(by_status.is_terminal());
    }

    #[test]
    fn progress_update_accepts_legacy_field_names() {
        let update: ProgressUpdate = serde_json::from_value(json!({
            "currentPhase": "http_keyword_validation",
            "phaseStatus": "in_progress",
            "progress": 62.5,
            "processedItems": 625,
            "totalItems": 1000
        }))
        .unwrap();
        assert_eq!(update.phase, "http_keyword_validation");
        assert_eq!(update.status.as_deref(), Some("in_progress"));
        assert_eq!(update.progress_percent, Some(62.5));
        assert_eq!(update.analyzed_domains, Some(625));
        assert_eq!(update.total_domains, Some(1000));
    }

    #[test]
    fn quality_metrics_defaults() {
        let q = QualityMetrics::default();
        assert_eq!(q.score, 100);
        assert_eq!(q.update_count, 0);
        assert_eq!(q.missed_updates, 0);
    }
}
