//! Configuration for the pool and session layers.

use std::time::Duration;

/// Tuning for the shared stream pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// When disabled, every subscribe gets a private, unshared connection.
    pub pooling_enabled: bool,
    /// When disabled, differential updates are forwarded raw instead of being
    /// applied through the patch processor.
    pub differential_enabled: bool,
    /// Pool-level heartbeat timeout. The monitor scans at half this period.
    pub heartbeat_timeout: Duration,
    /// Consecutive missed heartbeats before a degradation signal is emitted.
    pub max_missed_heartbeats: u32,
    /// Connection-level failures before the pool flags the stream as failed.
    pub max_failures: u32,
    /// Cap on pending optimistic updates per pool entry. Updates beyond the
    /// cap are rejected, not queued.
    pub max_optimistic_queue: usize,
    /// Latency above this threshold starts costing quality score.
    pub latency_threshold_ms: f64,
    /// Period of the quality-score recomputation tick.
    pub quality_interval: Duration,
    /// Fixed delay before an explicit reconnect recreates the entry.
    pub reconnect_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pooling_enabled: true,
            differential_enabled: true,
            heartbeat_timeout: Duration::from_secs(60),
            max_missed_heartbeats: 3,
            max_failures: 5,
            max_optimistic_queue: 50,
            latency_threshold_ms: 500.0,
            quality_interval: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

/// Tuning for one caller-facing progress session.
///
/// The session heartbeat timeout is independent of the pool's: it tracks this
/// session's perceived liveness, not the connection's.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Try push delivery first when the environment supports it.
    pub prefer_push: bool,
    /// Session-local heartbeat window. Three consecutive silent windows tear
    /// down the push connection and switch to polling.
    pub heartbeat_timeout: Duration,
    /// Base polling period.
    pub polling_interval: Duration,
    /// Maximum transport retries (push: linear delay; poll: exponential).
    pub max_retries: u32,
    /// Base delay for the linearly increasing push retry.
    pub retry_base_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prefer_push: true,
            heartbeat_timeout: Duration::from_secs(45),
            polling_interval: Duration::from_secs(5),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Capability flags injected at construction: what the target environment
/// supports, decided by the composition root rather than probed at runtime.
#[derive(Debug, Clone, Copy)]
pub struct TransportCapabilities {
    pub push_supported: bool,
    pub pooling_available: bool,
}

impl Default for TransportCapabilities {
    fn default() -> Self {
        Self {
            push_supported: true,
            pooling_available: true,
        }
    }
}
