//! Streaming client for DomainFlow campaign progress and metrics.
//!
//! Layers, leaf to root:
//! - [`codec`] — SSE frame decoding and classification of wire messages.
//! - [`connector`] — the `PushConnector` / `ProgressFetcher` transport seams
//!   with reqwest-backed defaults.
//! - [`pool`] — one multiplexed push connection per distinct URL, fanning raw
//!   messages out to independent subscribers, applying differential patches
//!   optimistically and reconciling against full snapshots.
//! - [`session`] — the caller-facing `ProgressStream`: picks push vs. poll
//!   delivery, retries with backoff, watches its own heartbeat, and ends on a
//!   terminal campaign phase.
//!
//! All shared state is owned by constructed objects (no module-level
//! registries); a [`pool::StreamPoolManager`] is built once at the
//! composition root and handed to every session that wants pooling.

pub mod codec;
pub mod config;
pub mod connector;
pub mod pool;
pub mod session;

pub use codec::{decode_message, SseFrameDecoder, StreamMessage};
pub use config::{PoolConfig, SessionConfig, TransportCapabilities};
pub use connector::{FrameStream, HttpProgressFetcher, ProgressFetcher, PushConnector, SseConnector};
pub use pool::{PoolCallback, PoolEvent, PoolStats, StreamPoolManager, SubscriptionToken};
pub use session::{ProgressStream, ProgressStreamBuilder, SessionState};
