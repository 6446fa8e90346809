//! Connection pooling: one live stream per URL shared across subscribers,
//! with differential patch application, optimistic sequencing, heartbeat
//! monitoring, and per-connection quality scoring.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant};
use uuid::Uuid;

use domainflow_patch::PatchProcessor;
use domainflow_types::QualityMetrics;

use crate::codec::{decode_message, StreamMessage};
use crate::config::PoolConfig;
use crate::connector::PushConnector;

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// Event fanned out to pool subscribers.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A JSON message, possibly carrying a synthesized `computedState`.
    Message(Value),
    /// A frame that was not valid JSON, forwarded verbatim.
    Raw(String),
    /// Heartbeats have gone missing past the allowed threshold.
    Degraded { missed_heartbeats: u32 },
    /// The connection exhausted its failure budget and will not retry.
    Failed { failures: u32 },
}

pub type PoolCallback = Arc<dyn Fn(PoolEvent) + Send + Sync>;

/// Handle returned by [`StreamPoolManager::subscribe`]; pass it back to
/// [`StreamPoolManager::unsubscribe`] to release the connection share.
#[derive(Debug, Clone)]
pub struct SubscriptionToken {
    pub(crate) key: String,
    pub(crate) id: Uuid,
}

/// Point-in-time counters for one pooled connection.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub ref_count: usize,
    pub last_sequence_number: u64,
    pub missed_updates: u64,
    pub optimistic_len: usize,
    pub missed_heartbeats: u32,
    pub failure_count: u32,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct OptimisticUpdate {
    id: String,
    sequence_number: u64,
}

struct PoolEntry {
    url: String,
    ref_count: usize,
    callbacks: Vec<(Uuid, PoolCallback)>,
    last_heartbeat: Instant,
    missed_heartbeats: u32,
    failure_count: u32,
    failed: bool,
    quality: QualityMetrics,
    optimistic_queue: VecDeque<OptimisticUpdate>,
    last_sequence_number: u64,
    processor: Option<PatchProcessor>,
    reader: Option<JoinHandle<()>>,
}

impl PoolEntry {
    fn new(url: String, differential: bool) -> Self {
        Self {
            url,
            ref_count: 0,
            callbacks: Vec::new(),
            last_heartbeat: Instant::now(),
            missed_heartbeats: 0,
            failure_count: 0,
            failed: false,
            quality: QualityMetrics::default(),
            optimistic_queue: VecDeque::new(),
            last_sequence_number: 0,
            processor: differential.then(|| PatchProcessor::new(json!({}))),
            reader: None,
        }
    }

    fn snapshot_callbacks(&self) -> Vec<PoolCallback> {
        self.callbacks.iter().map(|(_, cb)| cb.clone()).collect()
    }
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn PushConnector>,
    entries: Mutex<HashMap<String, PoolEntry>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Manager of pooled push connections. Cheap to clone; all clones share the
/// same pool.
#[derive(Clone)]
pub struct StreamPoolManager {
    inner: Arc<PoolInner>,
}

impl StreamPoolManager {
    pub fn new(config: PoolConfig, connector: Arc<dyn PushConnector>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                entries: Mutex::new(HashMap::new()),
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Attach a callback to the connection for `url`, creating the connection
    /// if no subscriber holds it yet. With pooling disabled every subscriber
    /// gets a private connection.
    pub async fn subscribe(&self, url: &str, callback: PoolCallback) -> SubscriptionToken {
        let id = Uuid::new_v4();
        let key = if self.inner.config.pooling_enabled {
            url.to_string()
        } else {
            format!("{url}#{id}")
        };

        let needs_reader = {
            let mut entries = self.inner.entries.lock().await;
            let entry = entries.entry(key.clone()).or_insert_with(|| {
                PoolEntry::new(url.to_string(), self.inner.config.differential_enabled)
            });
            entry.ref_count += 1;
            entry.callbacks.push((id, callback));
            entry.reader.is_none()
        };

        if needs_reader {
            let handle = tokio::spawn(reader_loop(self.inner.clone(), key.clone()));
            let mut entries = self.inner.entries.lock().await;
            if let Some(entry) = entries.get_mut(&key) {
                entry.reader = Some(handle);
            } else {
                handle.abort();
            }
        }

        self.ensure_monitor().await;
        SubscriptionToken { key, id }
    }

    /// Release one subscriber's share. The connection is torn down when the
    /// last subscriber leaves.
    pub async fn unsubscribe(&self, token: &SubscriptionToken) {
        let mut entries = self.inner.entries.lock().await;
        let remove = if let Some(entry) = entries.get_mut(&token.key) {
            entry.callbacks.retain(|(id, _)| *id != token.id);
            entry.ref_count = entry.ref_count.saturating_sub(1);
            entry.ref_count == 0
        } else {
            false
        };
        if remove {
            if let Some(entry) = entries.remove(&token.key) {
                if let Some(reader) = entry.reader {
                    reader.abort();
                }
                tracing::debug!(url = %entry.url, "pooled connection released");
            }
        }
    }

    /// Tear down and re-establish every connection to `url`, preserving
    /// subscribers but starting from fresh differential state. With pooling
    /// disabled each private connection to the URL is reconnected.
    pub async fn reconnect(&self, url: &str) {
        let keys: Vec<String> = {
            let entries = self.inner.entries.lock().await;
            entries
                .iter()
                .filter(|(_, entry)| entry.url == url)
                .map(|(key, _)| key.clone())
                .collect()
        };
        for key in keys {
            self.reconnect_entry(&key).await;
        }
    }

    async fn reconnect_entry(&self, key: &str) {
        let (url, callbacks, ref_count) = {
            let mut entries = self.inner.entries.lock().await;
            match entries.remove(key) {
                Some(entry) => {
                    if let Some(reader) = entry.reader {
                        reader.abort();
                    }
                    (entry.url, entry.callbacks, entry.ref_count)
                }
                None => return,
            }
        };
        if ref_count == 0 {
            return;
        }

        let inner = self.inner.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            sleep(inner.config.reconnect_delay).await;
            let needs_reader = {
                let mut entries = inner.entries.lock().await;
                if entries.contains_key(&key) {
                    false
                } else {
                    let mut entry = PoolEntry::new(url, inner.config.differential_enabled);
                    entry.ref_count = ref_count;
                    entry.callbacks = callbacks;
                    entries.insert(key.clone(), entry);
                    true
                }
            };
            if needs_reader {
                let handle = tokio::spawn(reader_loop(inner.clone(), key.clone()));
                let mut entries = inner.entries.lock().await;
                if let Some(entry) = entries.get_mut(&key) {
                    entry.reader = Some(handle);
                } else {
                    handle.abort();
                }
            }
        });
    }

    pub async fn quality(&self, url: &str) -> Option<QualityMetrics> {
        let entries = self.inner.entries.lock().await;
        entries.get(url).map(|e| e.quality.clone())
    }

    pub async fn stats(&self, url: &str) -> Option<PoolStats> {
        let entries = self.inner.entries.lock().await;
        entries.get(url).map(|e| PoolStats {
            ref_count: e.ref_count,
            last_sequence_number: e.last_sequence_number,
            missed_updates: e.quality.missed_updates,
            optimistic_len: e.optimistic_queue.len(),
            missed_heartbeats: e.missed_heartbeats,
            failure_count: e.failure_count,
        })
    }

    pub async fn entry_count(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    /// Abort every reader and drop all entries.
    pub async fn shutdown(&self) {
        let mut entries = self.inner.entries.lock().await;
        for (_, entry) in entries.drain() {
            if let Some(reader) = entry.reader {
                reader.abort();
            }
        }
        drop(entries);
        let mut monitor = self.inner.monitor.lock().await;
        if let Some(handle) = monitor.take() {
            handle.abort();
        }
    }

    async fn ensure_monitor(&self) {
        let mut monitor = self.inner.monitor.lock().await;
        if monitor.is_none() {
            *monitor = Some(tokio::spawn(monitor_loop(self.inner.clone())));
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Ok(mut entries) = self.entries.try_lock() {
            for (_, entry) in entries.drain() {
                if let Some(reader) = entry.reader {
                    reader.abort();
                }
            }
        }
        if let Ok(mut monitor) = self.monitor.try_lock() {
            if let Some(handle) = monitor.take() {
                handle.abort();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Reader loop
// ---------------------------------------------------------------------------

async fn reader_loop(inner: Arc<PoolInner>, key: String) {
    use tokio_stream::StreamExt;

    loop {
        let url = {
            let entries = inner.entries.lock().await;
            match entries.get(&key) {
                Some(entry) if !entry.failed => entry.url.clone(),
                _ => return,
            }
        };

        match inner.connector.connect(&url).await {
            Ok(mut stream) => {
                tracing::debug!(%url, "pooled stream connected");
                {
                    let mut entries = inner.entries.lock().await;
                    if let Some(entry) = entries.get_mut(&key) {
                        entry.failure_count = 0;
                        entry.last_heartbeat = Instant::now();
                        entry.missed_heartbeats = 0;
                    } else {
                        return;
                    }
                }
                loop {
                    match stream.next().await {
                        Some(Ok(frame)) => {
                            if !handle_frame(&inner, &key, &frame).await {
                                return;
                            }
                        }
                        Some(Err(err)) => {
                            tracing::warn!(%url, %err, "stream error");
                            break;
                        }
                        None => {
                            tracing::debug!(%url, "stream closed by server");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(%url, %err, "stream connect failed");
            }
        }

        if !record_failure(&inner, &key).await {
            return;
        }
        sleep(inner.config.reconnect_delay).await;
    }
}

/// Count one connection failure; returns false when the entry is gone or the
/// failure budget is exhausted.
async fn record_failure(inner: &Arc<PoolInner>, key: &str) -> bool {
    let (callbacks, event) = {
        let mut entries = inner.entries.lock().await;
        let entry = match entries.get_mut(key) {
            Some(e) => e,
            None => return false,
        };
        entry.failure_count += 1;
        entry.quality.error_rate = (entry.quality.error_rate + 0.2).min(1.0);
        if entry.failure_count >= inner.config.max_failures {
            entry.failed = true;
            tracing::error!(url = %entry.url, failures = entry.failure_count,
                "connection failed permanently");
            (
                entry.snapshot_callbacks(),
                Some(PoolEvent::Failed {
                    failures: entry.failure_count,
                }),
            )
        } else {
            (Vec::new(), None)
        }
    };

    match event {
        Some(event) => {
            fan_out(inner, key, &callbacks, event).await;
            false
        }
        None => true,
    }
}

// ---------------------------------------------------------------------------
// Frame handling
// ---------------------------------------------------------------------------

/// Process one decoded frame. Returns false when the entry no longer exists.
async fn handle_frame(inner: &Arc<PoolInner>, key: &str, frame: &str) -> bool {
    let message = decode_message(frame);

    let (callbacks, event) = {
        let mut entries = inner.entries.lock().await;
        let entry = match entries.get_mut(key) {
            Some(e) => e,
            None => return false,
        };

        // Every frame counts as liveness.
        entry.last_heartbeat = Instant::now();
        entry.missed_heartbeats = 0;
        entry.quality.update_count += 1;

        let event = match message {
            StreamMessage::Heartbeat { server_time } => {
                if let Some(ts) = server_time {
                    let latency = (Utc::now() - ts).num_milliseconds().max(0);
                    entry.quality.latency_ms = latency as f64;
                }
                // Heartbeats are internal; never forwarded.
                None
            }
            StreamMessage::DifferentialUpdate { patch, mut payload } => {
                match entry.processor.as_mut() {
                    Some(processor) => {
                        let seq = patch.sequence_number;
                        match seq {
                            Some(seq) if seq > entry.last_sequence_number => {
                                if entry.optimistic_queue.len()
                                    >= inner.config.max_optimistic_queue
                                {
                                    entry.quality.missed_updates += 1;
                                    tracing::warn!(url = %entry.url, seq,
                                        "optimistic queue full, dropping update");
                                    None
                                } else {
                                    let id = Uuid::new_v4().to_string();
                                    entry.optimistic_queue.push_back(OptimisticUpdate {
                                        id: id.clone(),
                                        sequence_number: seq,
                                    });
                                    processor.add_pending_patch(id, patch);
                                    entry.last_sequence_number = seq;
                                    let computed = processor.current_state();
                                    if let Some(obj) = payload.as_object_mut() {
                                        obj.insert("computedState".into(), computed);
                                        obj.insert("isOptimistic".into(), json!(true));
                                    }
                                    Some(PoolEvent::Message(payload))
                                }
                            }
                            _ => {
                                // Stale, duplicate, or unsequenced patch.
                                entry.quality.missed_updates += 1;
                                tracing::debug!(url = %entry.url, ?seq,
                                    last = entry.last_sequence_number,
                                    "dropping out-of-order patch");
                                None
                            }
                        }
                    }
                    None => Some(PoolEvent::Message(payload)),
                }
            }
            StreamMessage::FullSnapshot { snapshot, payload } => {
                if let Some(processor) = entry.processor.as_mut() {
                    processor.update_base_snapshot(&snapshot);
                    while let Some(pending) = entry.optimistic_queue.pop_front() {
                        processor.remove_patch(&pending.id);
                        tracing::trace!(seq = pending.sequence_number,
                            "optimistic patch superseded by snapshot");
                    }
                    tracing::debug!(url = %entry.url, "full snapshot reconciled");
                }
                Some(PoolEvent::Message(payload))
            }
            StreamMessage::Plain { payload } => Some(PoolEvent::Message(payload)),
            StreamMessage::Raw { data } => Some(PoolEvent::Raw(data)),
        };

        match event {
            Some(event) => (entry.snapshot_callbacks(), Some(event)),
            None => (Vec::new(), None),
        }
    };

    if let Some(event) = event {
        fan_out(inner, key, &callbacks, event).await;
    }
    true
}

/// Deliver an event to every callback. A panicking subscriber is isolated and
/// charged against the connection's error rate.
async fn fan_out(inner: &Arc<PoolInner>, key: &str, callbacks: &[PoolCallback], event: PoolEvent) {
    let mut panicked = 0u32;
    for cb in callbacks {
        let ev = event.clone();
        if catch_unwind(AssertUnwindSafe(|| cb(ev))).is_err() {
            panicked += 1;
            tracing::error!(%key, "subscriber callback panicked");
        }
    }
    if panicked > 0 {
        let mut entries = inner.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.quality.error_rate = (entry.quality.error_rate + 0.1).min(1.0);
        }
    }
}

// ---------------------------------------------------------------------------
// Monitoring
// ---------------------------------------------------------------------------

async fn monitor_loop(inner: Arc<PoolInner>) {
    let mut heartbeat_tick = interval(inner.config.heartbeat_timeout / 2);
    let mut quality_tick = interval(inner.config.quality_interval);
    heartbeat_tick.tick().await;
    quality_tick.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat_tick.tick() => check_heartbeats(&inner).await,
            _ = quality_tick.tick() => score_quality(&inner).await,
        }
    }
}

async fn check_heartbeats(inner: &Arc<PoolInner>) {
    let mut degraded: Vec<(String, Vec<PoolCallback>, u32)> = Vec::new();
    {
        let mut entries = inner.entries.lock().await;
        for (key, entry) in entries.iter_mut() {
            if entry.failed {
                continue;
            }
            if entry.last_heartbeat.elapsed() > inner.config.heartbeat_timeout {
                entry.missed_heartbeats += 1;
                entry.last_heartbeat = Instant::now();
                tracing::warn!(url = %entry.url, missed = entry.missed_heartbeats,
                    "heartbeat window elapsed without traffic");
                if entry.missed_heartbeats == inner.config.max_missed_heartbeats {
                    degraded.push((
                        key.clone(),
                        entry.snapshot_callbacks(),
                        entry.missed_heartbeats,
                    ));
                }
            }
        }
    }
    for (key, callbacks, missed) in degraded {
        fan_out(
            inner,
            &key,
            &callbacks,
            PoolEvent::Degraded {
                missed_heartbeats: missed,
            },
        )
        .await;
    }
}

async fn score_quality(inner: &Arc<PoolInner>) {
    let mut entries = inner.entries.lock().await;
    for entry in entries.values_mut() {
        entry.quality.score = compute_quality_score(
            &entry.quality,
            entry.missed_heartbeats,
            inner.config.latency_threshold_ms,
        );
        tracing::trace!(url = %entry.url, score = entry.quality.score, "quality scored");
    }
}

/// Score a connection out of 100 from its accumulated metrics.
pub(crate) fn compute_quality_score(
    metrics: &QualityMetrics,
    missed_heartbeats: u32,
    latency_threshold_ms: f64,
) -> u32 {
    let mut score = 100.0f64;
    if metrics.latency_ms > latency_threshold_ms {
        score -= ((metrics.latency_ms - latency_threshold_ms) / 100.0).min(30.0);
    }
    score -= metrics.error_rate * 40.0;
    if metrics.update_count > 0 {
        score -= (metrics.missed_updates as f64 / metrics.update_count as f64) * 30.0;
    }
    score -= missed_heartbeats as f64 * 10.0;
    score.max(0.0).round() as u32
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::FrameStream;
    use async_trait::async_trait;
    use domainflow_types::{DomainflowError, Result};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    /// Scripted connector: each connect hands back a channel the test feeds.
    struct MockConnector {
        senders: std::sync::Mutex<Vec<mpsc::Sender<Result<String>>>>,
        connects: AtomicUsize,
        fail: AtomicBool,
    }

    impl MockConnector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                senders: std::sync::Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            })
        }

        fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        async fn send_frame(&self, frame: &str) {
            let tx = {
                let senders = self.senders.lock().unwrap();
                senders.last().cloned()
            };
            if let Some(tx) = tx {
                tx.send(Ok(frame.to_string())).await.unwrap();
            }
        }
    }

    #[async_trait]
    impl PushConnector for MockConnector {
        async fn connect(&self, _url: &str) -> Result<FrameStream> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(DomainflowError::Transport {
                    message: "refused".into(),
                    retryable: true,
                });
            }
            let (tx, rx) = mpsc::channel(16);
            self.senders.lock().unwrap().push(tx);
            Ok(Box::pin(ReceiverStream::new(rx)))
        }
    }

    fn fast_config() -> PoolConfig {
        PoolConfig {
            heartbeat_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_millis(10),
            ..PoolConfig::default()
        }
    }

    fn collecting_callback() -> (PoolCallback, Arc<std::sync::Mutex<Vec<PoolEvent>>>) {
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = events.clone();
        let cb: PoolCallback = Arc::new(move |ev| sink.lock().unwrap().push(ev));
        (cb, events)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn delta_frame(seq: u64, path: &str, value: Value) -> String {
        json!({
            "type": "differential_update",
            "patch": {
                "type": "delta",
                "timestamp": Utc::now().to_rfc3339(),
                "changes": [{"op": "set", "path": path, "value": value}],
                "sequenceNumber": seq
            }
        })
        .to_string()
    }

    // 1. Two subscribers to the same URL share one connection.
    #[tokio::test]
    async fn pooled_subscribers_share_one_connection() {
        let connector = MockConnector::new();
        let pool = StreamPoolManager::new(fast_config(), connector.clone());

        let (cb1, events1) = collecting_callback();
        let (cb2, events2) = collecting_callback();
        let t1 = pool.subscribe("http://x/stream", cb1).await;
        let t2 = pool.subscribe("http://x/stream", cb2).await;
        settle().await;

        assert_eq!(connector.connect_count(), 1);
        assert_eq!(pool.entry_count().await, 1);
        let stats = pool.stats("http://x/stream").await.unwrap();
        assert_eq!(stats.ref_count, 2);

        connector
            .send_frame(&delta_frame(1, "status", json!("running")))
            .await;
        settle().await;
        assert_eq!(events1.lock().unwrap().len(), 1);
        assert_eq!(events2.lock().unwrap().len(), 1);

        // First unsubscribe keeps the connection alive.
        pool.unsubscribe(&t1).await;
        assert_eq!(pool.entry_count().await, 1);
        pool.unsubscribe(&t2).await;
        assert_eq!(pool.entry_count().await, 0);
    }

    // 2. With pooling disabled, each subscriber gets a private connection.
    #[tokio::test]
    async fn pooling_disabled_gives_private_connections() {
        let connector = MockConnector::new();
        let config = PoolConfig {
            pooling_enabled: false,
            ..fast_config()
        };
        let pool = StreamPoolManager::new(config, connector.clone());

        let (cb1, _) = collecting_callback();
        let (cb2, _) = collecting_callback();
        pool.subscribe("http://x/stream", cb1).await;
        pool.subscribe("http://x/stream", cb2).await;
        settle().await;

        assert_eq!(connector.connect_count(), 2);
        assert_eq!(pool.entry_count().await, 2);
    }

    // 3. Differential updates synthesize computedState and flag optimism.
    #[tokio::test]
    async fn differential_update_carries_computed_state() {
        let connector = MockConnector::new();
        let pool = StreamPoolManager::new(fast_config(), connector.clone());
        let (cb, events) = collecting_callback();
        pool.subscribe("http://x/stream", cb).await;
        settle().await;

        connector
            .send_frame(&json!({"type": "full_snapshot", "snapshot": {"status": "queued", "progressPercent": 0}}).to_string())
            .await;
        connector
            .send_frame(&delta_frame(1, "status", json!("running")))
            .await;
        connector
            .send_frame(&delta_frame(2, "progressPercent", json!(40)))
            .await;
        settle().await;

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        match &events[2] {
            PoolEvent::Message(payload) => {
                assert_eq!(payload["isOptimistic"], true);
                assert_eq!(payload["computedState"]["status"], "running");
                assert_eq!(payload["computedState"]["progressPercent"], 40);
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    // 4. Duplicate and stale sequence numbers are dropped and counted.
    #[tokio::test]
    async fn stale_sequences_are_dropped() {
        let connector = MockConnector::new();
        let pool = StreamPoolManager::new(fast_config(), connector.clone());
        let (cb, events) = collecting_callback();
        pool.subscribe("http://x/stream", cb).await;
        settle().await;

        connector
            .send_frame(&delta_frame(5, "status", json!("running")))
            .await;
        connector
            .send_frame(&delta_frame(5, "status", json!("running")))
            .await;
        connector
            .send_frame(&delta_frame(3, "status", json!("queued")))
            .await;
        settle().await;

        assert_eq!(events.lock().unwrap().len(), 1);
        let stats = pool.stats("http://x/stream").await.unwrap();
        assert_eq!(stats.last_sequence_number, 5);
        assert_eq!(stats.missed_updates, 2);
    }

    // 5. The optimistic queue rejects updates past its capacity.
    #[tokio::test]
    async fn optimistic_queue_enforces_capacity() {
        let connector = MockConnector::new();
        let config = PoolConfig {
            max_optimistic_queue: 2,
            ..fast_config()
        };
        let pool = StreamPoolManager::new(config, connector.clone());
        let (cb, events) = collecting_callback();
        pool.subscribe("http://x/stream", cb).await;
        settle().await;

        for seq in 1..=3 {
            connector
                .send_frame(&delta_frame(seq, "progressPercent", json!(seq * 10)))
                .await;
        }
        settle().await;

        assert_eq!(events.lock().unwrap().len(), 2);
        let stats = pool.stats("http://x/stream").await.unwrap();
        assert_eq!(stats.optimistic_len, 2);
        assert_eq!(stats.missed_updates, 1);
    }

    // 6. A full snapshot resets differential state and drains the queue.
    #[tokio::test]
    async fn full_snapshot_reconciles_and_clears_queue() {
        let connector = MockConnector::new();
        let pool = StreamPoolManager::new(fast_config(), connector.clone());
        let (cb, events) = collecting_callback();
        pool.subscribe("http://x/stream", cb).await;
        settle().await;

        connector
            .send_frame(&delta_frame(1, "status", json!("running")))
            .await;
        connector
            .send_frame(
                &json!({"type": "full_snapshot", "snapshot": {"status": "completed", "progressPercent": 100}})
                    .to_string(),
            )
            .await;
        settle().await;

        let stats = pool.stats("http://x/stream").await.unwrap();
        assert_eq!(stats.optimistic_len, 0);
        let events = events.lock().unwrap();
        match events.last().unwrap() {
            PoolEvent::Message(payload) => {
                assert_eq!(payload["snapshot"]["status"], "completed");
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    // 7. Heartbeats refresh liveness but are never forwarded.
    #[tokio::test]
    async fn heartbeats_are_not_forwarded() {
        let connector = MockConnector::new();
        let pool = StreamPoolManager::new(fast_config(), connector.clone());
        let (cb, events) = collecting_callback();
        pool.subscribe("http://x/stream", cb).await;
        settle().await;

        connector
            .send_frame(r#"{"type":"heartbeat","serverTime":"2025-06-01T12:00:00Z"}"#)
            .await;
        settle().await;

        assert!(events.lock().unwrap().is_empty());
    }

    // 8. Non-JSON frames pass through as raw events.
    #[tokio::test]
    async fn raw_frames_pass_through() {
        let connector = MockConnector::new();
        let pool = StreamPoolManager::new(fast_config(), connector.clone());
        let (cb, events) = collecting_callback();
        pool.subscribe("http://x/stream", cb).await;
        settle().await;

        connector.send_frame("plain text frame").await;
        settle().await;

        let events = events.lock().unwrap();
        match events.first().unwrap() {
            PoolEvent::Raw(data) => assert_eq!(data, "plain text frame"),
            other => panic!("expected raw, got {other:?}"),
        }
    }

    // 9. A panicking subscriber does not starve the others.
    #[tokio::test]
    async fn callback_panic_is_isolated() {
        let connector = MockConnector::new();
        let pool = StreamPoolManager::new(fast_config(), connector.clone());

        let panicking: PoolCallback = Arc::new(|_| panic!("subscriber bug"));
        let (cb, events) = collecting_callback();
        pool.subscribe("http://x/stream", panicking).await;
        pool.subscribe("http://x/stream", cb).await;
        settle().await;

        connector
            .send_frame(&delta_frame(1, "status", json!("running")))
            .await;
        settle().await;

        assert_eq!(events.lock().unwrap().len(), 1);
        let quality = pool.quality("http://x/stream").await.unwrap();
        assert!(quality.error_rate > 0.0);
    }

    // 10. Repeated connect failures eventually mark the connection failed.
    #[tokio::test]
    async fn connect_failures_exhaust_budget() {
        let connector = MockConnector::new();
        connector.fail.store(true, Ordering::SeqCst);
        let config = PoolConfig {
            max_failures: 3,
            reconnect_delay: Duration::from_millis(5),
            ..fast_config()
        };
        let pool = StreamPoolManager::new(config, connector.clone());
        let (cb, events) = collecting_callback();
        pool.subscribe("http://x/stream", cb).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(connector.connect_count(), 3);
        let failed = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, PoolEvent::Failed { .. }))
            .count();
        assert_eq!(failed, 1);
    }

    // 11. Reconnect preserves subscribers but resets differential state.
    #[tokio::test]
    async fn reconnect_preserves_subscribers() {
        let connector = MockConnector::new();
        let pool = StreamPoolManager::new(fast_config(), connector.clone());
        let (cb, events) = collecting_callback();
        pool.subscribe("http://x/stream", cb).await;
        settle().await;

        connector
            .send_frame(&delta_frame(7, "status", json!("running")))
            .await;
        settle().await;

        pool.reconnect("http://x/stream").await;
        settle().await;

        assert_eq!(connector.connect_count(), 2);
        let stats = pool.stats("http://x/stream").await.unwrap();
        assert_eq!(stats.ref_count, 1);
        assert_eq!(stats.last_sequence_number, 0);

        // Sequence numbering restarts on the fresh connection.
        connector
            .send_frame(&delta_frame(1, "status", json!("queued")))
            .await;
        settle().await;
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    // 12. A silent connection crosses the missed-heartbeat threshold and
    // subscribers hear about the degradation exactly once.
    #[tokio::test]
    async fn silent_connection_reports_degradation() {
        let connector = MockConnector::new();
        let config = PoolConfig {
            heartbeat_timeout: Duration::from_millis(40),
            max_missed_heartbeats: 2,
            ..fast_config()
        };
        let pool = StreamPoolManager::new(config, connector.clone());
        let (cb, events) = collecting_callback();
        pool.subscribe("http://x/stream", cb).await;

        tokio::time::sleep(Duration::from_millis(400)).await;

        let degraded = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, PoolEvent::Degraded { .. }))
            .count();
        assert_eq!(degraded, 1);
        let stats = pool.stats("http://x/stream").await.unwrap();
        assert!(stats.missed_heartbeats >= 2);
    }

    // 13. With pooling disabled, entries carry private keys but reconnect
    // still finds them by URL and keeps the callback wired up.
    #[tokio::test]
    async fn reconnect_reaches_private_connections() {
        let connector = MockConnector::new();
        let config = PoolConfig {
            pooling_enabled: false,
            ..fast_config()
        };
        let pool = StreamPoolManager::new(config, connector.clone());
        let (cb, events) = collecting_callback();
        pool.subscribe("http://x/stream", cb).await;
        settle().await;

        pool.reconnect("http://x/stream").await;
        settle().await;

        assert_eq!(connector.connect_count(), 2);
        assert_eq!(pool.entry_count().await, 1);

        connector
            .send_frame(&delta_frame(1, "status", json!("running")))
            .await;
        settle().await;
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    // 14. Quality scoring penalties.
    #[test]
    fn quality_score_penalizes_latency() {
        let metrics = QualityMetrics {
            latency_ms: 1500.0,
            ..QualityMetrics::default()
        };
        // (1500 - 500) / 100 = 10 points off.
        assert_eq!(compute_quality_score(&metrics, 0, 500.0), 90);
    }

    #[test]
    fn quality_score_caps_latency_penalty() {
        let metrics = QualityMetrics {
            latency_ms: 50_000.0,
            ..QualityMetrics::default()
        };
        assert_eq!(compute_quality_score(&metrics, 0, 500.0), 70);
    }

    #[test]
    fn quality_score_combines_penalties() {
        let metrics = QualityMetrics {
            error_rate: 0.5,
            update_count: 10,
            missed_updates: 5,
            ..QualityMetrics::default()
        };
        // 100 - 0.5*40 - (5/10)*30 - 2*10 = 45.
        assert_eq!(compute_quality_score(&metrics, 2, 500.0), 45);
    }

    #[test]
    fn quality_score_floors_at_zero() {
        let metrics = QualityMetrics {
            error_rate: 1.0,
            update_count: 1,
            missed_updates: 1,
            latency_ms: 10_000.0,
            ..QualityMetrics::default()
        };
        assert_eq!(compute_quality_score(&metrics, 10, 500.0), 0);
    }
}
