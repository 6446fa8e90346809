//! Progress sessions: a push-first lifecycle over one campaign's progress,
//! with heartbeat-driven circuit breaking to a polling fallback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};

use domainflow_types::{DomainflowError, ProgressUpdate, Result};

use crate::codec::{decode_message, StreamMessage};
use crate::config::{SessionConfig, TransportCapabilities};
use crate::connector::{HttpProgressFetcher, ProgressFetcher, PushConnector, SseConnector};
use crate::pool::{PoolEvent, StreamPoolManager, SubscriptionToken};

/// Silent heartbeat windows tolerated before the circuit breaker trips.
const SILENT_WINDOW_LIMIT: u32 = 3;

// ---------------------------------------------------------------------------
// State and callbacks
// ---------------------------------------------------------------------------

/// Lifecycle of a progress session. `Disconnected` sessions can be started
/// again; `Destroyed` ones cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Completed,
    Destroyed,
}

#[derive(Clone, Default)]
struct SessionCallbacks {
    on_update: Option<Arc<dyn Fn(ProgressUpdate) + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(DomainflowError) + Send + Sync>>,
    on_complete: Option<Arc<dyn Fn(ProgressUpdate) + Send + Sync>>,
    on_connect: Option<Arc<dyn Fn() + Send + Sync>>,
    on_disconnect: Option<Arc<dyn Fn() + Send + Sync>>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`ProgressStream`]. Transports default to live HTTP
/// implementations; inject alternatives for tests.
pub struct ProgressStreamBuilder {
    stream_url: String,
    poll_url: String,
    config: SessionConfig,
    capabilities: TransportCapabilities,
    connector: Option<Arc<dyn PushConnector>>,
    fetcher: Option<Arc<dyn ProgressFetcher>>,
    pool: Option<StreamPoolManager>,
    callbacks: SessionCallbacks,
}

impl ProgressStreamBuilder {
    pub fn new(stream_url: impl Into<String>, poll_url: impl Into<String>) -> Self {
        Self {
            stream_url: stream_url.into(),
            poll_url: poll_url.into(),
            config: SessionConfig::default(),
            capabilities: TransportCapabilities::default(),
            connector: None,
            fetcher: None,
            pool: None,
            callbacks: SessionCallbacks::default(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_capabilities(mut self, capabilities: TransportCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn PushConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ProgressFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_pool(mut self, pool: StreamPoolManager) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn on_update(mut self, f: impl Fn(ProgressUpdate) + Send + Sync + 'static) -> Self {
        self.callbacks.on_update = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(DomainflowError) + Send + Sync + 'static) -> Self {
        self.callbacks.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn(ProgressUpdate) + Send + Sync + 'static) -> Self {
        self.callbacks.on_complete = Some(Arc::new(f));
        self
    }

    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_connect = Some(Arc::new(f));
        self
    }

    pub fn on_disconnect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_disconnect = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> ProgressStream {
        ProgressStream {
            inner: Arc::new(SessionInner {
                stream_url: self.stream_url,
                poll_url: self.poll_url,
                config: self.config,
                capabilities: self.capabilities,
                connector: self
                    .connector
                    .unwrap_or_else(|| Arc::new(SseConnector::new())),
                fetcher: self
                    .fetcher
                    .unwrap_or_else(|| Arc::new(HttpProgressFetcher::new())),
                pool: self.pool,
                callbacks: self.callbacks,
                generation: AtomicU64::new(0),
                activity: AtomicU64::new(0),
                shared: Mutex::new(Shared {
                    state: SessionState::Idle,
                    driver: None,
                    heartbeat: None,
                    pool_token: None,
                }),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct Shared {
    state: SessionState,
    driver: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    pool_token: Option<SubscriptionToken>,
}

struct SessionInner {
    stream_url: String,
    poll_url: String,
    config: SessionConfig,
    capabilities: TransportCapabilities,
    connector: Arc<dyn PushConnector>,
    fetcher: Arc<dyn ProgressFetcher>,
    pool: Option<StreamPoolManager>,
    callbacks: SessionCallbacks,
    /// Bumped on every start/stop; background tasks from earlier lifecycles
    /// check it and stand down.
    generation: AtomicU64,
    /// Incremented on every inbound message; the heartbeat loop watches it.
    activity: AtomicU64,
    shared: Mutex<Shared>,
}

/// One campaign's progress feed. Prefers the push transport, dropping to
/// polling when capabilities rule push out or the stream goes silent.
#[derive(Clone)]
pub struct ProgressStream {
    inner: Arc<SessionInner>,
}

impl ProgressStream {
    pub fn builder(
        stream_url: impl Into<String>,
        poll_url: impl Into<String>,
    ) -> ProgressStreamBuilder {
        ProgressStreamBuilder::new(stream_url, poll_url)
    }

    pub async fn state(&self) -> SessionState {
        self.inner.shared.lock().await.state
    }

    /// Begin streaming. Errors if the session was destroyed or is already
    /// running; `Idle`, `Disconnected`, and `Completed` sessions may start.
    pub async fn start(&self) -> Result<()> {
        let inner = self.inner.clone();
        let mut shared = inner.shared.lock().await;
        match shared.state {
            SessionState::Destroyed => return Err(DomainflowError::SessionDestroyed),
            SessionState::Connecting | SessionState::Connected => {
                return Err(DomainflowError::InvalidSessionState {
                    state: format!("{:?}", shared.state),
                });
            }
            _ => {}
        }

        let gen = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        shared.state = SessionState::Connecting;

        let use_push = inner.config.prefer_push && inner.capabilities.push_supported;
        if !use_push {
            tracing::debug!(url = %inner.poll_url, "push unavailable, starting on polling");
            shared.driver = Some(tokio::spawn(poll_driver(inner.clone(), gen)));
            return Ok(());
        }

        if let (true, Some(pool)) = (inner.capabilities.pooling_available, inner.pool.clone()) {
            let handler = inner.clone();
            let token = pool
                .subscribe(
                    &inner.stream_url,
                    Arc::new(move |event| handle_pool_event(&handler, gen, event)),
                )
                .await;
            shared.pool_token = Some(token);
            shared.state = SessionState::Connected;
            shared.heartbeat = Some(tokio::spawn(heartbeat_loop(inner.clone(), gen)));
            drop(shared);
            if let Some(cb) = &inner.callbacks.on_connect {
                cb();
            }
        } else {
            shared.driver = Some(tokio::spawn(push_driver(inner.clone(), gen)));
        }
        Ok(())
    }

    /// Stop streaming. The session can be started again afterwards.
    pub async fn stop(&self) {
        self.shutdown(SessionState::Disconnected).await;
    }

    /// Permanently tear the session down.
    pub async fn destroy(&self) {
        self.shutdown(SessionState::Destroyed).await;
    }

    async fn shutdown(&self, terminal: SessionState) {
        let inner = &self.inner;
        inner.generation.fetch_add(1, Ordering::SeqCst);
        let (was_running, token) = {
            let mut shared = inner.shared.lock().await;
            let was_running = matches!(
                shared.state,
                SessionState::Connecting | SessionState::Connected
            );
            shared.state = terminal;
            if let Some(hb) = shared.heartbeat.take() {
                hb.abort();
            }
            if let Some(driver) = shared.driver.take() {
                driver.abort();
            }
            (was_running, shared.pool_token.take())
        };
        if let (Some(token), Some(pool)) = (token, &inner.pool) {
            pool.unsubscribe(&token).await;
        }
        if was_running {
            if let Some(cb) = &inner.callbacks.on_disconnect {
                cb();
            }
        }
    }
}

fn stale(inner: &SessionInner, gen: u64) -> bool {
    inner.generation.load(Ordering::SeqCst) != gen
}

// ---------------------------------------------------------------------------
// Pool-backed push path
// ---------------------------------------------------------------------------

fn handle_pool_event(inner: &Arc<SessionInner>, gen: u64, event: PoolEvent) {
    if stale(inner, gen) {
        return;
    }
    match event {
        PoolEvent::Message(payload) => {
            inner.activity.fetch_add(1, Ordering::SeqCst);
            if let Some(update) = normalize_update(&payload) {
                let terminal = update.is_terminal();
                if let Some(cb) = &inner.callbacks.on_update {
                    cb(update.clone());
                }
                if terminal {
                    // Invalidate the current generation right here so frames
                    // behind the terminal one never reach the subscriber,
                    // even before the teardown task runs.
                    let next = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let inner = inner.clone();
                    tokio::spawn(async move { complete(inner, next, update).await });
                }
            }
        }
        PoolEvent::Raw(_) => {
            inner.activity.fetch_add(1, Ordering::SeqCst);
        }
        PoolEvent::Degraded { missed_heartbeats } => {
            tracing::warn!(missed_heartbeats, "pooled connection degraded");
        }
        PoolEvent::Failed { failures } => {
            let next = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let inner = inner.clone();
            let url = inner.stream_url.clone();
            tokio::spawn(async move {
                fail(
                    inner,
                    next,
                    DomainflowError::ConnectionFailed {
                        url,
                        attempts: failures as usize,
                    },
                )
                .await;
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Direct push path
// ---------------------------------------------------------------------------

async fn push_driver(inner: Arc<SessionInner>, gen: u64) {
    use tokio_stream::StreamExt;

    let mut retry = 0u32;
    loop {
        if stale(&inner, gen) {
            return;
        }
        match inner.connector.connect(&inner.stream_url).await {
            Ok(mut stream) => {
                mark_connected(&inner, gen).await;
                spawn_heartbeat(&inner, gen).await;
                retry = 0;
                loop {
                    match stream.next().await {
                        Some(Ok(frame)) => {
                            if handle_push_frame(&inner, gen, &frame).await {
                                return;
                            }
                        }
                        Some(Err(err)) => {
                            tracing::warn!(url = %inner.stream_url, %err, "stream error");
                            break;
                        }
                        None => {
                            tracing::debug!(url = %inner.stream_url, "stream ended");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(url = %inner.stream_url, %err, "stream connect failed");
            }
        }

        retry += 1;
        if retry > inner.config.max_retries {
            let url = inner.stream_url.clone();
            fail(
                inner,
                gen,
                DomainflowError::ConnectionFailed {
                    url,
                    attempts: retry as usize,
                },
            )
            .await;
            return;
        }
        // Linear backoff between push attempts.
        sleep(inner.config.retry_base_delay * retry).await;
    }
}

/// Returns true when the session reached a terminal update.
async fn handle_push_frame(inner: &Arc<SessionInner>, gen: u64, frame: &str) -> bool {
    inner.activity.fetch_add(1, Ordering::SeqCst);
    let payload = match decode_message(frame) {
        StreamMessage::Heartbeat { .. } | StreamMessage::Raw { .. } => return false,
        StreamMessage::DifferentialUpdate { payload, .. } => payload,
        StreamMessage::FullSnapshot { payload, .. } => payload,
        StreamMessage::Plain { payload } => payload,
    };
    if let Some(update) = normalize_update(&payload) {
        let terminal = update.is_terminal();
        if let Some(cb) = &inner.callbacks.on_update {
            cb(update.clone());
        }
        if terminal {
            complete(inner.clone(), gen, update).await;
            return true;
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Heartbeat circuit breaker
// ---------------------------------------------------------------------------

async fn heartbeat_loop(inner: Arc<SessionInner>, gen: u64) {
    let mut tick = interval(inner.config.heartbeat_timeout);
    tick.tick().await;
    let mut last_seen = inner.activity.load(Ordering::SeqCst);
    let mut silent = 0u32;

    loop {
        tick.tick().await;
        if stale(&inner, gen) {
            return;
        }
        let seen = inner.activity.load(Ordering::SeqCst);
        if seen == last_seen {
            silent += 1;
            tracing::warn!(url = %inner.stream_url, silent, "heartbeat window passed in silence");
            if silent >= SILENT_WINDOW_LIMIT {
                tracing::warn!(url = %inner.stream_url,
                    "push transport unresponsive, breaking to polling");
                switch_to_polling(&inner, gen).await;
                return;
            }
        } else {
            silent = 0;
            last_seen = seen;
        }
    }
}

async fn switch_to_polling(inner: &Arc<SessionInner>, gen: u64) {
    let token = {
        let mut shared = inner.shared.lock().await;
        if let Some(driver) = shared.driver.take() {
            driver.abort();
        }
        // This runs on the heartbeat task itself; just forget the handle.
        shared.heartbeat = None;
        shared.driver = Some(tokio::spawn(poll_driver(inner.clone(), gen)));
        shared.pool_token.take()
    };
    if let (Some(token), Some(pool)) = (token, &inner.pool) {
        pool.unsubscribe(&token).await;
    }
}

// ---------------------------------------------------------------------------
// Polling path
// ---------------------------------------------------------------------------

async fn poll_driver(inner: Arc<SessionInner>, gen: u64) {
    mark_connected(&inner, gen).await;

    let mut retry = 0u32;
    loop {
        if stale(&inner, gen) {
            return;
        }
        match inner.fetcher.fetch(&inner.poll_url).await {
            Ok(update) => {
                retry = 0;
                inner.activity.fetch_add(1, Ordering::SeqCst);
                let terminal = update.is_terminal();
                if let Some(cb) = &inner.callbacks.on_update {
                    cb(update.clone());
                }
                if terminal {
                    complete(inner.clone(), gen, update).await;
                    return;
                }
                sleep(inner.config.polling_interval).await;
            }
            Err(err) => {
                retry += 1;
                tracing::warn!(url = %inner.poll_url, %err, retry, "poll failed");
                if retry > inner.config.max_retries {
                    fail(inner, gen, err).await;
                    return;
                }
                // Exponential backoff between poll attempts.
                sleep(inner.config.polling_interval * 2u32.pow(retry)).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shared transitions
// ---------------------------------------------------------------------------

async fn mark_connected(inner: &Arc<SessionInner>, gen: u64) {
    let first = {
        let mut shared = inner.shared.lock().await;
        if stale(inner, gen) {
            return;
        }
        let first = shared.state != SessionState::Connected;
        shared.state = SessionState::Connected;
        first
    };
    if first {
        if let Some(cb) = &inner.callbacks.on_connect {
            cb();
        }
    }
}

/// Spawned separately from [`mark_connected`] so no async fn's opaque future
/// type refers back to itself through the heartbeat/poll fallback chain.
async fn spawn_heartbeat(inner: &Arc<SessionInner>, gen: u64) {
    let mut shared = inner.shared.lock().await;
    if stale(inner, gen) {
        return;
    }
    if shared.heartbeat.is_none() {
        shared.heartbeat = Some(tokio::spawn(heartbeat_loop(inner.clone(), gen)));
    }
}

async fn complete(inner: Arc<SessionInner>, gen: u64, update: ProgressUpdate) {
    let (token, driver) = {
        let mut shared = inner.shared.lock().await;
        if stale(&inner, gen) || shared.state == SessionState::Completed {
            return;
        }
        inner.generation.fetch_add(1, Ordering::SeqCst);
        shared.state = SessionState::Completed;
        if let Some(hb) = shared.heartbeat.take() {
            hb.abort();
        }
        (shared.pool_token.take(), shared.driver.take())
    };
    if let (Some(token), Some(pool)) = (&token, &inner.pool) {
        pool.unsubscribe(token).await;
    }
    tracing::info!(phase = %update.phase, "session completed");
    if let Some(cb) = &inner.callbacks.on_complete {
        cb(update);
    }
    // May be our own task; abort last, after the callback has fired.
    if let Some(driver) = driver {
        driver.abort();
    }
}

async fn fail(inner: Arc<SessionInner>, gen: u64, err: DomainflowError) {
    let (token, driver) = {
        let mut shared = inner.shared.lock().await;
        if stale(&inner, gen)
            || matches!(
                shared.state,
                SessionState::Completed | SessionState::Destroyed
            )
        {
            return;
        }
        inner.generation.fetch_add(1, Ordering::SeqCst);
        shared.state = SessionState::Disconnected;
        if let Some(hb) = shared.heartbeat.take() {
            hb.abort();
        }
        (shared.pool_token.take(), shared.driver.take())
    };
    if let (Some(token), Some(pool)) = (&token, &inner.pool) {
        pool.unsubscribe(token).await;
    }
    tracing::error!(%err, "session failed");
    if let Some(cb) = &inner.callbacks.on_error {
        cb(err);
    }
    if let Some(driver) = driver {
        driver.abort();
    }
}

/// Pull a [`ProgressUpdate`] out of a wire payload, looking first at the
/// payload itself and then at the nested shapes the server wraps updates in.
fn normalize_update(payload: &Value) -> Option<ProgressUpdate> {
    let candidates = [
        Some(payload),
        payload.get("computedState"),
        payload.get("snapshot"),
        payload.get("data"),
    ];
    for candidate in candidates.into_iter().flatten() {
        if let Ok(update) = serde_json::from_value::<ProgressUpdate>(candidate.clone()) {
            return Some(update);
        }
    }
    tracing::debug!("payload did not normalize to a progress update");
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
