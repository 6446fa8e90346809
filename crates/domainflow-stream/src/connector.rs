//! Transport seams: push (SSE) connections and point-in-time polling.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use domainflow_types::{DomainflowError, ProgressUpdate, Result};

use crate::codec::SseFrameDecoder;

/// Stream of decoded SSE event payloads from a live connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Seam for establishing push connections. The pool and sessions hold this
/// trait so tests can drive them with scripted frames.
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<FrameStream>;
}

/// Seam for the polling fallback path.
#[async_trait]
pub trait ProgressFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<ProgressUpdate>;
}

// ---------------------------------------------------------------------------
// HTTP implementations
// ---------------------------------------------------------------------------

/// SSE connector backed by `reqwest`. The response body is drained on a
/// spawned task so backpressure on the consumer never stalls the socket read
/// past the channel's capacity.
pub struct SseConnector {
    client: reqwest::Client,
}

impl SseConnector {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for SseConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushConnector for SseConnector {
    async fn connect(&self, url: &str) -> Result<FrameStream> {
        let resp = self
            .client
            .get(url)
            .header("accept", "text/event-stream")
            .send()
            .await
            .map_err(|err| DomainflowError::Transport {
                message: err.to_string(),
                retryable: true,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DomainflowError::Http {
                status: status.as_u16(),
                message: format!("stream request to {url} rejected"),
            });
        }

        let (tx, rx) = mpsc::channel::<Result<String>>(64);
        tokio::spawn(async move {
            let mut decoder = SseFrameDecoder::new();
            let body = resp.bytes_stream();
            tokio::pin!(body);
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        for frame in decoder.feed(&bytes) {
                            if tx.send(Ok(frame)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        let _ = tx
                            .send(Err(DomainflowError::Transport {
                                message: err.to_string(),
                                retryable: true,
                            }))
                            .await;
                        return;
                    }
                }
            }
            // Stream ended cleanly; dropping tx closes the channel.
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Polling fetcher hitting a plain JSON progress endpoint.
pub struct HttpProgressFetcher {
    client: reqwest::Client,
}

impl HttpProgressFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpProgressFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProgressFetcher for HttpProgressFetcher {
    async fn fetch(&self, url: &str) -> Result<ProgressUpdate> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| DomainflowError::Transport {
                message: err.to_string(),
                retryable: true,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DomainflowError::Http {
                status: status.as_u16(),
                message: format!("poll request to {url} rejected"),
            });
        }

        resp.json::<ProgressUpdate>()
            .await
            .map_err(|err| DomainflowError::Transport {
                message: format!("invalid progress payload: {err}"),
                retryable: true,
            })
    }
}
