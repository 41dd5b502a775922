//! Typed request API.
//!
//! A [`Client`] is a cheap handle to one connection. Any number of tasks may
//! issue requests concurrently; each call gets its own token and waits only
//! for its own reply.
//!
//! ```no_run
//! use syncwire::{Client, ClientConfig};
//!
//! # async fn example() -> syncwire::Result<()> {
//! let client = Client::connect(ClientConfig::new()).await?;
//! let reply = client.echo("hello").await?;
//! assert_eq!(reply.value, "hello");
//! client.close().await;
//! # Ok(())
//! # }
//! ```

use crate::config::{ClientConfig, DeliveryPolicy, SyncConfig};
use crate::correlation::{CorrelationEngine, TableStats, WaitHandle};
use crate::error::{Result, SyncwireError};
use crate::protocol::{encode_frame, EchoRequest, EchoResponse, Reply, Request, RequestHeader, SyncRequest};
use crate::sync::{SyncDriver, SyncHandle, SyncSink};
use crate::transport::{dialer_for_url, CloseReason, ConnectionState, Dialer};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Handle to one correlated connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    engine: CorrelationEngine,
    config: ClientConfig,
    session_id: String,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session_id", &self.inner.session_id)
            .field("engine", &self.inner.engine)
            .finish()
    }
}

impl Client {
    /// Connect to `config.peer_url`, picking the transport by URL scheme.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let dialer = dialer_for_url(&config.peer_url)?;
        Self::with_dialer(dialer.as_ref(), config).await
    }

    /// Connect through an explicit dialer. `config.peer_url` is ignored.
    pub async fn with_dialer(dialer: &dyn Dialer, config: ClientConfig) -> Result<Self> {
        let engine = CorrelationEngine::start(
            dialer,
            &config.retry,
            config.dial_timeout,
            config.write_timeout,
        )
        .await?;
        let session_id = uuid::Uuid::new_v4().to_string();
        info!("Session {} established with {}", session_id, engine.peer());

        Ok(Self {
            inner: Arc::new(ClientInner {
                engine,
                config,
                session_id,
            }),
        })
    }

    /// Send `request` and wait for its reply, bounded by the configured
    /// request timeout.
    pub async fn request<R: Request>(&self, request: &R) -> Result<R::Response> {
        self.request_with_timeout(request, self.inner.config.request_timeout)
            .await
    }

    /// Send `request` and wait for its reply, all within `timeout`.
    ///
    /// Time spent queued behind other writers counts against the timeout.
    pub async fn request_with_timeout<R: Request>(
        &self,
        request: &R,
        timeout: Duration,
    ) -> Result<R::Response> {
        let header = request.header();
        let frame = encode_frame(request)?;

        let started = Instant::now();
        let handle = self.submit_within(&header.request_id, frame, timeout).await?;
        let reply = handle.wait(timeout.saturating_sub(started.elapsed())).await?;

        decode_reply::<R>(header, &reply)
    }

    async fn submit_within(
        &self,
        token: &str,
        frame: Vec<u8>,
        timeout: Duration,
    ) -> Result<WaitHandle> {
        tokio::time::timeout(timeout, self.inner.engine.submit(token, frame))
            .await
            .map_err(|_| SyncwireError::Timeout(timeout))?
    }

    /// Round-trip `value` through the peer.
    pub async fn echo(&self, value: impl Into<String>) -> Result<EchoResponse> {
        let response = self.request(&EchoRequest::new(value)).await?;
        response.header.ensure_success()?;
        Ok(response)
    }

    /// Submit one file without waiting for the peer.
    ///
    /// Under [`DeliveryPolicy::Acknowledged`] the reply is awaited in a
    /// detached task and logged. Under [`DeliveryPolicy::Detached`] no waiter
    /// is registered and the reply, if any, is dropped as an orphan.
    pub async fn sync_file(&self, request: SyncRequest) -> Result<()> {
        let frame = encode_frame(&request)?;
        let timeout = self.inner.config.request_timeout;

        match self.inner.config.delivery {
            DeliveryPolicy::Detached => {
                tokio::time::timeout(timeout, self.inner.engine.send_untracked(frame))
                    .await
                    .map_err(|_| SyncwireError::Timeout(timeout))?
            }
            DeliveryPolicy::Acknowledged => {
                let header = request.header.clone();
                let started = Instant::now();
                let handle = self.submit_within(&header.request_id, frame, timeout).await?;
                let remaining = timeout.saturating_sub(started.elapsed());
                let filename = request.filename;

                tokio::spawn(async move {
                    let outcome = handle
                        .wait(remaining)
                        .await
                        .and_then(|reply| decode_reply::<SyncRequest>(&header, &reply))
                        .and_then(|response| response.header.ensure_success());
                    match outcome {
                        Ok(()) => debug!("Peer acknowledged {}", filename),
                        Err(e) if e.is_connection_level() => {
                            debug!("No acknowledgement for {}: {}", filename, e)
                        }
                        Err(e) => warn!("Sync of {} not acknowledged: {}", filename, e),
                    }
                });
                Ok(())
            }
        }
    }

    /// Start mirroring `config.root` through this client.
    pub fn start_sync(&self, config: SyncConfig) -> SyncHandle {
        SyncDriver::new(config, Arc::new(self.clone())).spawn()
    }

    /// Close the connection. Outstanding calls fail with `ConnectionClosed`.
    pub async fn close(&self) {
        self.inner.engine.shutdown().await;
    }

    /// Resolves once the connection is closed by either side.
    pub async fn closed(&self) {
        self.inner.engine.closed().await;
    }

    /// Identifier of this client session, for logs.
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.engine.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.engine.subscribe_state()
    }

    /// Why the connection ended, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.engine.close_reason()
    }

    /// Number of calls awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.engine.pending()
    }

    pub fn stats(&self) -> TableStats {
        self.inner.engine.stats()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

#[async_trait]
impl SyncSink for Client {
    async fn submit_sync(&self, request: SyncRequest) -> Result<()> {
        self.sync_file(request).await
    }
}

/// Decode a reply and check it answers `header`.
fn decode_reply<R: Request>(header: &RequestHeader, reply: &[u8]) -> Result<R::Response> {
    let response: R::Response =
        serde_json::from_slice(reply).map_err(|e| SyncwireError::Serialization {
            message: format!("Failed to decode {} reply: {}", header.request_type, e),
            source: Some(e),
        })?;

    let answer = response.header();
    if answer.kind() != Some(header.request_type) {
        return Err(SyncwireError::Protocol {
            expected: header.request_type.to_string(),
            actual: answer.request_type.clone(),
        });
    }
    if answer.request_id != header.request_id {
        return Err(SyncwireError::Protocol {
            expected: format!("request_id {}", header.request_id),
            actual: format!("request_id {}", answer.request_id),
        });
    }
    Ok(response)
}
