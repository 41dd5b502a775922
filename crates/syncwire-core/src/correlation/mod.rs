//! Request/response correlation over one connection.
//!
//! The [`CorrelationEngine`] owns the [`Transport`], the [`CorrelationTable`]
//! and the task running the receive loop. Callers register a token, send
//! their frame and await the returned [`WaitHandle`]; the receive loop hands
//! each inbound frame to the waiter registered under its token.

mod demux;
mod table;

pub use table::{CorrelationTable, Delivery, DeliveryOutcome, TableStats, WaitHandle};

use crate::error::Result;
use crate::transport::{CloseReason, ConnectionState, Dialer, RetryConfig, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// One connection plus its outstanding exchanges.
pub struct CorrelationEngine {
    transport: Arc<Transport>,
    table: Arc<CorrelationTable>,
    receiver: JoinHandle<CloseReason>,
}

impl std::fmt::Debug for CorrelationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationEngine")
            .field("transport", &self.transport)
            .field("table", &self.table)
            .finish()
    }
}

impl CorrelationEngine {
    /// Connect and start the receive loop.
    ///
    /// Nothing is spawned unless the connection succeeds. Each frame write
    /// must finish within `write_timeout` or the connection is closed.
    pub async fn start(
        dialer: &dyn Dialer,
        retry: &RetryConfig,
        dial_timeout: Duration,
        write_timeout: Duration,
    ) -> Result<Self> {
        let transport =
            Arc::new(Transport::new(dialer.peer()).with_write_timeout(write_timeout));
        let stream = transport.connect(dialer, retry, dial_timeout).await?;

        let table = Arc::new(CorrelationTable::new());
        let receiver = tokio::spawn(demux::receive_loop(
            stream,
            Arc::clone(&table),
            Arc::clone(&transport),
        ));

        Ok(Self {
            transport,
            table,
            receiver,
        })
    }

    /// Register a waiter without sending anything.
    pub fn register(&self, token: impl Into<String>) -> Result<WaitHandle> {
        self.table.register(token)
    }

    /// Register `token`, then send `frame`.
    ///
    /// The waiter exists before the frame hits the wire, so a fast reply can
    /// never be missed. If the send fails the registration is released and
    /// the error returned. An oversized frame fails only this call.
    pub async fn submit(&self, token: impl Into<String>, frame: Vec<u8>) -> Result<WaitHandle> {
        let handle = self.table.register(token)?;
        self.send(frame).await?;
        Ok(handle)
    }

    /// Send a frame that expects no reply.
    pub async fn send_untracked(&self, frame: Vec<u8>) -> Result<()> {
        self.send(frame).await
    }

    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        let result = self.transport.send(frame).await;
        if let Err(e) = &result {
            if self.transport.state() == ConnectionState::Closed {
                self.receiver.abort();
                let abandoned = self
                    .table
                    .abandon_all(CloseReason::TransportFailure(e.to_string()));
                debug!("Send failed, abandoned {} exchange(s): {}", abandoned, e);
            }
        }
        result
    }

    /// Close the connection and fail everything outstanding.
    ///
    /// Waiters are failed before the close signal is sent, so a peer that
    /// stopped reading cannot hold them.
    pub async fn shutdown(&self) {
        info!("Closing connection to {}", self.transport.peer());
        self.transport.mark_closed();
        self.receiver.abort();
        self.table.abandon_all(CloseReason::LocalShutdown);
        self.transport.close(&CloseReason::LocalShutdown).await;
    }

    /// Resolves once the connection is closed, by either side.
    pub async fn closed(&self) {
        let mut states = self.transport.subscribe();
        let _ = states
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.subscribe()
    }

    /// Number of outstanding exchanges.
    pub fn pending(&self) -> usize {
        self.table.len()
    }

    pub fn stats(&self) -> TableStats {
        self.table.stats()
    }

    /// Why the connection ended, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.table.closed_reason()
    }

    pub fn peer(&self) -> &str {
        self.transport.peer()
    }
}

impl Drop for CorrelationEngine {
    fn drop(&mut self) {
        self.receiver.abort();
        self.table.abandon_all(CloseReason::LocalShutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncwireError;
    use crate::transport::{MemoryDialer, MemoryListener, MemoryPeer};

    fn one_shot() -> RetryConfig {
        RetryConfig::new().with_max_attempts(1)
    }

    async fn start() -> (CorrelationEngine, MemoryPeer, MemoryListener) {
        let (dialer, mut listener) = MemoryDialer::new();
        let engine = CorrelationEngine::start(
            &dialer,
            &one_shot(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let peer = listener.accept().await.unwrap();
        (engine, peer, listener)
    }

    #[tokio::test]
    async fn test_submit_and_reply() {
        let (engine, mut peer, _listener) = start().await;

        let handle = engine
            .submit("t1", br#"{"request_id":"t1"}"#.to_vec())
            .await
            .unwrap();
        assert_eq!(engine.pending(), 1);

        let frame = peer.recv().await.unwrap();
        peer.send(frame);

        let reply = handle.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, br#"{"request_id":"t1"}"#);
        assert_eq!(engine.pending(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_abandons_everything() {
        let (engine, peer, _listener) = start().await;
        let waiting = engine.register("waiting").unwrap();
        drop(peer);

        let result = engine.submit("doomed", b"{}".to_vec()).await;
        // Either the write fails, or the receive loop already saw the close.
        assert!(matches!(
            result,
            Err(SyncwireError::Transport { .. }) | Err(SyncwireError::ConnectionClosed { .. })
        ));
        assert!(matches!(
            waiting.wait(Duration::from_secs(1)).await,
            Err(SyncwireError::ConnectionClosed { .. })
        ));
        assert_eq!(engine.pending(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiters_and_blocks_new_ones() {
        let (engine, mut peer, _listener) = start().await;
        let handle = engine.submit("t1", b"{}".to_vec()).await.unwrap();

        engine.shutdown().await;
        engine.closed().await;

        assert_eq!(engine.state(), ConnectionState::Closed);
        assert!(matches!(
            handle.wait(Duration::from_secs(1)).await,
            Err(SyncwireError::ConnectionClosed {
                reason: CloseReason::LocalShutdown
            })
        ));
        assert!(engine.register("t2").is_err());
        assert!(engine.send_untracked(b"{}".to_vec()).await.is_err());

        // The peer saw our frame, then the end of the stream.
        assert!(peer.recv().await.is_some());
        assert_eq!(peer.recv().await, None);
    }

    #[tokio::test]
    async fn test_peer_close_is_observable() {
        let (engine, peer, _listener) = start().await;
        peer.close(CloseReason::GoingAway);

        tokio::time::timeout(Duration::from_secs(1), engine.closed())
            .await
            .unwrap();
        // The receive loop abandons after marking the transport closed.
        tokio::time::timeout(Duration::from_secs(1), async {
            while engine.close_reason().is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(engine.close_reason(), Some(CloseReason::GoingAway));
    }

    #[tokio::test]
    async fn test_connect_failure_spawns_nothing() {
        let (dialer, _listener) = MemoryDialer::new();
        let dialer = dialer.refusing(u32::MAX);
        let result = CorrelationEngine::start(
            &dialer,
            &RetryConfig::new()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(1))
                .with_jitter(false),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await;

        assert!(matches!(
            result,
            Err(SyncwireError::ConnectionFailed { attempts: 3, .. })
        ));
        assert_eq!(dialer.attempts(), 3);
    }

    #[tokio::test]
    async fn test_oversized_submit_fails_only_that_call() {
        let (engine, mut peer, _listener) = start().await;
        let waiting = engine.submit("kept", b"{}".to_vec()).await.unwrap();
        assert_eq!(peer.recv().await, Some(b"{}".to_vec()));

        let result = engine
            .submit(
                "huge",
                vec![b' '; crate::config::ProtocolConfig::MAX_FRAME_SIZE + 1],
            )
            .await;
        assert!(matches!(result, Err(SyncwireError::Validation { .. })));
        assert_eq!(engine.state(), ConnectionState::Connected);
        assert_eq!(engine.pending(), 1);
        assert!(engine.close_reason().is_none());

        peer.send(br#"{"request_id":"kept"}"#.to_vec());
        assert!(waiting.wait(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_with_stalled_writer_fails_waiters_promptly() {
        let (dialer, _listener) = MemoryDialer::new();
        let dialer = dialer.stalling_writes();
        let engine = Arc::new(
            CorrelationEngine::start(
                &dialer,
                &one_shot(),
                Duration::from_secs(1),
                Duration::from_secs(60),
            )
            .await
            .unwrap(),
        );

        let waiting = engine.register("waiting").unwrap();
        let stuck = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.submit("stuck", b"{}".to_vec()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!stuck.is_finished());

        tokio::time::timeout(Duration::from_secs(5), engine.shutdown())
            .await
            .expect("shutdown should not wait on the stalled writer");
        assert!(matches!(
            waiting.wait(Duration::from_millis(100)).await,
            Err(SyncwireError::ConnectionClosed {
                reason: CloseReason::LocalShutdown
            })
        ));
        assert_eq!(engine.state(), ConnectionState::Closed);
        stuck.abort();
    }

    #[tokio::test]
    async fn test_write_deadline_abandons_everything() {
        let (dialer, _listener) = MemoryDialer::new();
        let dialer = dialer.stalling_writes();
        let engine = CorrelationEngine::start(
            &dialer,
            &one_shot(),
            Duration::from_secs(1),
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        let waiting = engine.register("waiting").unwrap();
        let result = engine.submit("stuck", b"{}".to_vec()).await;
        assert!(matches!(result, Err(SyncwireError::Transport { .. })));
        assert!(matches!(
            waiting.wait(Duration::from_secs(1)).await,
            Err(SyncwireError::ConnectionClosed {
                reason: CloseReason::TransportFailure(_)
            })
        ));
        assert_eq!(engine.pending(), 0);
    }
}
