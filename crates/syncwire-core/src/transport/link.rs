//! The single physical connection to the peer.
//!
//! `Transport` owns the connection state. The write half lives in a writer
//! task fed through a bounded queue, so frames are never interleaved on the
//! wire and a caller that gives up mid-write cannot leave half a frame
//! behind. Every write has a deadline; a write that misses it closes the
//! connection. The read half is handed back from [`Transport::connect`] to
//! whoever runs the receive loop.

use super::{retry_async, CloseReason, ConnectionState, Dialer, FrameSink, FrameStream, RetryConfig};
use crate::config::ProtocolConfig;
use crate::error::{Result, SyncwireError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

enum WriteCommand {
    Frame {
        frame: Vec<u8>,
        done: oneshot::Sender<Result<()>>,
    },
    Close {
        reason: CloseReason,
        done: oneshot::Sender<()>,
    },
}

/// Owner of one connection's lifecycle and write queue.
pub struct Transport {
    peer: String,
    state: Arc<watch::Sender<ConnectionState>>,
    commands: Mutex<Option<mpsc::Sender<WriteCommand>>>,
    write_timeout: Duration,
    close_timeout: Duration,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("write_timeout", &self.write_timeout)
            .finish()
    }
}

impl Transport {
    /// Create a transport for `peer` in the `Disconnected` state.
    pub fn new(peer: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            peer: peer.into(),
            state: Arc::new(state),
            commands: Mutex::new(None),
            write_timeout: ProtocolConfig::WRITE_TIMEOUT,
            close_timeout: ProtocolConfig::CLOSE_TIMEOUT,
        }
    }

    /// Set the deadline for writing one frame.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Dial the peer with bounded retries.
    ///
    /// On success the transport is `Connected`, the writer task is running
    /// and the read half is returned for the receive loop. When every
    /// attempt fails the transport goes back to `Disconnected` and
    /// `ConnectionFailed` is returned.
    pub async fn connect(
        &self,
        dialer: &dyn Dialer,
        retry: &RetryConfig,
        dial_timeout: Duration,
    ) -> Result<Box<dyn FrameStream>> {
        if self.state() != ConnectionState::Disconnected {
            return Err(SyncwireError::transport(format!(
                "cannot connect while {}",
                self.state()
            )));
        }
        self.state.send_replace(ConnectionState::Connecting);

        let peer = self.peer.clone();
        let (result, stats) = retry_async(
            retry,
            |attempt| {
                let peer = peer.clone();
                async move {
                    info!("Connection attempt {} to {}", attempt, peer);
                    match tokio::time::timeout(dial_timeout, dialer.dial()).await {
                        Ok(result) => result,
                        Err(_) => Err(SyncwireError::transport(format!(
                            "dial timed out after {:?}",
                            dial_timeout
                        ))),
                    }
                }
            },
            |e: &SyncwireError| !matches!(e, SyncwireError::Config { .. }),
        )
        .await;

        match result {
            Ok(connection) => {
                let (commands, queue) = mpsc::channel(ProtocolConfig::WRITE_QUEUE_DEPTH);
                let writer = Writer {
                    peer: self.peer.clone(),
                    sink: connection.sink,
                    state: Arc::clone(&self.state),
                    write_timeout: self.write_timeout,
                };
                tokio::spawn(writer.run(queue));

                *self.lock_commands() = Some(commands);
                self.state.send_replace(ConnectionState::Connected);
                info!(
                    "Connected to {} after {} attempt(s)",
                    self.peer, stats.attempts
                );
                Ok(connection.stream)
            }
            Err(SyncwireError::Config { message }) => {
                self.state.send_replace(ConnectionState::Disconnected);
                Err(SyncwireError::Config { message })
            }
            Err(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                warn!(
                    "Giving up on {} after {} attempts: {}",
                    self.peer, stats.attempts, e
                );
                Err(SyncwireError::ConnectionFailed {
                    peer: self.peer.clone(),
                    attempts: stats.attempts,
                    last_error: stats.last_error.unwrap_or_else(|| e.to_string()),
                })
            }
        }
    }

    /// Write one complete frame.
    ///
    /// A frame over [`ProtocolConfig::MAX_FRAME_SIZE`] fails with
    /// `Validation` and the connection stays up. Otherwise fails with
    /// `Transport` unless the connection is `Connected`. A write failure or
    /// a missed write deadline closes the transport; the caller is
    /// responsible for abandoning outstanding exchanges.
    ///
    /// Dropping the returned future never truncates a frame: once queued,
    /// the writer task finishes it.
    pub async fn send(&self, frame: Vec<u8>) -> Result<()> {
        if frame.len() > ProtocolConfig::MAX_FRAME_SIZE {
            return Err(SyncwireError::frame_too_large(frame.len()));
        }

        let commands = self.commands()?;
        let (done, written) = oneshot::channel();
        commands
            .send(WriteCommand::Frame { frame, done })
            .await
            .map_err(|_| self.writer_stopped())?;
        written.await.unwrap_or_else(|_| Err(self.writer_stopped()))
    }

    /// Transition to `Closed`. Returns `true` if this call made the change.
    pub fn mark_closed(&self) -> bool {
        mark_closed(&self.state)
    }

    /// Close the connection from our side.
    ///
    /// The state flips to `Closed` immediately. The close signal queues
    /// behind frames already accepted by the writer; this waits at most
    /// [`ProtocolConfig::CLOSE_TIMEOUT`] for it to go out.
    pub async fn close(&self, reason: &CloseReason) {
        self.mark_closed();
        let commands = self.lock_commands().take();
        let Some(commands) = commands else {
            return;
        };

        let (done, sent) = oneshot::channel();
        let command = WriteCommand::Close {
            reason: reason.clone(),
            done,
        };
        let signal = async move {
            if commands.send(command).await.is_ok() {
                let _ = sent.await;
            }
        };
        if tokio::time::timeout(self.close_timeout, signal).await.is_err() {
            debug!(
                "Close signal to {} not sent within {:?}",
                self.peer, self.close_timeout
            );
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The peer this transport talks to.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    fn commands(&self) -> Result<mpsc::Sender<WriteCommand>> {
        let state = self.state();
        match (state, self.lock_commands().as_ref()) {
            (ConnectionState::Connected, Some(commands)) => Ok(commands.clone()),
            _ => Err(SyncwireError::transport(format!(
                "cannot send while {}",
                state
            ))),
        }
    }

    fn lock_commands(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<WriteCommand>>> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writer_stopped(&self) -> SyncwireError {
        SyncwireError::transport(format!("writer for {} stopped", self.peer))
    }
}

fn mark_closed(state: &watch::Sender<ConnectionState>) -> bool {
    state.send_if_modified(|state| {
        if *state == ConnectionState::Closed {
            false
        } else {
            *state = ConnectionState::Closed;
            true
        }
    })
}

/// Sole owner of the write half.
struct Writer {
    peer: String,
    sink: Box<dyn FrameSink>,
    state: Arc<watch::Sender<ConnectionState>>,
    write_timeout: Duration,
}

impl Writer {
    async fn run(mut self, mut queue: mpsc::Receiver<WriteCommand>) {
        while let Some(command) = queue.recv().await {
            match command {
                WriteCommand::Frame { frame, done } => {
                    let size = frame.len();
                    match self.write(frame).await {
                        Ok(()) => {
                            trace!("Wrote {} bytes to {}", size, self.peer);
                            let _ = done.send(Ok(()));
                        }
                        Err(e @ SyncwireError::Validation { .. }) => {
                            let _ = done.send(Err(e));
                        }
                        Err(e) => {
                            warn!("Write to {} failed: {}", self.peer, e);
                            mark_closed(&self.state);
                            let _ = done.send(Err(e));
                            return;
                        }
                    }
                }
                WriteCommand::Close { reason, done } => {
                    self.close(&reason).await;
                    let _ = done.send(());
                    return;
                }
            }
        }

        // Every handle is gone.
        self.close(&CloseReason::LocalShutdown).await;
    }

    async fn write(&mut self, frame: Vec<u8>) -> Result<()> {
        match tokio::time::timeout(self.write_timeout, self.sink.send_frame(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e @ (SyncwireError::Transport { .. } | SyncwireError::Validation { .. }))) => {
                Err(e)
            }
            Ok(Err(other)) => Err(SyncwireError::transport(other)),
            Err(_) => Err(SyncwireError::transport(format!(
                "write did not complete within {:?}",
                self.write_timeout
            ))),
        }
    }

    async fn close(&mut self, reason: &CloseReason) {
        match tokio::time::timeout(self.write_timeout, self.sink.close()).await {
            Ok(Ok(())) => debug!("Sent close to {} ({})", self.peer, reason),
            Ok(Err(e)) => debug!("Close signal to {} failed ({}): {}", self.peer, reason, e),
            Err(_) => debug!("Close signal to {} timed out ({})", self.peer, reason),
        }
    }
}
