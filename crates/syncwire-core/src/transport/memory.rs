//! In-process connections.
//!
//! A [`MemoryDialer`] hands each successful dial to its [`MemoryListener`] as
//! a [`MemoryPeer`], which plays the remote side: it reads the frames the
//! client sent, pushes frames back, and can close with any [`CloseReason`].

use super::{CloseReason, Connection, Dialer, FrameSink, FrameStream, Inbound};
use crate::error::{Result, SyncwireError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::mpsc;

#[derive(Debug)]
enum PeerSignal {
    Frame(Vec<u8>),
    Close(CloseReason),
}

/// Dialer whose peers live in the same process.
#[derive(Debug)]
pub struct MemoryDialer {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    refuse_remaining: AtomicU32,
    attempts: AtomicU32,
    stall_writes: AtomicBool,
}

impl MemoryDialer {
    /// Create a dialer and the listener that receives its peers.
    pub fn new() -> (Self, MemoryListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let dialer = Self {
            accept_tx,
            refuse_remaining: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            stall_writes: AtomicBool::new(false),
        };
        (dialer, MemoryListener { accept_rx })
    }

    /// Refuse the next `count` dial attempts.
    pub fn refusing(self, count: u32) -> Self {
        self.refuse_remaining.store(count, Ordering::SeqCst);
        self
    }

    /// Make every write on connections from this dialer hang, like a peer
    /// that stopped reading.
    pub fn stalling_writes(self) -> Self {
        self.stall_writes.store(true, Ordering::SeqCst);
        self
    }

    /// Number of dial attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self) -> Result<Connection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .refuse_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SyncwireError::transport("connection refused"));
        }

        let (client_tx, peer_rx) = mpsc::unbounded_channel();
        let (peer_tx, client_rx) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            inbound: peer_rx,
            outbound: peer_tx,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| SyncwireError::transport("connection refused: no listener"))?;

        Ok(Connection {
            sink: Box::new(MemorySink {
                tx: Some(client_tx),
                stalled: self.stall_writes.load(Ordering::SeqCst),
            }),
            stream: Box::new(MemoryStream { rx: client_rx }),
        })
    }

    fn peer(&self) -> String {
        "memory".to_string()
    }
}

/// Receives the peer side of every successful dial.
#[derive(Debug)]
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryListener {
    /// Wait for the next connection. `None` once the dialer is dropped.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }
}

/// The remote end of an in-memory connection.
#[derive(Debug)]
pub struct MemoryPeer {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: mpsc::UnboundedSender<PeerSignal>,
}

impl MemoryPeer {
    /// Next frame sent by the client. `None` once the client closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    /// Push a frame to the client. Returns `false` if the client is gone.
    pub fn send(&self, frame: impl Into<Vec<u8>>) -> bool {
        self.outbound.send(PeerSignal::Frame(frame.into())).is_ok()
    }

    /// Close the connection with the given reason.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.outbound.send(PeerSignal::Close(reason));
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    stalled: bool,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        if self.stalled {
            std::future::pending::<()>().await;
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| SyncwireError::transport("connection already closed"))?;
        tx.send(frame)
            .map_err(|_| SyncwireError::transport("peer went away"))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx.take();
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<PeerSignal>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn next_frame(&mut self) -> Inbound {
        match self.rx.recv().await {
            Some(PeerSignal::Frame(frame)) => Inbound::Frame(frame),
            Some(PeerSignal::Close(reason)) => Inbound::Closed(reason),
            // Peer dropped without a close signal.
            None => Inbound::Closed(CloseReason::Abnormal),
        }
    }
}
