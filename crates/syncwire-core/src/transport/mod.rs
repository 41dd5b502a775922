//! Connection capability and lifecycle.
//!
//! The rest of the crate only sees whole frames: a [`Dialer`] produces a
//! [`Connection`], which is split into a [`FrameSink`] (shared by all senders
//! behind the [`Transport`]) and a [`FrameStream`] (owned by the single
//! receive loop).
//!
//! Concrete connections:
//! - [`WsDialer`]: WebSocket text frames (`ws://`)
//! - [`TcpFrameDialer`]: 4-byte big-endian length prefix over TCP (`tcp://`)
//! - [`MemoryDialer`]: in-process peer for tests and embedding

pub mod framed;
mod link;
pub mod memory;
mod retry;
pub mod ws;

pub use framed::TcpFrameDialer;
pub use link::Transport;
pub use memory::{MemoryDialer, MemoryListener, MemoryPeer};
pub use retry::{retry_async, RetryConfig, RetryStats};
pub use ws::WsDialer;

use crate::error::{Result, SyncwireError};
use async_trait::async_trait;
use std::sync::Arc;

/// Lifecycle of the single physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why a connection ended.
///
/// The first four variants mirror WebSocket close codes 1000, 1001, 1005 and
/// 1006 and count as graceful termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    GoingAway,
    NoStatus,
    Abnormal,
    Other { code: u16, reason: String },
    TransportFailure(String),
    LocalShutdown,
}

impl CloseReason {
    /// Map a WebSocket close code.
    pub fn from_code(code: u16, reason: impl Into<String>) -> Self {
        match code {
            1000 => CloseReason::Normal,
            1001 => CloseReason::GoingAway,
            1005 => CloseReason::NoStatus,
            1006 => CloseReason::Abnormal,
            _ => CloseReason::Other {
                code,
                reason: reason.into(),
            },
        }
    }

    /// The WebSocket close code, when there is one.
    pub fn code(&self) -> Option<u16> {
        match self {
            CloseReason::Normal => Some(1000),
            CloseReason::GoingAway => Some(1001),
            CloseReason::NoStatus => Some(1005),
            CloseReason::Abnormal => Some(1006),
            CloseReason::Other { code, .. } => Some(*code),
            CloseReason::TransportFailure(_) | CloseReason::LocalShutdown => None,
        }
    }

    /// Whether the receive loop should treat this as a normal end of stream.
    pub fn is_graceful(&self) -> bool {
        matches!(
            self,
            CloseReason::Normal
                | CloseReason::GoingAway
                | CloseReason::NoStatus
                | CloseReason::Abnormal
                | CloseReason::LocalShutdown
        )
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Normal => write!(f, "normal closure (1000)"),
            CloseReason::GoingAway => write!(f, "going away (1001)"),
            CloseReason::NoStatus => write!(f, "no status received (1005)"),
            CloseReason::Abnormal => write!(f, "abnormal closure (1006)"),
            CloseReason::Other { code, reason } if reason.is_empty() => {
                write!(f, "close code {}", code)
            }
            CloseReason::Other { code, reason } => write!(f, "close code {}: {}", code, reason),
            CloseReason::TransportFailure(message) => write!(f, "transport failure: {}", message),
            CloseReason::LocalShutdown => write!(f, "closed locally"),
        }
    }
}

/// One event read from a connection.
#[derive(Debug)]
pub enum Inbound {
    /// A complete frame.
    Frame(Vec<u8>),
    /// The peer closed the connection or the stream ended.
    Closed(CloseReason),
    /// Reading failed; the connection is unusable.
    Failed(SyncwireError),
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one complete frame.
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()>;

    /// Send a close signal to the peer.
    async fn close(&mut self) -> Result<()>;
}

/// Read half of a connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Wait for the next frame or the end of the connection.
    async fn next_frame(&mut self) -> Inbound;
}

/// An established connection, split into halves.
pub struct Connection {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

/// Establishes connections to one fixed peer.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Make one connection attempt.
    async fn dial(&self) -> Result<Connection>;

    /// Human-readable peer address for logs and errors.
    fn peer(&self) -> String;
}

/// Pick a dialer by URL scheme: `ws`/`wss` or `tcp`.
pub fn dialer_for_url(peer_url: &str) -> Result<Arc<dyn Dialer>> {
    let url = url::Url::parse(peer_url).map_err(|e| SyncwireError::Config {
        message: format!("Invalid peer URL {}: {}", peer_url, e),
    })?;

    match url.scheme() {
        "ws" | "wss" => Ok(Arc::new(WsDialer::new(url.as_str()))),
        "tcp" => {
            let host = url.host_str().ok_or_else(|| SyncwireError::Config {
                message: format!("Peer URL {} has no host", peer_url),
            })?;
            let port = url.port().ok_or_else(|| SyncwireError::Config {
                message: format!("Peer URL {} has no port", peer_url),
            })?;
            Ok(Arc::new(TcpFrameDialer::new(format!("{}:{}", host, port))))
        }
        other => Err(SyncwireError::Config {
            message: format!("Unsupported peer URL scheme: {}", other),
        }),
    }
}
