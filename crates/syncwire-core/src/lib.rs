//! Syncwire - correlated request/response over one persistent connection.
//!
//! Many concurrent callers share a single full-duplex connection. Each
//! request carries a fresh token; one receive loop reads every inbound frame
//! and hands it to the caller waiting on that token, so replies may arrive
//! in any order. On top of that sits a directory sync driver that
//! periodically pushes every file under a root to the peer.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use syncwire::{Client, ClientConfig, SyncConfig};
//!
//! #[tokio::main]
//! async fn main() -> syncwire::Result<()> {
//!     let client = Client::connect(ClientConfig::new()).await?;
//!
//!     // One round trip
//!     let reply = client.echo("hello").await?;
//!     println!("Peer said {}", reply.value);
//!
//!     // Mirror a directory until stopped
//!     let sync = client.start_sync(
//!         SyncConfig::new("./data").with_scan_interval(Duration::from_secs(1)),
//!     );
//!     tokio::time::sleep(Duration::from_secs(30)).await;
//!     sync.stop();
//!     sync.join().await?;
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod client;
pub mod config;
pub mod correlation;
pub mod error;
pub mod protocol;
pub mod sync;
pub mod transport;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use client::Client;
pub use config::{ClientConfig, DeliveryPolicy, ProtocolConfig, SyncConfig, SyncDefaults};
pub use correlation::{CorrelationEngine, TableStats, WaitHandle};
pub use error::{Result, SyncwireError};
pub use protocol::{
    EchoRequest, EchoResponse, Reply, Request, RequestHeader, RequestKind, ResponseHeader,
    SyncRequest, SyncResponse,
};
pub use sync::{CycleReport, SyncDriver, SyncHandle, SyncPhase, SyncSink};
pub use transport::{
    dialer_for_url, CloseReason, ConnectionState, Dialer, MemoryDialer, RetryConfig, TcpFrameDialer,
    WsDialer,
};
