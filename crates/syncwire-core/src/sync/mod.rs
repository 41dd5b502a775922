//! Periodic directory mirroring.
//!
//! A [`SyncDriver`] walks its root, reads every regular file and hands one
//! [`SyncRequest`] per file to a [`SyncSink`], then sleeps and walks again.
//! The scan never waits on the peer's acknowledgement; that is the sink's
//! business.

mod driver;

pub use driver::{CycleReport, SyncDriver, SyncHandle};

use crate::error::Result;
use crate::protocol::SyncRequest;
use async_trait::async_trait;

/// Where the driver's requests go.
#[async_trait]
pub trait SyncSink: Send + Sync {
    /// Submit one file. Returning `Ok` means the request was handed off, not
    /// that the peer accepted it.
    async fn submit_sync(&self, request: SyncRequest) -> Result<()>;
}

/// What the driver is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Scanning,
    Reading,
    Encoding,
    Submitting,
    Stopped,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Scanning => "scanning",
            SyncPhase::Reading => "reading",
            SyncPhase::Encoding => "encoding",
            SyncPhase::Submitting => "submitting",
            SyncPhase::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
