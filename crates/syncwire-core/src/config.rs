//! Centralized configuration for syncwire.
//!
//! Constants live on `ProtocolConfig`; runtime knobs live on the builder-style
//! `ClientConfig` and `SyncConfig`. Defaults: local peer on port 5555, 101
//! dial attempts, 1s between scans, 5s before each file, full resync every
//! cycle.

use std::path::PathBuf;
use std::time::Duration;

use crate::transport::RetryConfig;

/// Wire and connection constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    pub const DEFAULT_PEER_URL: &'static str = "ws://localhost:5555/";
    pub const MAX_CONNECT_ATTEMPTS: u32 = 101;
    pub const CONNECT_BASE_DELAY: Duration = Duration::from_millis(100);
    pub const CONNECT_MAX_DELAY: Duration = Duration::from_secs(5);
    pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    /// A single frame write that takes longer than this closes the connection.
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
    /// How long a local close waits for the close signal to go out.
    pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
    /// Frames queued for the writer before senders wait.
    pub const WRITE_QUEUE_DEPTH: usize = 64;
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
}

/// Sync driver constants.
pub struct SyncDefaults;

impl SyncDefaults {
    pub const SCAN_INTERVAL: Duration = Duration::from_secs(1);
    pub const FILE_INTERVAL: Duration = Duration::from_secs(5);
}

/// How sync submissions treat the peer's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryPolicy {
    /// Register a waiter and consume the reply in a detached task, bounded by
    /// the request timeout. The scan never waits on it.
    #[default]
    Acknowledged,
    /// Send without registering a waiter. Replies arrive as orphans.
    Detached,
}

/// Configuration for a `Client`.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Peer address (`ws://`, `tcp://`).
    pub peer_url: String,
    /// Dial retry policy.
    pub retry: RetryConfig,
    /// Per-attempt dial timeout.
    pub dial_timeout: Duration,
    /// Default bound on one call, from submit to reply.
    pub request_timeout: Duration,
    /// Deadline for writing one frame to the wire.
    pub write_timeout: Duration,
    /// Reply handling for sync submissions.
    pub delivery: DeliveryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            peer_url: ProtocolConfig::DEFAULT_PEER_URL.to_string(),
            retry: RetryConfig::new()
                .with_max_attempts(ProtocolConfig::MAX_CONNECT_ATTEMPTS)
                .with_base_delay(ProtocolConfig::CONNECT_BASE_DELAY)
                .with_max_delay(ProtocolConfig::CONNECT_MAX_DELAY),
            dial_timeout: ProtocolConfig::DIAL_TIMEOUT,
            request_timeout: ProtocolConfig::REQUEST_TIMEOUT,
            write_timeout: ProtocolConfig::WRITE_TIMEOUT,
            delivery: DeliveryPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the peer address.
    pub fn with_peer_url(mut self, url: impl Into<String>) -> Self {
        self.peer_url = url.into();
        self
    }

    /// Set the dial retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-attempt dial timeout.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the reply timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the per-frame write deadline.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the reply handling policy for sync submissions.
    pub fn with_delivery(mut self, delivery: DeliveryPolicy) -> Self {
        self.delivery = delivery;
        self
    }
}

/// Configuration for the sync driver.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Local directory to mirror.
    pub root: PathBuf,
    /// Optional remote directory label sent with every file.
    pub directory: Option<String>,
    /// Pause between the end of one scan and the start of the next.
    pub scan_interval: Duration,
    /// Pause before each file is read.
    pub file_interval: Duration,
    /// Skip files whose content digest matches the last submission.
    ///
    /// Off by default: every file is resent every cycle.
    pub skip_unchanged: bool,
}

impl SyncConfig {
    /// Create a config for the given root with default pacing.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            directory: None,
            scan_interval: SyncDefaults::SCAN_INTERVAL,
            file_interval: SyncDefaults::FILE_INTERVAL,
            skip_unchanged: false,
        }
    }

    /// Set the remote directory label.
    pub fn with_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Set the pause between scans.
    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Set the pause before each file.
    pub fn with_file_interval(mut self, interval: Duration) -> Self {
        self.file_interval = interval;
        self
    }

    /// Enable or disable skipping unchanged files.
    pub fn with_skip_unchanged(mut self, enable: bool) -> Self {
        self.skip_unchanged = enable;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults_target_local_peer() {
        let config = ClientConfig::default();
        assert_eq!(config.peer_url, "ws://localhost:5555/");
        assert_eq!(config.retry.max_attempts, 101);
        assert_eq!(config.delivery, DeliveryPolicy::Acknowledged);
    }

    #[test]
    fn test_sync_defaults_resend_everything() {
        let config = SyncConfig::new("/tmp/watched");
        assert!(!config.skip_unchanged);
        assert!(config.directory.is_none());
        assert_eq!(config.scan_interval, Duration::from_secs(1));
        assert_eq!(config.file_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(ProtocolConfig::REQUEST_TIMEOUT > Duration::ZERO);
        assert!(ProtocolConfig::WRITE_TIMEOUT > ProtocolConfig::CLOSE_TIMEOUT);
        assert!(ProtocolConfig::CONNECT_MAX_DELAY >= ProtocolConfig::CONNECT_BASE_DELAY);
    }
}
