//! Scan loop.

use super::{SyncPhase, SyncSink};
use crate::cancel::CancellationToken;
use crate::config::SyncConfig;
use crate::error::{Result, SyncwireError};
use crate::protocol::SyncRequest;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Outcome of one pass over the root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// 1-based cycle number.
    pub cycle: u64,
    pub files_seen: usize,
    pub files_sent: usize,
    pub files_skipped: usize,
    pub read_errors: usize,
    pub submit_errors: usize,
    /// The cycle was cut short by a stop request.
    pub interrupted: bool,
}

/// Mirrors one directory into a [`SyncSink`].
pub struct SyncDriver {
    config: SyncConfig,
    sink: Arc<dyn SyncSink>,
    cancel: CancellationToken,
    phase: watch::Sender<SyncPhase>,
    reports: watch::Sender<Option<CycleReport>>,
    digests: HashMap<PathBuf, blake3::Hash>,
    cycles: u64,
}

impl SyncDriver {
    pub fn new(config: SyncConfig, sink: Arc<dyn SyncSink>) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        let (reports, _) = watch::channel(None);
        Self {
            config,
            sink,
            cancel: CancellationToken::new(),
            phase,
            reports,
            digests: HashMap::new(),
            cycles: 0,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.phase.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        });
    }

    /// Walk the root once and submit every regular file.
    ///
    /// Unreadable files and failed submissions are logged and counted. A
    /// submission that fails because the connection is gone ends the cycle
    /// with that error.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        self.cycles += 1;
        let mut report = CycleReport {
            cycle: self.cycles,
            ..Default::default()
        };

        self.set_phase(SyncPhase::Scanning);
        let files = match scan(self.config.root.clone()).await {
            Ok(files) => files,
            Err(e) => {
                self.set_phase(SyncPhase::Idle);
                return Err(e);
            }
        };
        report.files_seen = files.len();
        debug!(
            "Cycle {}: {} file(s) under {}",
            report.cycle,
            files.len(),
            self.config.root.display()
        );

        let result = self.process_files(&files, &mut report).await;

        if self.config.skip_unchanged {
            let present: HashSet<&PathBuf> = files.iter().collect();
            self.digests.retain(|path, _| present.contains(path));
        }

        self.set_phase(SyncPhase::Idle);
        self.reports.send_replace(Some(report.clone()));
        result.map(|()| report)
    }

    async fn process_files(&mut self, files: &[PathBuf], report: &mut CycleReport) -> Result<()> {
        for path in files {
            if self.cancel.sleep(self.config.file_interval).await.is_err() {
                report.interrupted = true;
                break;
            }
            self.process_file(path, report).await?;
        }
        Ok(())
    }

    async fn process_file(&mut self, path: &Path, report: &mut CycleReport) -> Result<()> {
        self.set_phase(SyncPhase::Reading);
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Error reading file {}: {}", path.display(), e);
                report.read_errors += 1;
                return Ok(());
            }
        };

        let digest = if self.config.skip_unchanged {
            let digest = blake3::hash(&bytes);
            if self.digests.get(path) == Some(&digest) {
                report.files_skipped += 1;
                return Ok(());
            }
            Some(digest)
        } else {
            None
        };

        self.set_phase(SyncPhase::Encoding);
        let filename = wire_name(&self.config.root, path);
        let request = SyncRequest::new(filename.clone(), &bytes, self.config.directory.clone());

        self.set_phase(SyncPhase::Submitting);
        match self.sink.submit_sync(request).await {
            Ok(()) => {
                report.files_sent += 1;
                if let Some(digest) = digest {
                    self.digests.insert(path.to_path_buf(), digest);
                }
                info!("File {} updated ({} bytes)", filename, bytes.len());
                Ok(())
            }
            Err(e) if e.is_connection_level() => {
                report.submit_errors += 1;
                Err(e)
            }
            Err(e) => {
                report.submit_errors += 1;
                warn!("Failed to submit {}: {}", filename, e);
                Ok(())
            }
        }
    }

    /// Run cycles in a background task until stopped or the connection is
    /// lost.
    pub fn spawn(self) -> SyncHandle {
        let cancel = self.cancel.clone();
        let phase = self.phase.subscribe();
        let reports = self.reports.subscribe();
        let task = tokio::spawn(self.run());
        SyncHandle {
            cancel,
            phase,
            reports,
            task,
        }
    }

    async fn run(mut self) {
        info!(
            "Watching {} (scan every {:?}, {:?} per file)",
            self.config.root.display(),
            self.config.scan_interval,
            self.config.file_interval
        );

        while !self.cancel.is_cancelled() {
            match self.run_cycle().await {
                Ok(report) => debug!(
                    "Cycle {} done: {} sent, {} skipped, {} unreadable",
                    report.cycle, report.files_sent, report.files_skipped, report.read_errors
                ),
                Err(e) if e.is_connection_level() => {
                    warn!("Stopping sync of {}: {}", self.config.root.display(), e);
                    break;
                }
                Err(e) => warn!("Sync cycle over {} failed: {}", self.config.root.display(), e),
            }

            if self.cancel.sleep(self.config.scan_interval).await.is_err() {
                break;
            }
        }

        self.set_phase(SyncPhase::Stopped);
        info!("Stopped watching {}", self.config.root.display());
    }
}

/// Control over a spawned [`SyncDriver`].
#[derive(Debug)]
pub struct SyncHandle {
    cancel: CancellationToken,
    phase: watch::Receiver<SyncPhase>,
    reports: watch::Receiver<Option<CycleReport>>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Ask the driver to stop. Takes effect at the next pause.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.clone()
    }

    /// Report of the most recent finished cycle.
    pub fn last_report(&self) -> Option<CycleReport> {
        self.reports.borrow().clone()
    }

    pub fn subscribe_reports(&self) -> watch::Receiver<Option<CycleReport>> {
        self.reports.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the driver task to exit.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| SyncwireError::Other(format!("sync task failed: {}", e)))
    }
}

async fn scan(root: PathBuf) -> Result<Vec<PathBuf>> {
    tokio::task::spawn_blocking(move || list_files(&root))
        .await
        .map_err(|e| SyncwireError::Other(format!("scan task failed: {}", e)))?
}

fn list_files(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(SyncwireError::Io {
            message: "sync root is not a directory".to_string(),
            path: Some(root.to_path_buf()),
            source: None,
        });
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        match entry {
            Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
            Ok(_) => {}
            Err(e) => warn!("Skipping entry under {}: {}", root.display(), e),
        }
    }
    Ok(files)
}

/// Root-relative path with `/` separators.
fn wire_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CloseReason;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        requests: Mutex<Vec<SyncRequest>>,
        reject: Option<String>,
        disconnected: bool,
    }

    impl RecordingSink {
        fn filenames(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.filename.clone())
                .collect()
        }

        fn count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SyncSink for RecordingSink {
        async fn submit_sync(&self, request: SyncRequest) -> Result<()> {
            if self.disconnected {
                return Err(SyncwireError::ConnectionClosed {
                    reason: CloseReason::Abnormal,
                });
            }
            if self.reject.as_deref() == Some(request.filename.as_str()) {
                return Err(SyncwireError::Remote {
                    message: "rejected".into(),
                });
            }
            self.requests.lock().unwrap().push(request);
            Ok(())
        }
    }

    fn fast_config(root: &Path) -> SyncConfig {
        SyncConfig::new(root)
            .with_file_interval(Duration::ZERO)
            .with_scan_interval(Duration::from_millis(10))
    }

    fn driver(config: SyncConfig) -> (SyncDriver, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (SyncDriver::new(config, sink.clone()), sink)
    }

    #[tokio::test]
    async fn test_single_file_cycle() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), "x").unwrap();

        let (mut driver, sink) = driver(fast_config(temp.path()));
        let report = driver.run_cycle().await.unwrap();

        assert_eq!(report.cycle, 1);
        assert_eq!(report.files_seen, 1);
        assert_eq!(report.files_sent, 1);

        let requests = sink.requests.lock().unwrap();
        assert_eq!(requests[0].filename, "a.txt");
        assert_eq!(requests[0].contents, "eA==");
        assert_eq!(requests[0].decode_contents().unwrap(), b"x");
        assert_eq!(requests[0].directory, None);
    }

    #[tokio::test]
    async fn test_nested_files_and_directory_label() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("sub/deeper")).unwrap();
        std::fs::write(temp.path().join("top.txt"), "1").unwrap();
        std::fs::write(temp.path().join("sub/deeper/leaf.bin"), [0u8, 159, 146, 150]).unwrap();

        let config = fast_config(temp.path()).with_directory("mirror");
        let (mut driver, sink) = driver(config);
        let report = driver.run_cycle().await.unwrap();

        assert_eq!(report.files_seen, 2);
        let mut names = sink.filenames();
        names.sort();
        assert_eq!(names, vec!["sub/deeper/leaf.bin", "top.txt"]);

        let requests = sink.requests.lock().unwrap();
        assert!(requests
            .iter()
            .all(|r| r.directory.as_deref() == Some("mirror")));
        let leaf = requests
            .iter()
            .find(|r| r.filename.ends_with("leaf.bin"))
            .unwrap();
        assert_eq!(leaf.decode_contents().unwrap(), vec![0u8, 159, 146, 150]);
    }

    #[tokio::test]
    async fn test_every_cycle_resends_everything() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), "x").unwrap();

        let (mut driver, sink) = driver(fast_config(temp.path()));
        for _ in 0..3 {
            driver.run_cycle().await.unwrap();
        }

        assert_eq!(sink.filenames(), vec!["a.txt", "a.txt", "a.txt"]);
        // Fresh token per request.
        let requests = sink.requests.lock().unwrap();
        let tokens: HashSet<&str> = requests
            .iter()
            .map(|r| r.header.request_id.as_str())
            .collect();
        assert_eq!(tokens.len(), 3);
    }

    #[tokio::test]
    async fn test_skip_unchanged() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a.txt");
        std::fs::write(&file, "x").unwrap();

        let (mut driver, sink) = driver(fast_config(temp.path()).with_skip_unchanged(true));

        assert_eq!(driver.run_cycle().await.unwrap().files_sent, 1);
        let second = driver.run_cycle().await.unwrap();
        assert_eq!(second.files_sent, 0);
        assert_eq!(second.files_skipped, 1);

        std::fs::write(&file, "y").unwrap();
        assert_eq!(driver.run_cycle().await.unwrap().files_sent, 1);
        assert_eq!(sink.count(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_file_is_skipped() {
        let temp = TempDir::new().unwrap();
        let (mut driver, sink) = driver(fast_config(temp.path()));
        let mut report = CycleReport::default();

        driver
            .process_file(&temp.path().join("vanished.txt"), &mut report)
            .await
            .unwrap();

        assert_eq!(report.read_errors, 1);
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_submission_does_not_stop_cycle() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), "a").unwrap();
        std::fs::write(temp.path().join("b.txt"), "b").unwrap();

        let sink = Arc::new(RecordingSink {
            reject: Some("a.txt".into()),
            ..Default::default()
        });
        let mut driver = SyncDriver::new(fast_config(temp.path()), sink.clone());
        let report = driver.run_cycle().await.unwrap();

        assert_eq!(report.submit_errors, 1);
        assert_eq!(report.files_sent, 1);
        assert_eq!(sink.filenames(), vec!["b.txt"]);
    }

    #[tokio::test]
    async fn test_missing_root_is_io_error() {
        let temp = TempDir::new().unwrap();
        let (mut driver, _sink) = driver(fast_config(&temp.path().join("nope")));

        assert!(matches!(
            driver.run_cycle().await,
            Err(SyncwireError::Io { .. })
        ));
        assert_eq!(driver.phase(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_spawned_driver_repeats_until_stopped() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), "x").unwrap();

        let (driver, sink) = driver(fast_config(temp.path()));
        let handle = driver.spawn();

        let mut reports = handle.subscribe_reports();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                reports.changed().await.unwrap();
                if reports.borrow().as_ref().map(|r| r.cycle) >= Some(3) {
                    break;
                }
            }
        })
        .await
        .unwrap();

        handle.stop();
        let mut phase = handle.subscribe_phase();
        tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(*phase.borrow_and_update(), SyncPhase::Stopped);
        assert!(sink.count() >= 3);
        assert!(sink.filenames().iter().all(|name| name == "a.txt"));
    }

    #[tokio::test]
    async fn test_connection_loss_stops_driver() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), "x").unwrap();

        let sink = Arc::new(RecordingSink {
            disconnected: true,
            ..Default::default()
        });
        let handle = SyncDriver::new(fast_config(temp.path()), sink).spawn();

        tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_interrupts_file_pacing() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), "x").unwrap();

        // Default pacing waits five seconds before the first file.
        let (driver, sink) = driver(SyncConfig::new(temp.path()));
        let handle = driver.spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;

        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_wire_name() {
        let root = Path::new("/data/root");
        assert_eq!(wire_name(root, Path::new("/data/root/a.txt")), "a.txt");
        assert_eq!(wire_name(root, Path::new("/data/root/x/y/z.md")), "x/y/z.md");
    }
}
