//! The upload queue manager.
//!
//! A single task owns all queue state and is fed through an mpsc
//! command channel; nothing else mutates it. Per-path debounce timers
//! live in an arena keyed by relative path - re-arming a path simply
//! overwrites its deadline, which is what cancels the previous timer.
//!
//! Per-path lifecycle:
//! `Pending (debounce running) -> Queued (FIFO, awaiting a slot) ->
//! Uploading -> Uploaded`, with `Failed` after retries are exhausted
//! and `Ignored` straight from intake when a pattern or policy matches.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::notice::{self, NoticeSender};
use crate::store::Settings;
use crate::watcher::{ChangeEvent, ChangeKind};

use super::{ConfigError, UploadConfig, UploadItem, Uploader};

// ============================================================================
// Constants
// ============================================================================

/// Attempts per item before it is marked permanently failed
const MAX_RETRY_COUNT: u32 = 3;

/// Pause before a failed item re-enters the queue.
/// Keeps a down server from producing a tight retry loop.
const RETRY_DELAY_SECS: u64 = 5;

/// Placeholder horizon for the debounce timer when nothing is pending
const IDLE_TIMER_SECS: u64 = 3600;

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Queued,
    Uploading,
    Uploaded,
    Failed,
    Ignored,
}

/// Per-file state transition, published to observers.
#[derive(Debug, Clone, Serialize)]
pub struct FileStatusEvent {
    pub relative_path: String,
    pub status: UploadStatus,
    pub error: Option<String>,
}

/// Aggregate view, recomputed on every state transition.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadProgress {
    pub total_queued: usize,
    pub total_uploaded: usize,
    pub total_failed: usize,
    pub current_uploading: Option<String>,
}

enum Command {
    Change(ChangeEvent),
    UpdateConfig(UploadConfig, oneshot::Sender<Result<(), ConfigError>>),
    ClearQueue,
    Shutdown,
}

/// Cheap-to-clone handle into the manager task.
#[derive(Clone)]
pub struct UploadHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    progress_rx: watch::Receiver<UploadProgress>,
}

impl UploadHandle {
    pub fn change(&self, event: ChangeEvent) {
        let _ = self.cmd_tx.send(Command::Change(event));
    }

    /// Validate and apply a new configuration. Rejection leaves the
    /// running configuration untouched; acceptance takes effect
    /// immediately without interrupting in-flight uploads.
    pub async fn update_config(&self, config: UploadConfig) -> Result<(), ConfigError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::UpdateConfig(config, tx))
            .map_err(|_| ConfigError::ManagerStopped)?;
        rx.await.map_err(|_| ConfigError::ManagerStopped)?
    }

    /// Drop all pending and queued items. In-flight uploads finish
    /// naturally.
    pub fn clear_queue(&self) {
        let _ = self.cmd_tx.send(Command::ClearQueue);
    }

    pub fn progress(&self) -> UploadProgress {
        self.progress_rx.borrow().clone()
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

// ============================================================================
// Manager
// ============================================================================

struct PendingEntry {
    deadline: Instant,
    item: UploadItem,
}

struct UploadOutcome {
    item: UploadItem,
    error: Option<String>,
}

pub struct UploadManager {
    config: UploadConfig,
    base_path: PathBuf,
    uploader: Arc<dyn Uploader>,
    settings: Settings,
    status_tx: mpsc::UnboundedSender<FileStatusEvent>,
    notices: NoticeSender,

    /// Debounce arena: relative path -> armed timer + latest item
    pending: HashMap<String, PendingEntry>,
    /// FIFO admission queue
    queued: VecDeque<UploadItem>,
    /// Relative paths currently in flight
    uploading: HashSet<String>,
    semaphore: Arc<Semaphore>,

    total_uploaded: usize,
    total_failed: usize,
    progress_tx: watch::Sender<UploadProgress>,

    done_tx: mpsc::UnboundedSender<UploadOutcome>,
}

impl UploadManager {
    /// Start the manager task. Status transitions go to `status_tx`,
    /// human-readable notices to `notices`, and the aggregate progress
    /// to the watch channel inside the returned handle.
    pub fn spawn(
        config: UploadConfig,
        base_path: PathBuf,
        uploader: Arc<dyn Uploader>,
        settings: Settings,
        status_tx: mpsc::UnboundedSender<FileStatusEvent>,
        notices: NoticeSender,
    ) -> (UploadHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = watch::channel(UploadProgress::default());
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let manager = Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_uploads)),
            config,
            base_path,
            uploader,
            settings,
            status_tx,
            notices,
            pending: HashMap::new(),
            queued: VecDeque::new(),
            uploading: HashSet::new(),
            total_uploaded: 0,
            total_failed: 0,
            progress_tx,
            done_tx,
        };

        let task = tokio::spawn(manager.run(cmd_rx, done_rx));
        (UploadHandle { cmd_tx, progress_rx }, task)
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut done_rx: mpsc::UnboundedReceiver<UploadOutcome>,
    ) {
        loop {
            let next_deadline = self.pending.values().map(|e| e.deadline).min();
            let timer_at =
                next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(IDLE_TIMER_SECS));

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Change(event)) => self.on_change_event(event),
                        Some(Command::UpdateConfig(config, reply)) => {
                            let _ = reply.send(self.update_config(config));
                        }
                        Some(Command::ClearQueue) => self.clear_queue(),
                        Some(Command::Shutdown) | None => break,
                    }
                }
                Some(outcome) = done_rx.recv() => self.on_upload_done(outcome),
                _ = tokio::time::sleep_until(timer_at), if next_deadline.is_some() => {
                    self.fire_due_timers();
                }
            }

            self.dispatch();
            self.publish_progress();
        }
        debug!("Upload manager stopped");
    }

    /// Intake for one filesystem change event.
    fn on_change_event(&mut self, event: ChangeEvent) {
        let relative = relative_path(&event.path, &self.base_path);

        match event.kind {
            ChangeKind::Removed => {
                // A deleted file has nothing left to upload.
                self.pending.remove(&relative);
                self.queued.retain(|i| i.relative_path != relative);
                return;
            }
            ChangeKind::Other => return,
            ChangeKind::Created | ChangeKind::Modified | ChangeKind::Initial => {}
        }

        if !self.config.enabled {
            self.emit_status(&relative, UploadStatus::Ignored, None);
            return;
        }

        if self.config.ignore_existing_files && event.kind == ChangeKind::Initial {
            debug!(path = %relative, "Ignoring pre-existing file");
            self.emit_status(&relative, UploadStatus::Ignored, None);
            return;
        }

        if self.config.should_ignore(&relative) {
            self.emit_status(&relative, UploadStatus::Ignored, None);
            return;
        }

        if event.path.is_dir() {
            self.emit_status(&relative, UploadStatus::Ignored, None);
            return;
        }

        // One live item per path: pull any queued copy back into the
        // arena and (re)arm the debounce timer. A fresh event resets
        // the retry budget.
        self.queued.retain(|i| i.relative_path != relative);
        let deadline = Instant::now() + Duration::from_millis(self.config.upload_delay_ms);
        let item = UploadItem {
            path: event.path,
            relative_path: relative.clone(),
            timestamp: event.timestamp,
            retry_count: 0,
        };
        self.pending.insert(relative.clone(), PendingEntry { deadline, item });
        self.emit_status(&relative, UploadStatus::Pending, None);
    }

    /// Move every arena entry whose debounce deadline has passed into
    /// the admission queue, oldest deadline first.
    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        let mut due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        due.sort_by_key(|path| self.pending[path].deadline);

        for path in due {
            if let Some(entry) = self.pending.remove(&path) {
                self.emit_status(&path, UploadStatus::Queued, None);
                self.queued.push_back(entry.item);
            }
        }
    }

    /// Fill free upload slots from the admission queue. A path already
    /// in flight stays queued until its outcome arrives.
    fn dispatch(&mut self) {
        loop {
            let Some(idx) = self
                .queued
                .iter()
                .position(|i| !self.uploading.contains(&i.relative_path))
            else {
                break;
            };

            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                break;
            };

            let Some(item) = self.queued.remove(idx) else {
                break;
            };
            self.uploading.insert(item.relative_path.clone());
            self.emit_status(&item.relative_path, UploadStatus::Uploading, None);
            info!(
                path = %item.relative_path,
                attempt = item.retry_count + 1,
                "Starting upload"
            );

            let uploader = self.uploader.clone();
            let done_tx = self.done_tx.clone();
            tokio::spawn(async move {
                let error = uploader
                    .upload(&item)
                    .await
                    .err()
                    .map(|e| format!("{:#}", e));
                let _ = done_tx.send(UploadOutcome { item, error });
                drop(permit);
            });
        }
    }

    fn on_upload_done(&mut self, outcome: UploadOutcome) {
        let mut item = outcome.item;
        self.uploading.remove(&item.relative_path);

        match outcome.error {
            None => {
                self.total_uploaded += 1;
                self.emit_status(&item.relative_path, UploadStatus::Uploaded, None);
                notice::post(
                    &self.notices,
                    &item.relative_path,
                    format!("Uploaded {}", item.relative_path),
                );
            }
            Some(error) => {
                // A change event that arrived while this attempt was in
                // flight already holds the path's single live item slot
                // (arena or queue); the stale retry must not fork a
                // second lineage for the same path.
                let superseded = self.pending.contains_key(&item.relative_path)
                    || self
                        .queued
                        .iter()
                        .any(|i| i.relative_path == item.relative_path);
                if superseded {
                    debug!(
                        path = %item.relative_path,
                        error = %error,
                        "Dropping failed attempt, a newer change supersedes it"
                    );
                    return;
                }

                item.retry_count += 1;
                if item.retry_count < MAX_RETRY_COUNT {
                    warn!(
                        path = %item.relative_path,
                        attempt = item.retry_count,
                        max = MAX_RETRY_COUNT,
                        error = %error,
                        "Upload failed, will retry"
                    );
                    // Re-arm through the arena so the retry waits out
                    // the delay; a newer change event simply replaces
                    // this entry.
                    let deadline = Instant::now() + Duration::from_secs(RETRY_DELAY_SECS);
                    self.emit_status(&item.relative_path, UploadStatus::Queued, None);
                    self.pending
                        .insert(item.relative_path.clone(), PendingEntry { deadline, item });
                } else {
                    warn!(
                        path = %item.relative_path,
                        attempts = item.retry_count,
                        error = %error,
                        "Upload permanently failed"
                    );
                    self.total_failed += 1;
                    self.emit_status(
                        &item.relative_path,
                        UploadStatus::Failed,
                        Some(error.clone()),
                    );
                    notice::post(
                        &self.notices,
                        &item.relative_path,
                        format!("Upload failed: {} ({})", item.relative_path, error),
                    );
                }
            }
        }
    }

    fn update_config(&mut self, config: UploadConfig) -> Result<(), ConfigError> {
        config.validate()?;

        if config.max_concurrent_uploads != self.config.max_concurrent_uploads {
            // In-flight tasks hold permits of the old semaphore and are
            // unaffected; new dispatches see the new ceiling at once.
            self.semaphore = Arc::new(Semaphore::new(config.max_concurrent_uploads));
        }

        if let Err(e) = self.settings.set_upload_config(&config) {
            warn!(error = %e, "Failed to persist upload config");
        }
        info!(
            max_concurrent = config.max_concurrent_uploads,
            delay_ms = config.upload_delay_ms,
            enabled = config.enabled,
            "Upload config updated"
        );
        self.config = config;
        Ok(())
    }

    fn clear_queue(&mut self) {
        let dropped = self.pending.len() + self.queued.len();
        self.pending.clear();
        self.queued.clear();
        info!(dropped, "Upload queue cleared");
    }

    fn emit_status(&self, relative_path: &str, status: UploadStatus, error: Option<String>) {
        let event = FileStatusEvent {
            relative_path: relative_path.to_string(),
            status,
            error,
        };
        if self.status_tx.send(event).is_err() {
            debug!("Status sink closed");
        }
    }

    fn publish_progress(&self) {
        self.progress_tx.send_replace(UploadProgress {
            total_queued: self.pending.len() + self.queued.len(),
            total_uploaded: self.total_uploaded,
            total_failed: self.total_failed,
            current_uploading: self.uploading.iter().next().cloned(),
        });
    }
}

/// Path relative to the watched root, `/`-separated for the wire.
fn relative_path(absolute: &Path, base: &Path) -> String {
    let stripped = absolute.strip_prefix(base).unwrap_or(absolute);
    let s = stripped.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.to_string()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Settings};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Records upload attempts; optionally fails or blocks them.
    struct FakeUploader {
        attempts: Mutex<Vec<String>>,
        fail: bool,
        gate: Option<Arc<Notify>>,
    }

    impl FakeUploader {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                attempts: Mutex::new(Vec::new()),
                fail: false,
                gate: None,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                attempts: Mutex::new(Vec::new()),
                fail: true,
                gate: None,
            })
        }

        fn gated(gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                attempts: Mutex::new(Vec::new()),
                fail: false,
                gate: Some(gate),
            })
        }

        fn gated_failing(gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                attempts: Mutex::new(Vec::new()),
                fail: true,
                gate: Some(gate),
            })
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Uploader for FakeUploader {
        async fn upload(&self, item: &UploadItem) -> Result<()> {
            self.attempts
                .lock()
                .unwrap()
                .push(item.relative_path.clone());
            if let Some(ref gate) = self.gate {
                gate.notified().await;
            }
            if self.fail {
                Err(anyhow::anyhow!("server unreachable"))
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        handle: UploadHandle,
        uploader: Arc<FakeUploader>,
        status_rx: mpsc::UnboundedReceiver<FileStatusEvent>,
        settings: Settings,
        _task: JoinHandle<()>,
    }

    fn harness_with(config: UploadConfig, uploader: Arc<FakeUploader>) -> Harness {
        let settings = Settings::new(Arc::new(MemoryStore::new()));
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (notice_tx, _notice_rx) = crate::notice::channel();
        let (handle, task) = UploadManager::spawn(
            config,
            PathBuf::from("/watched"),
            uploader.clone(),
            settings.clone(),
            status_tx,
            notice_tx,
        );
        Harness {
            handle,
            uploader,
            status_rx,
            settings,
            _task: task,
        }
    }

    fn harness() -> Harness {
        harness_with(UploadConfig::default(), FakeUploader::new())
    }

    fn change(path: &str) -> ChangeEvent {
        ChangeEvent {
            path: PathBuf::from("/watched").join(path),
            kind: ChangeKind::Modified,
            timestamp: 0,
        }
    }

    fn initial(path: &str) -> ChangeEvent {
        ChangeEvent {
            kind: ChangeKind::Initial,
            ..change(path)
        }
    }

    fn drain_statuses(rx: &mut mpsc::UnboundedReceiver<FileStatusEvent>) -> Vec<FileStatusEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_events_coalesce_into_one_upload() {
        let h = harness();

        for _ in 0..3 {
            h.handle.change(change("notes.txt"));
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        // Past the 2s debounce window measured from the last event.
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(h.uploader.attempts(), vec!["notes.txt"]);
        let progress = h.handle.progress();
        assert_eq!(progress.total_uploaded, 1);
        assert_eq!(progress.total_queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_paths_upload_independently() {
        let h = harness();

        h.handle.change(change("a.txt"));
        h.handle.change(change("b.txt"));
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let mut attempts = h.uploader.attempts();
        attempts.sort();
        assert_eq!(attempts, vec!["a.txt", "b.txt"]);
        assert_eq!(h.handle.progress().total_uploaded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_pattern_never_reaches_queue() {
        let mut h = harness();

        h.handle.change(change("notes.tmp"));
        tokio::time::sleep(Duration::from_millis(3000)).await;

        assert!(h.uploader.attempts().is_empty());
        let statuses = drain_statuses(&mut h.status_rx);
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].relative_path, "notes.tmp");
        assert_eq!(statuses[0].status, UploadStatus::Ignored);
        assert_eq!(h.handle.progress().total_queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignore_existing_files_policy() {
        let mut config = UploadConfig::default();
        config.ignore_existing_files = true;
        let mut h = harness_with(config, FakeUploader::new());

        h.handle.change(initial("old.txt"));
        h.handle.change(change("new.txt"));
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(h.uploader.attempts(), vec!["new.txt"]);
        let statuses = drain_statuses(&mut h.status_rx);
        assert!(statuses
            .iter()
            .any(|s| s.relative_path == "old.txt" && s.status == UploadStatus::Ignored));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_config_ignores_everything() {
        let mut config = UploadConfig::default();
        config.enabled = false;
        let h = harness_with(config, FakeUploader::new());

        h.handle.change(change("notes.txt"));
        tokio::time::sleep(Duration::from_millis(3000)).await;

        assert!(h.uploader.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_config_rejects_out_of_range_ceiling() {
        let h = harness();

        for bad in [0usize, 21] {
            let mut config = UploadConfig::default();
            config.max_concurrent_uploads = bad;
            assert_eq!(
                h.handle.update_config(config).await,
                Err(ConfigError::ConcurrencyOutOfRange(bad))
            );
        }

        // Nothing was persisted; the stored view is still the default.
        assert_eq!(
            h.settings.upload_config().max_concurrent_uploads,
            UploadConfig::default().max_concurrent_uploads
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_config_applies_and_persists() {
        let h = harness();

        let mut config = UploadConfig::default();
        config.max_concurrent_uploads = 2;
        config.upload_delay_ms = 100;
        assert_eq!(h.handle.update_config(config.clone()).await, Ok(()));
        assert_eq!(h.settings.upload_config(), config);

        // The shorter debounce takes effect for new events.
        h.handle.change(change("quick.txt"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.uploader.attempts(), vec!["quick.txt"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_queue_drops_waiting_not_in_flight() {
        let gate = Arc::new(Notify::new());
        let mut config = UploadConfig::default();
        config.max_concurrent_uploads = 1;
        config.upload_delay_ms = 100;
        let h = harness_with(config, FakeUploader::gated(gate.clone()));

        h.handle.change(change("first.txt"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        // first.txt is now in flight, held by the gate.
        assert_eq!(h.uploader.attempts(), vec!["first.txt"]);

        h.handle.change(change("second.txt"));
        h.handle.change(change("third.txt"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.handle.progress().total_queued >= 2);

        h.handle.clear_queue();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.handle.progress().total_queued, 0);

        // The in-flight upload still completes.
        gate.notify_waiters();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.handle.progress().total_uploaded, 1);
        assert_eq!(h.uploader.attempts(), vec!["first.txt"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_ceiling_limits_in_flight() {
        let gate = Arc::new(Notify::new());
        let mut config = UploadConfig::default();
        config.max_concurrent_uploads = 2;
        config.upload_delay_ms = 100;
        let h = harness_with(config, FakeUploader::gated(gate.clone()));

        h.handle.change(change("a.txt"));
        h.handle.change(change("b.txt"));
        h.handle.change(change("c.txt"));
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Only two slots; the third waits in the queue.
        assert_eq!(h.uploader.attempts().len(), 2);
        assert_eq!(h.handle.progress().total_queued, 1);

        gate.notify_waiters();
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.notify_waiters();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.uploader.attempts().len(), 3);
        assert_eq!(h.handle.progress().total_uploaded, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_permanent_failure() {
        let mut config = UploadConfig::default();
        config.upload_delay_ms = 100;
        let mut h = harness_with(config, FakeUploader::failing());

        h.handle.change(change("flaky.txt"));
        // Debounce + two retry delays with slack.
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(h.uploader.attempts().len(), MAX_RETRY_COUNT as usize);
        let progress = h.handle.progress();
        assert_eq!(progress.total_failed, 1);
        assert_eq!(progress.total_uploaded, 0);
        assert_eq!(progress.total_queued, 0);

        let statuses = drain_statuses(&mut h.status_rx);
        let last = statuses.last().unwrap();
        assert_eq!(last.status, UploadStatus::Failed);
        assert!(last.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_event_resets_retry_budget() {
        let mut config = UploadConfig::default();
        config.upload_delay_ms = 100;
        let h = harness_with(config, FakeUploader::failing());

        h.handle.change(change("doc.txt"));
        // Let the first attempt fail and the retry get re-armed.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.uploader.attempts().len(), 1);

        // A fresh edit replaces the retry entry with retry_count 0.
        h.handle.change(change("doc.txt"));
        tokio::time::sleep(Duration::from_secs(20)).await;

        // One attempt before the reset, a full budget after.
        assert_eq!(
            h.uploader.attempts().len(),
            1 + MAX_RETRY_COUNT as usize
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_event_mid_upload_supersedes_failed_attempt() {
        let gate = Arc::new(Notify::new());
        let mut config = UploadConfig::default();
        config.upload_delay_ms = 100;
        let h = harness_with(config, FakeUploader::gated_failing(gate.clone()));

        h.handle.change(change("doc.txt"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        // First attempt is in flight, held by the gate.
        assert_eq!(h.uploader.attempts().len(), 1);

        // A fresh edit lands mid-upload and debounces into the queue
        // behind the in-flight attempt.
        h.handle.change(change("doc.txt"));
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Release the held attempt, then each subsequent one. The
        // failed first attempt must not retry alongside the newer
        // item: one lineage, one retry budget, one terminal failure.
        for _ in 0..=MAX_RETRY_COUNT {
            gate.notify_waiters();
            tokio::time::sleep(Duration::from_secs(6)).await;
        }

        assert_eq!(
            h.uploader.attempts().len(),
            1 + MAX_RETRY_COUNT as usize
        );
        let progress = h.handle.progress();
        assert_eq!(progress.total_failed, 1);
        assert_eq!(progress.total_queued, 0);
    }

    #[test]
    fn test_relative_path_strips_base() {
        assert_eq!(
            relative_path(Path::new("/watched/sub/f.txt"), Path::new("/watched")),
            "sub/f.txt"
        );
        assert_eq!(
            relative_path(Path::new("/elsewhere/f.txt"), Path::new("/watched")),
            "/elsewhere/f.txt"
        );
    }
}
