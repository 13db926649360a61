//! Background poller that reloads the selector source when it changes on disk.
//!
//! Modification time and size are compared on every tick, which also catches
//! editors that replace the file through a rename.
use crate::repository::SelectorStore;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize)]
pub struct HotReloadStatus {
    pub running: bool,
    pub poll_interval_ms: u64,
    pub reload_count: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct WatchStats {
    reloads: AtomicU64,
    last_error: Mutex<Option<String>>,
}

struct WatchTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct HotReloadSupervisor {
    store: Arc<dyn SelectorStore>,
    interval: Duration,
    task: Mutex<Option<WatchTask>>,
    stats: Arc<WatchStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

impl Fingerprint {
    fn of(meta: std::fs::Metadata) -> Self {
        Self {
            modified: meta.modified().ok(),
            len: meta.len(),
        }
    }
}

async fn fingerprint(path: &Path) -> Option<Fingerprint> {
    tokio::fs::metadata(path).await.ok().map(Fingerprint::of)
}

impl HotReloadSupervisor {
    pub fn new(store: Arc<dyn SelectorStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            task: Mutex::new(None),
            stats: Arc::new(WatchStats::default()),
        }
    }

    /// Spawn the polling loop. Returns false if it was already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> bool {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return false;
        }

        // baseline before spawning: edits made right after start() must count as changes
        let baseline = std::fs::metadata(self.store.source_path())
            .ok()
            .map(Fingerprint::of);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watch_loop(
            self.store.clone(),
            self.interval,
            baseline,
            cancel.clone(),
            self.stats.clone(),
        ));
        *task = Some(WatchTask { cancel, handle });
        tracing::info!(
            source = %self.store.source_path().display(),
            interval_ms = self.interval.as_millis() as u64,
            "hot_reload.started"
        );
        true
    }

    /// Cancel the loop and wait for it to exit. Returns false if it was not running.
    pub async fn stop(&self) -> bool {
        let Some(task) = self.task.lock().take() else {
            return false;
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            tracing::warn!(error = %e, "hot_reload.join_failed");
        }
        tracing::info!("hot_reload.stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Reloads triggered by detected changes, accepted or not.
    pub fn reload_count(&self) -> u64 {
        self.stats.reloads.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> HotReloadStatus {
        HotReloadStatus {
            running: self.is_running(),
            poll_interval_ms: self.interval.as_millis() as u64,
            reload_count: self.reload_count(),
            last_error: self.stats.last_error.lock().clone(),
        }
    }
}

async fn watch_loop(
    store: Arc<dyn SelectorStore>,
    interval: Duration,
    mut last: Option<Fingerprint>,
    cancel: CancellationToken,
    stats: Arc<WatchStats>,
) {
    let path = store.source_path().to_path_buf();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let current = fingerprint(&path).await;
        if current == last {
            continue;
        }
        last = current;

        stats.reloads.fetch_add(1, Ordering::Relaxed);
        match store.reload().await {
            Ok(outcome) => {
                *stats.last_error.lock() = None;
                tracing::info!(source = %path.display(), ?outcome, "hot_reload.reloaded");
            }
            Err(e) => {
                *stats.last_error.lock() = Some(e.to_string());
                tracing::warn!(source = %path.display(), error = %e, "hot_reload.reload_failed");
            }
        }
    }
}
