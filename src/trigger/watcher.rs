//! Data file watcher.
//!
//! Watches the raw data file and emits an event once a change has settled
//! (size stable for the stability delay) and the content hash differs from
//! the last one seen.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors that can occur with the watcher
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Watched file has no parent directory: {0}")]
    NoParent(PathBuf),

    #[error("Watch directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the watcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Data file to watch
    pub path: PathBuf,

    /// How long the file must be stable before it counts as changed (seconds)
    #[serde(default = "default_stability_delay")]
    pub stability_delay_secs: u64,
}

fn default_stability_delay() -> u64 {
    5
}

impl WatcherConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stability_delay_secs: default_stability_delay(),
        }
    }

    /// Directory holding the watched file
    fn watch_dir(&self) -> Result<PathBuf, WatcherError> {
        let parent = match self.path.parent() {
            Some(p) if p.as_os_str().is_empty() => PathBuf::from("."),
            Some(p) => p.to_path_buf(),
            None => return Err(WatcherError::NoParent(self.path.clone())),
        };
        if !parent.exists() {
            return Err(WatcherError::DirectoryNotFound(parent));
        }
        Ok(parent)
    }
}

/// Emitted when the data file content changed
#[derive(Debug, Clone)]
pub struct DataChanged {
    pub path: PathBuf,

    /// SHA256 hash (16 chars)
    pub hash: String,

    /// File size in bytes
    pub size: u64,

    pub detected_at: DateTime<Utc>,
}

/// Hash the file and compare with the last known hash.
///
/// Returns the change (and records the new hash) when the content differs.
pub async fn detect_change(path: &Path, last_hash: &mut Option<String>) -> Result<Option<DataChanged>> {
    let content = tokio::fs::read(path).await?;
    let hash = hex::encode(&Sha256::digest(&content)[..8]);

    if last_hash.as_deref() == Some(hash.as_str()) {
        return Ok(None);
    }
    *last_hash = Some(hash.clone());

    Ok(Some(DataChanged {
        path: path.to_path_buf(),
        hash,
        size: content.len() as u64,
        detected_at: Utc::now(),
    }))
}

/// Data file watcher with stability checking
pub struct DataFileWatcher {
    config: WatcherConfig,
}

impl DataFileWatcher {
    pub fn new(config: WatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Watch the file and emit change events until stopped.
    ///
    /// The current content is taken as the baseline, so only later
    /// changes are reported.
    pub async fn watch(&self) -> Result<(mpsc::Receiver<DataChanged>, WatchHandle)> {
        let watch_dir = self.config.watch_dir()?;

        let mut baseline = None;
        if self.config.path.exists() {
            detect_change(&self.config.path, &mut baseline).await?;
        }

        let (event_tx, event_rx) = mpsc::channel::<DataChanged>(16);
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = run_watcher(config, watch_dir, baseline, event_tx, &mut stop_rx).await {
                tracing::error!("Watcher error: {}", e);
            }
        });

        Ok((
            event_rx,
            WatchHandle {
                stop_tx,
                task: handle,
            },
        ))
    }
}

/// Handle to control the watcher
pub struct WatchHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl WatchHandle {
    /// Stop the watcher
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(()).await;
        self.task.await?;
        Ok(())
    }
}

/// Internal watcher loop
async fn run_watcher(
    config: WatcherConfig,
    watch_dir: PathBuf,
    mut last_hash: Option<String>,
    event_tx: mpsc::Sender<DataChanged>,
    stop_rx: &mut mpsc::Receiver<()>,
) -> Result<()> {
    // Last observed (size, time) while a change settles
    let mut pending: Option<(u64, Instant)> = None;

    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer = new_debouncer(Duration::from_secs(2), tx)?;
    debouncer
        .watcher()
        .watch(&watch_dir, RecursiveMode::NonRecursive)?;

    let stability_delay = Duration::from_secs(config.stability_delay_secs);
    let target = config.path.file_name().map(|n| n.to_os_string());

    tracing::info!("Watching {} for changes", config.path.display());

    loop {
        if stop_rx.try_recv().is_ok() {
            tracing::info!("Watcher stopping...");
            break;
        }

        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(Ok(events)) => {
                let touched = events
                    .iter()
                    .any(|event| event.path.file_name().map(|n| n.to_os_string()) == target);
                if touched {
                    if let Ok(metadata) = std::fs::metadata(&config.path) {
                        pending = Some((metadata.len(), Instant::now()));
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("Watcher error: {:?}", e);
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                tracing::error!("Watcher channel disconnected");
                break;
            }
        }

        if let Some((last_size, last_seen)) = pending {
            if last_seen.elapsed() >= stability_delay {
                match std::fs::metadata(&config.path) {
                    Ok(metadata) if metadata.len() == last_size && last_size > 0 => {
                        pending = None;
                        match detect_change(&config.path, &mut last_hash).await {
                            Ok(Some(change)) => {
                                tracing::info!("Data file changed: {} ({})", change.path.display(), change.hash);
                                if event_tx.send(change).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {
                                tracing::debug!("Data file touched but content unchanged");
                            }
                            Err(e) => tracing::warn!("Failed to hash {}: {}", config.path.display(), e),
                        }
                    }
                    Ok(metadata) => pending = Some((metadata.len(), Instant::now())),
                    Err(_) => pending = None,
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    Ok(())
}
