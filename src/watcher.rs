//! Filesystem watcher bridge.
//!
//! Wraps the platform watcher and translates its raw events into
//! `ChangeEvent`s on an mpsc channel, so the upload manager only ever
//! sees discrete path/kind/timestamp tuples. Starting a watch first
//! walks the folder and emits an `Initial` event per pre-existing file,
//! which is how the ignore-pre-existing-files policy gets its signal.
//!
//! Dropping the returned `FolderWatcher` stops the watch and closes the
//! channel; switching folders never leaks a watcher.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    /// Present before watching began
    Initial,
    Other,
}

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    /// Unix seconds at observation
    pub timestamp: u64,
}

impl ChangeEvent {
    pub fn now(path: PathBuf, kind: ChangeKind) -> Self {
        Self {
            path,
            kind,
            timestamp: Utc::now().timestamp().max(0) as u64,
        }
    }
}

/// Keeps the platform watcher alive; dropping it stops the watch.
pub struct FolderWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl FolderWatcher {
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Start watching `root` recursively, emitting an `Initial` event per
/// existing file before any live events.
pub fn watch(root: &Path, tx: mpsc::UnboundedSender<ChangeEvent>) -> Result<FolderWatcher> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Cannot watch {}", root.display()))?;

    emit_initial_snapshot(&root, &tx)?;

    let event_tx = tx.clone();
    let mut watcher = notify::recommended_watcher(
        move |res: std::result::Result<notify::Event, notify::Error>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "Watcher error");
                    return;
                }
            };

            let kind = match event.kind {
                notify::EventKind::Create(_) => ChangeKind::Created,
                notify::EventKind::Modify(_) => ChangeKind::Modified,
                notify::EventKind::Remove(_) => ChangeKind::Removed,
                _ => ChangeKind::Other,
            };

            for path in event.paths {
                // Receiver gone means the manager shut down first.
                if event_tx.send(ChangeEvent::now(path, kind)).is_err() {
                    return;
                }
            }
        },
    )
    .context("Failed to create filesystem watcher")?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch {}", root.display()))?;
    debug!(root = %root.display(), "Watching folder");

    Ok(FolderWatcher {
        _watcher: watcher,
        root,
    })
}

fn emit_initial_snapshot(dir: &Path, tx: &mpsc::UnboundedSender<ChangeEvent>) -> Result<()> {
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable directory entry");
                continue;
            }
        };
        let path = entry.path();
        if path.is_dir() {
            // An unreadable subfolder loses its own entries, not the
            // whole watch.
            if let Err(e) = emit_initial_snapshot(&path, tx) {
                warn!(path = %path.display(), error = %e, "Skipping unreadable subfolder");
            }
        } else if tx
            .send(ChangeEvent::now(path, ChangeKind::Initial))
            .is_err()
        {
            break;
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
