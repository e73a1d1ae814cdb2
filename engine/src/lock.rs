//! Mutual exclusion across fill processes.
//!
//! A single sentinel file denotes "a fill is in progress on this host".
//! Creation is atomic (`create_new`), so concurrent starts race cleanly:
//! exactly one wins and everyone else sees [`FillError::LockExists`]. The
//! guard removes the sentinel on drop. An optional liveness monitor
//! watches for the sentinel disappearing mid-run, which is the only
//! supported way for an external tool to force-release an in-flight fill.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

use crate::error::FillError;
use crate::fill::AbortReason;

const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    armed: bool,
}

impl LockFile {
    /// Creates the sentinel, failing if it already exists.
    pub fn acquire(path: &Path) -> Result<Self, FillError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(err) = std::fs::create_dir_all(parent)
        {
            return Err(FillError::PreCheckFailed(format!(
                "cannot create lock directory {}: {err}",
                parent.display()
            )));
        }

        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => Ok(Self {
                path: path.to_path_buf(),
                armed: true,
            }),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(FillError::LockExists(path.to_path_buf()))
            }
            Err(err) => Err(FillError::PreCheckFailed(format!(
                "cannot create lock file {}: {err}",
                path.display()
            ))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Watches for the sentinel disappearing and requests an abort when it
    /// does.
    pub fn spawn_monitor(
        &self,
        abort_tx: mpsc::Sender<AbortReason>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let path = self.path.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(MONITOR_INTERVAL) => {}
                    _ = shutdown_rx.recv() => break,
                }

                if !path.exists() {
                    log::warn!(
                        "Lock file {} disappeared. Aborting the fill.",
                        path.display()
                    );
                    let _ = abort_tx.send(AbortReason::LockReleased).await;
                    break;
                }
            }
        })
    }

    /// Removes the sentinel now instead of at drop time.
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.armed {
            self.armed = false;
            if let Err(err) = std::fs::remove_file(&self.path)
                && err.kind() != ErrorKind::NotFound
            {
                log::error!(
                    "Failed removing lock file {}: {err}",
                    self.path.display()
                );
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.remove();
    }
}

pub fn lockfile_exists(path: &Path) -> bool {
    path.exists()
}

/// Removes a stale sentinel. Returns whether one existed.
pub fn clear_lock(path: &Path) -> std::io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
