use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::models::UsageSnapshot;
use crate::relay::RelaySubscriber;

pub const DATA_FILE_NAME: &str = ".claude-usage-data.json";
pub const GRACE_PERIOD: Duration = Duration::from_secs(20);
pub const FRESHNESS_THRESHOLD: Duration = Duration::from_secs(60);

pub fn default_data_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DATA_FILE_NAME))
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to encode usage data: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Debug, PartialEq)]
pub enum Rehydration {
    Missing,
    Fresh(UsageSnapshot),
    Discarded,
}

#[derive(Default)]
struct PendingDeletion {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl PendingDeletion {
    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.generation += 1;
    }
}

/// Single-slot cache file that deletes itself after a grace period.
///
/// The store is the only writer and deleter of its path. File writes and
/// deletions happen under the timer lock, so a firing timer never removes a
/// file written after it was superseded.
pub struct EphemeralFileStore {
    path: PathBuf,
    grace: Duration,
    freshness: Duration,
    pending: Arc<Mutex<PendingDeletion>>,
}

impl EphemeralFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self::with_windows(path, GRACE_PERIOD, FRESHNESS_THRESHOLD)
    }

    pub fn with_windows(path: PathBuf, grace: Duration, freshness: Duration) -> Self {
        Self {
            path,
            grace,
            freshness,
            pending: Arc::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, PendingDeletion> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Overwrite the file and restart the grace period.
    ///
    /// Must be called from within a tokio runtime.
    pub fn write<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(payload)?;
        let mut pending = self.lock();
        std::fs::write(&self.path, json).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })?;
        tracing::info!(path = %self.path.display(), "Usage data written to file");
        self.arm(&mut pending, self.grace);
        Ok(())
    }

    /// Replace any pending deletion with one firing after `after`.
    pub fn schedule_deletion(&self, after: Duration) {
        let mut pending = self.lock();
        self.arm(&mut pending, after);
    }

    fn arm(&self, pending: &mut PendingDeletion, after: Duration) {
        pending.cancel();
        let generation = pending.generation;
        let shared = Arc::clone(&self.pending);
        let path = self.path.clone();

        pending.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let mut pending = shared.lock().unwrap_or_else(|e| e.into_inner());
            if pending.generation != generation {
                return;
            }
            pending.handle = None;
            if remove_if_present(&path) {
                tracing::info!(after = ?after, "Usage data file deleted (grace period elapsed)");
            }
        }));
    }

    /// Pick up a snapshot left behind by a previous run.
    ///
    /// A fresh file is handed to `subscriber` and kept only for what is left
    /// of its grace period. Stale or unreadable files are deleted at once.
    pub fn try_rehydrate(&self, subscriber: &dyn RelaySubscriber) -> Rehydration {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Rehydration::Missing,
            Err(e) => {
                tracing::error!("Error reading existing data file: {e}");
                self.discard();
                return Rehydration::Discarded;
            }
        };

        let snapshot = match serde_json::from_str::<UsageSnapshot>(&content) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!("Error parsing existing data file: {e}");
                self.discard();
                return Rehydration::Discarded;
            }
        };

        let Some(updated_at) = snapshot.updated_at() else {
            tracing::warn!("Existing data file has no usable updatedAt");
            self.discard();
            return Rehydration::Discarded;
        };

        // A timestamp from the future counts as brand new.
        let age = (Utc::now() - updated_at).to_std().unwrap_or(Duration::ZERO);
        if age >= self.freshness {
            tracing::info!(age = ?age, "Existing data file is stale");
            self.discard();
            return Rehydration::Discarded;
        }

        subscriber.notify(&snapshot);
        self.schedule_deletion(self.grace.saturating_sub(age));
        Rehydration::Fresh(snapshot)
    }

    fn discard(&self) {
        let mut pending = self.lock();
        pending.cancel();
        remove_if_present(&self.path);
    }

    /// Cancel the pending deletion and remove the file now.
    pub fn stop(&self) {
        self.discard();
        tracing::debug!(path = %self.path.display(), "Usage data store stopped");
    }
}

impl Drop for EphemeralFileStore {
    fn drop(&mut self) {
        self.lock().cancel();
    }
}

fn remove_if_present(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(path = %path.display(), "Failed to delete usage data file: {e}");
            false
        }
    }
}
