use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum DeletionQueueError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt deletion queue file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl DeletionQueueError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A file waiting to be deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionRecord {
    pub path: PathBuf,
    pub marked_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    version: u32,
    records: Vec<DeletionRecord>,
}

/// On-disk formats accepted when loading.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredQueue {
    Versioned(QueueFile),
    /// Bare array written by early releases.
    Legacy(Vec<DeletionRecord>),
}

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: usize,
    /// Records that were due but whose file could not be removed.
    pub failed: usize,
    pub remaining: usize,
}

/// Persistent queue of files to delete after a retention period.
pub struct DeletionQueue {
    file: PathBuf,
    retention: Duration,
    records: Mutex<Vec<DeletionRecord>>,
}

impl DeletionQueue {
    /// Load the queue from `file`, or start empty if it does not exist.
    pub async fn load(file: impl Into<PathBuf>, retention: Duration) -> Result<Self, DeletionQueueError> {
        let file = file.into();
        let records = match fs::read(&file).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Vec::new(),
            Ok(bytes) => match serde_json::from_slice::<StoredQueue>(&bytes) {
                Ok(StoredQueue::Versioned(queue)) => queue.records,
                Ok(StoredQueue::Legacy(records)) => {
                    info!(path = %file.display(), "Upgrading legacy deletion queue file");
                    records
                }
                Err(e) => {
                    return Err(DeletionQueueError::Corrupt {
                        path: file,
                        reason: e.to_string(),
                    })
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(DeletionQueueError::io(&file, e)),
        };

        info!(
            path = %file.display(),
            pending = records.len(),
            "Loaded deletion queue"
        );
        metrics::DELETION_QUEUE_PENDING.set(records.len() as i64);

        Ok(Self {
            file,
            retention,
            records: Mutex::new(records),
        })
    }

    /// Path of the backing file.
    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Mark `path` for deletion now.
    pub async fn add(&self, path: impl Into<PathBuf>) -> Result<(), DeletionQueueError> {
        self.add_at(path, Utc::now()).await
    }

    /// Mark `path` for deletion with an explicit timestamp.
    ///
    /// The record is on disk when this returns.
    pub async fn add_at(
        &self,
        path: impl Into<PathBuf>,
        marked_at: DateTime<Utc>,
    ) -> Result<(), DeletionQueueError> {
        let path = path.into();
        let mut records = self.records.lock().await;
        if records.iter().any(|r| r.path == path) {
            debug!(path = %path.display(), "Already marked for deletion");
            return Ok(());
        }
        records.push(DeletionRecord {
            path: path.clone(),
            marked_at,
        });

        if let Err(e) = self.persist(&records).await {
            records.pop();
            return Err(e);
        }
        metrics::DELETION_QUEUE_PENDING.set(records.len() as i64);
        debug!(path = %path.display(), "Marked for deletion");
        Ok(())
    }

    /// Drop the record for `path` if present.
    async fn forget(&self, path: &Path) -> Result<(), DeletionQueueError> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|r| r.path != path);
        if records.len() == before {
            return Ok(());
        }
        self.persist(&records).await?;
        metrics::DELETION_QUEUE_PENDING.set(records.len() as i64);
        Ok(())
    }

    /// Move `source` into `trash_dir` and mark the moved file for deletion.
    ///
    /// The record for the trash path is on disk before the file is moved, so
    /// nothing lands in the trash unrecorded. Returns the path inside the
    /// trash directory.
    pub async fn move_to_trash(
        &self,
        source: &Path,
        trash_dir: &Path,
    ) -> Result<PathBuf, DeletionQueueError> {
        fs::create_dir_all(trash_dir)
            .await
            .map_err(|e| DeletionQueueError::io(trash_dir, e))?;

        let file_name = source
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "recording".into());
        let mut target = trash_dir.join(&file_name);
        if fs::try_exists(&target).await.unwrap_or(false) {
            let mut name = file_name.clone();
            name.push(format!(".{}", Utc::now().timestamp_millis()));
            target = trash_dir.join(name);
        }

        self.add(target.clone()).await?;

        if let Err(e) = Self::relocate(source, &target).await {
            if !fs::try_exists(&target).await.unwrap_or(false) {
                if let Err(forget_err) = self.forget(&target).await {
                    warn!(path = %target.display(), error = %forget_err, "Failed to drop deletion record");
                }
            }
            return Err(e);
        }
        Ok(target)
    }

    async fn relocate(source: &Path, target: &Path) -> Result<(), DeletionQueueError> {
        match fs::rename(source, target).await {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(nix::errno::Errno::EXDEV as i32) => {
                // Trash lives on another filesystem
                fs::copy(source, target)
                    .await
                    .map_err(|e| DeletionQueueError::io(target, e))?;
                fs::remove_file(source)
                    .await
                    .map_err(|e| DeletionQueueError::io(source, e))
            }
            Err(e) => Err(DeletionQueueError::io(source, e)),
        }
    }

    /// Snapshot of pending records.
    pub async fn pending(&self) -> Vec<DeletionRecord> {
        self.records.lock().await.clone()
    }

    /// Delete every file marked at least `retention` ago.
    pub async fn sweep(&self) -> Result<SweepReport, DeletionQueueError> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, DeletionQueueError> {
        let mut records = self.records.lock().await;
        let mut report = SweepReport::default();
        let mut kept = Vec::with_capacity(records.len());

        for record in records.drain(..) {
            if now.signed_duration_since(record.marked_at) < self.retention {
                kept.push(record);
                continue;
            }
            match fs::remove_file(&record.path).await {
                Ok(()) => {
                    debug!(path = %record.path.display(), "Deleted file");
                    report.deleted += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(path = %record.path.display(), "File already gone");
                    report.deleted += 1;
                }
                Err(e) => {
                    warn!(path = %record.path.display(), error = %e, "Failed to delete file, will retry");
                    report.failed += 1;
                    kept.push(record);
                }
            }
        }

        *records = kept;
        report.remaining = records.len();
        if report.deleted > 0 {
            self.persist(&records).await?;
            info!(
                deleted = report.deleted,
                remaining = report.remaining,
                "Deletion sweep finished"
            );
        }
        metrics::DELETION_QUEUE_PENDING.set(records.len() as i64);
        metrics::FILES_DELETED_TOTAL.inc_by(report.deleted as u64);
        Ok(report)
    }

    /// Write the queue to a temporary file, fsync it and rename it over
    /// the backing file.
    async fn persist(&self, records: &[DeletionRecord]) -> Result<(), DeletionQueueError> {
        let body = serde_json::to_vec_pretty(&QueueFile {
            version: FORMAT_VERSION,
            records: records.to_vec(),
        })
        .map_err(|e| DeletionQueueError::Corrupt {
            path: self.file.clone(),
            reason: e.to_string(),
        })?;

        if let Some(parent) = self.file.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DeletionQueueError::io(parent, e))?;
        }

        let mut tmp_name = self.file.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| DeletionQueueError::io(&tmp, e))?;
        file.write_all(&body)
            .await
            .map_err(|e| DeletionQueueError::io(&tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| DeletionQueueError::io(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &self.file)
            .await
            .map_err(|e| DeletionQueueError::io(&self.file, e))
    }

    /// Run `sweep` every `interval` until shutdown.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: std::time::Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Deletion sweeper started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Deletion sweeper received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = self.sweep().await {
                            warn!(error = %e, "Deletion sweep failed");
                        }
                    }
                }
            }
        })
    }
}
