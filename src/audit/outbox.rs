// Write-ahead outbox for audit events.
//
// Events are staged durably before the state write they describe. A staged
// batch is committed once the write is known to have landed, aborted when it
// is known not to have, and removed after it reaches the audit sheet.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;

use super::event::AuditEvent;
use crate::domain::{UnitTag, VersionToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Written to the outbox, state write outcome unknown.
    Staged,
    /// State write confirmed, waiting to reach the audit sheet.
    Committed,
}

/// Events of one transition, tied to the version token its state write uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxBatch {
    pub id: String,
    pub unit_tag: UnitTag,
    pub version: VersionToken,
    pub status: BatchStatus,
    pub staged_at: DateTime<Utc>,
    /// `host:pid` of the process that staged the batch.
    #[serde(default)]
    pub staged_by: String,
    pub events: Vec<AuditEvent>,
    /// Leading events already on the audit sheet.
    #[serde(default)]
    pub flushed: usize,
}

impl OutboxBatch {
    pub fn new(unit_tag: UnitTag, version: VersionToken, events: Vec<AuditEvent>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            unit_tag,
            version,
            status: BatchStatus::Staged,
            staged_at: Utc::now(),
            staged_by: origin(),
            events,
            flushed: 0,
        }
    }

    /// Events not yet on the audit sheet.
    pub fn pending_events(&self) -> &[AuditEvent] {
        &self.events[self.flushed.min(self.events.len())..]
    }
}

fn origin() -> String {
    let host = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    format!("{host}:{}", std::process::id())
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OutboxError {
    #[error("outbox batch {0} not found")]
    NotFound(String),
    #[error("outbox I/O error: {0}")]
    Io(String),
    #[error("outbox contents unreadable: {0}")]
    Corrupt(String),
    #[error("outbox database error: {0}")]
    Database(String),
}

impl From<std::io::Error> for OutboxError {
    fn from(err: std::io::Error) -> Self {
        OutboxError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for OutboxError {
    fn from(err: serde_json::Error) -> Self {
        OutboxError::Corrupt(err.to_string())
    }
}

/// Durable staging area for audit batches.
#[async_trait]
pub trait Outbox: Send + Sync {
    async fn stage(&self, batch: OutboxBatch) -> Result<(), OutboxError>;

    async fn mark_committed(&self, batch_id: &str) -> Result<(), OutboxError>;

    /// Drop a batch whose state write is known not to have happened.
    async fn mark_aborted(&self, batch_id: &str) -> Result<(), OutboxError>;

    /// Record that the first `flushed` events of a batch reached the audit
    /// sheet, so a later flush resumes after them.
    async fn mark_progress(&self, batch_id: &str, flushed: usize) -> Result<(), OutboxError>;

    /// Drop a batch that reached the audit sheet.
    async fn mark_flushed(&self, batch_id: &str) -> Result<(), OutboxError>;

    /// Batches with an unresolved state write, oldest first.
    async fn staged(&self) -> Result<Vec<OutboxBatch>, OutboxError>;

    /// Batches waiting for the flush, oldest first.
    async fn committed(&self) -> Result<Vec<OutboxBatch>, OutboxError>;
}

fn commit_in(batches: &mut [OutboxBatch], batch_id: &str) -> Result<(), OutboxError> {
    let batch = batches
        .iter_mut()
        .find(|batch| batch.id == batch_id)
        .ok_or_else(|| OutboxError::NotFound(batch_id.to_string()))?;
    batch.status = BatchStatus::Committed;
    Ok(())
}

fn progress_in(batches: &mut [OutboxBatch], batch_id: &str, flushed: usize) -> Result<(), OutboxError> {
    let batch = batches
        .iter_mut()
        .find(|batch| batch.id == batch_id)
        .ok_or_else(|| OutboxError::NotFound(batch_id.to_string()))?;
    batch.flushed = flushed.min(batch.events.len());
    Ok(())
}

fn remove_from(batches: &mut Vec<OutboxBatch>, batch_id: &str) -> Result<(), OutboxError> {
    let before = batches.len();
    batches.retain(|batch| batch.id != batch_id);
    if batches.len() == before {
        return Err(OutboxError::NotFound(batch_id.to_string()));
    }
    Ok(())
}

fn with_status(batches: &[OutboxBatch], status: BatchStatus) -> Vec<OutboxBatch> {
    batches
        .iter()
        .filter(|batch| batch.status == status)
        .cloned()
        .collect()
}

/// Outbox that lives only as long as the process. Tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryOutbox {
    batches: Mutex<Vec<OutboxBatch>>,
    failing_stages: AtomicUsize,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` stage calls fail.
    pub fn fail_next_stages(&self, n: usize) {
        self.failing_stages.store(n, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.batches.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.batches.lock().await.is_empty()
    }
}

#[async_trait]
impl Outbox for InMemoryOutbox {
    async fn stage(&self, batch: OutboxBatch) -> Result<(), OutboxError> {
        let injected = self
            .failing_stages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(OutboxError::Io("injected stage failure".to_string()));
        }
        self.batches.lock().await.push(batch);
        Ok(())
    }

    async fn mark_committed(&self, batch_id: &str) -> Result<(), OutboxError> {
        commit_in(&mut *self.batches.lock().await, batch_id)
    }

    async fn mark_aborted(&self, batch_id: &str) -> Result<(), OutboxError> {
        remove_from(&mut *self.batches.lock().await, batch_id)
    }

    async fn mark_progress(&self, batch_id: &str, flushed: usize) -> Result<(), OutboxError> {
        progress_in(&mut *self.batches.lock().await, batch_id, flushed)
    }

    async fn mark_flushed(&self, batch_id: &str) -> Result<(), OutboxError> {
        remove_from(&mut *self.batches.lock().await, batch_id)
    }

    async fn staged(&self) -> Result<Vec<OutboxBatch>, OutboxError> {
        Ok(with_status(&self.batches.lock().await, BatchStatus::Staged))
    }

    async fn committed(&self) -> Result<Vec<OutboxBatch>, OutboxError> {
        Ok(with_status(&self.batches.lock().await, BatchStatus::Committed))
    }
}

/// Outbox persisted as a JSON array next to the store document. Survives a
/// crash between staging and flushing.
#[derive(Debug, Clone)]
pub struct FileOutbox {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileOutbox {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_batches<T, F>(&self, f: F) -> Result<T, OutboxError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Vec<OutboxBatch>) -> Result<(T, bool), OutboxError> + Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();

        tokio::task::spawn_blocking(move || -> Result<T, OutboxError> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let lock_file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            let mut lock = RwLock::new(lock_file);
            let _guard = lock.write()?;

            let mut batches: Vec<OutboxBatch> = if path.exists() {
                serde_json::from_reader(std::io::BufReader::new(File::open(&path)?))?
            } else {
                Vec::new()
            };

            let (value, dirty) = f(&mut batches)?;
            if dirty {
                let temp = path.with_extension("json.tmp");
                fs::write(&temp, serde_json::to_string_pretty(&batches)?)?;
                fs::rename(&temp, &path)?;
            }
            Ok(value)
        })
        .await
        .map_err(|err| OutboxError::Io(format!("outbox task failed: {err}")))?
    }
}

#[async_trait]
impl Outbox for FileOutbox {
    async fn stage(&self, batch: OutboxBatch) -> Result<(), OutboxError> {
        self.with_batches(move |batches| {
            batches.push(batch);
            Ok(((), true))
        })
        .await
    }

    async fn mark_committed(&self, batch_id: &str) -> Result<(), OutboxError> {
        let id = batch_id.to_string();
        self.with_batches(move |batches| commit_in(batches, &id).map(|()| ((), true)))
            .await
    }

    async fn mark_aborted(&self, batch_id: &str) -> Result<(), OutboxError> {
        let id = batch_id.to_string();
        self.with_batches(move |batches| remove_from(batches, &id).map(|()| ((), true)))
            .await
    }

    async fn mark_progress(&self, batch_id: &str, flushed: usize) -> Result<(), OutboxError> {
        let id = batch_id.to_string();
        self.with_batches(move |batches| progress_in(batches, &id, flushed).map(|()| ((), true)))
            .await
    }

    async fn mark_flushed(&self, batch_id: &str) -> Result<(), OutboxError> {
        let id = batch_id.to_string();
        self.with_batches(move |batches| remove_from(batches, &id).map(|()| ((), true)))
            .await
    }

    async fn staged(&self) -> Result<Vec<OutboxBatch>, OutboxError> {
        self.with_batches(|batches| Ok((with_status(batches, BatchStatus::Staged), false)))
            .await
    }

    async fn committed(&self) -> Result<Vec<OutboxBatch>, OutboxError> {
        self.with_batches(|batches| Ok((with_status(batches, BatchStatus::Committed), false)))
            .await
    }
}
