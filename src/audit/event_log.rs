use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::event::AuditEvent;
use super::outbox::{Outbox, OutboxBatch, OutboxError};
use crate::domain::{UnitTag, VersionToken};
use crate::observability::EngineMetrics;
use crate::store::schema::units;
use crate::store::{Row, RowStore, Sheet};
use crate::sync::RetryPolicy;

/// Result of a direct append to the audit sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Success { rows: usize },
    /// `written` rows made it before the failing chunk.
    WriteFailed { error: String, written: usize },
}

impl AppendOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AppendOutcome::Success { .. })
    }
}

/// How a staged batch was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Committed,
    Aborted,
    /// The unit row could not be read; the batch stays staged.
    Unresolved,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub committed: usize,
    pub aborted: usize,
    pub unresolved: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub batches_flushed: usize,
    pub events_flushed: usize,
    pub batches_pending: usize,
    pub error: Option<String>,
}

/// Append-only audit trail backed by the write-ahead outbox.
///
/// `stage` must succeed before a state write; `commit`/`abort` settle the
/// batch once the write outcome is known; `flush` moves committed batches to
/// the audit sheet. Events are never dropped: a failed flush leaves them
/// committed for the next attempt.
pub struct EventLog {
    store: Arc<dyn RowStore>,
    outbox: Arc<dyn Outbox>,
    retry: RetryPolicy,
    max_rows_per_call: usize,
    metrics: Arc<EngineMetrics>,
    flushing: Mutex<()>,
}

impl EventLog {
    pub fn new(
        store: Arc<dyn RowStore>,
        outbox: Arc<dyn Outbox>,
        retry: RetryPolicy,
        max_rows_per_call: usize,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            outbox,
            retry,
            max_rows_per_call: max_rows_per_call.max(1),
            metrics,
            flushing: Mutex::new(()),
        }
    }

    pub fn outbox(&self) -> &Arc<dyn Outbox> {
        &self.outbox
    }

    pub async fn append(&self, event: &AuditEvent) -> AppendOutcome {
        self.append_batch(std::slice::from_ref(event)).await
    }

    /// Append events straight to the audit sheet, chunked under the store's
    /// per-call row limit.
    pub async fn append_batch(&self, events: &[AuditEvent]) -> AppendOutcome {
        let rows: Vec<Row> = events.iter().map(AuditEvent::to_row).collect();
        let mut written = 0;
        for chunk in rows.chunks(self.max_rows_per_call) {
            if let Err(err) = self.append_chunk(chunk).await {
                return AppendOutcome::WriteFailed {
                    error: err,
                    written,
                };
            }
            written += chunk.len();
        }
        AppendOutcome::Success { rows: written }
    }

    async fn append_chunk(&self, rows: &[Row]) -> Result<(), String> {
        self.retry
            .run(
                "audit_append",
                || self.store.append_rows(Sheet::Audit, rows),
                |err| err.is_transient(),
            )
            .await
            .map_err(|failure| failure.to_string())
    }

    /// Stage events ahead of the state write that will carry `version`.
    pub async fn stage(
        &self,
        unit_tag: &UnitTag,
        version: &VersionToken,
        events: Vec<AuditEvent>,
    ) -> Result<OutboxBatch, OutboxError> {
        let batch = OutboxBatch::new(unit_tag.clone(), version.clone(), events);
        self.outbox.stage(batch.clone()).await?;
        debug!(batch_id = %batch.id, unit_tag = %unit_tag, "Audit batch staged");
        Ok(batch)
    }

    /// Best effort: a failure here leaves the batch staged, and `recover`
    /// settles it later from the store.
    pub async fn commit(&self, batch_id: &str) {
        if let Err(err) = self.outbox.mark_committed(batch_id).await {
            error!(batch_id, error = %err, "Failed to commit staged audit batch");
        }
    }

    pub async fn abort(&self, batch_id: &str) {
        if let Err(err) = self.outbox.mark_aborted(batch_id).await {
            error!(batch_id, error = %err, "Failed to abort staged audit batch");
        }
    }

    /// Decide a staged batch by comparing its token to the unit row's
    /// current version.
    pub async fn resolve(&self, batch: &OutboxBatch) -> Resolution {
        let row = match self.store.read_row(Sheet::Units, batch.unit_tag.as_str()).await {
            Ok(row) => row,
            Err(err) => {
                warn!(
                    batch_id = %batch.id,
                    unit_tag = %batch.unit_tag,
                    error = %err,
                    "Cannot resolve staged audit batch yet"
                );
                return Resolution::Unresolved;
            }
        };

        let current = row
            .as_ref()
            .and_then(|row| row.get(units::VERSION))
            .unwrap_or_default();
        if current == batch.version.as_str() {
            self.commit(&batch.id).await;
            Resolution::Committed
        } else {
            self.abort(&batch.id).await;
            Resolution::Aborted
        }
    }

    /// Settle every batch left staged by an earlier run.
    pub async fn recover(&self) -> Result<RecoveryReport, OutboxError> {
        let mut report = RecoveryReport::default();
        for batch in self.outbox.staged().await? {
            match self.resolve(&batch).await {
                Resolution::Committed => report.committed += 1,
                Resolution::Aborted => report.aborted += 1,
                Resolution::Unresolved => report.unresolved += 1,
            }
        }
        if report != RecoveryReport::default() {
            info!(
                committed = report.committed,
                aborted = report.aborted,
                unresolved = report.unresolved,
                "Recovered staged audit batches"
            );
        }
        Ok(report)
    }

    /// Move committed batches to the audit sheet, oldest first.
    ///
    /// Several small batches share one append; a batch larger than the row
    /// limit is split, and each landed piece advances the batch's flushed
    /// offset so a retry does not append it again. A batch leaves the outbox
    /// only once all of its rows were appended. Stops at the first failure so
    /// order is preserved.
    pub async fn flush(&self) -> FlushReport {
        // Two concurrent flushes would append the same batches twice.
        let _flushing = self.flushing.lock().await;
        let mut report = FlushReport::default();
        let batches = match self.outbox.committed().await {
            Ok(batches) => batches,
            Err(err) => {
                self.metrics.record_audit_flush_failure();
                error!(error = %err, "Audit outbox unreadable, nothing flushed");
                report.error = Some(err.to_string());
                return report;
            }
        };
        let total = batches.len();

        for chunk in plan_chunks(&batches, self.max_rows_per_call) {
            if !chunk.rows.is_empty() {
                if let Err(err) = self.append_chunk(&chunk.rows).await {
                    self.metrics.record_audit_flush_failure();
                    let pending: Vec<&str> = batches[report.batches_flushed..]
                        .iter()
                        .map(|batch| batch.unit_tag.as_str())
                        .collect();
                    error!(
                        error = %err,
                        pending_batches = total - report.batches_flushed,
                        pending_units = ?pending,
                        "Audit flush failed; events kept in outbox"
                    );
                    report.error = Some(err);
                    break;
                }
                report.events_flushed += chunk.rows.len();
                self.metrics.record_audit_flushed(chunk.rows.len() as u64);
            }

            for (batch_id, flushed) in &chunk.progress {
                if let Err(err) = self.outbox.mark_progress(batch_id, *flushed).await {
                    error!(batch_id = %batch_id, error = %err, "Flush progress could not be recorded");
                }
            }

            for batch_id in &chunk.completes {
                if let Err(err) = self.outbox.mark_flushed(batch_id).await {
                    error!(batch_id = %batch_id, error = %err, "Flushed batch could not be removed from outbox");
                }
                report.batches_flushed += 1;
            }
        }

        report.batches_pending = total - report.batches_flushed;
        if report.events_flushed > 0 {
            info!(
                batches = report.batches_flushed,
                events = report.events_flushed,
                "Audit events flushed"
            );
        }
        report
    }
}

struct FlushChunk {
    rows: Vec<Row>,
    /// Batches whose last rows are in this chunk.
    completes: Vec<String>,
    /// Split batches and how many of their events are on the sheet once
    /// this chunk lands.
    progress: Vec<(String, usize)>,
}

impl FlushChunk {
    fn new() -> Self {
        Self {
            rows: Vec::new(),
            completes: Vec::new(),
            progress: Vec::new(),
        }
    }
}

/// Pack the unflushed events of `batches` into appends of at most `limit`
/// rows. Events already recorded as flushed are skipped.
fn plan_chunks(batches: &[OutboxBatch], limit: usize) -> Vec<FlushChunk> {
    let mut chunks = Vec::new();
    let mut current = FlushChunk::new();

    for batch in batches {
        let rows: Vec<Row> = batch.pending_events().iter().map(AuditEvent::to_row).collect();
        if !current.rows.is_empty() && current.rows.len() + rows.len() > limit {
            chunks.push(std::mem::replace(&mut current, FlushChunk::new()));
        }

        if rows.len() > limit {
            let mut flushed = batch.flushed;
            let mut pieces = rows.chunks(limit).peekable();
            while let Some(piece) = pieces.next() {
                flushed += piece.len();
                let mut chunk = FlushChunk::new();
                chunk.rows = piece.to_vec();
                if pieces.peek().is_none() {
                    chunk.completes.push(batch.id.clone());
                } else {
                    chunk.progress.push((batch.id.clone(), flushed));
                }
                chunks.push(chunk);
            }
        } else {
            current.rows.extend(rows);
            current.completes.push(batch.id.clone());
        }
    }

    if !current.completes.is_empty() {
        chunks.push(current);
    }
    chunks
}
