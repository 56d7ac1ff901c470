use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use super::retry::RetryPolicy;
use crate::domain::{Claimant, Completion, Operation, UnitTag, VersionToken};
use crate::store::schema::{self, sub_units, units};
use crate::store::{Row, RowStore, Sheet, StoreError, WriteBatch};
use crate::workflows::OperationState;

/// Every cell change one transition needs, collected before anything is
/// written. A plan always touches exactly one spool row plus any of its
/// unions.
#[derive(Debug, Clone)]
pub struct SyncPlan {
    unit_tag: UnitTag,
    unit: Row,
    stamps: Vec<(String, Row)>,
    versions: Option<(VersionToken, VersionToken)>,
}

impl SyncPlan {
    pub fn new(unit_tag: UnitTag) -> Self {
        Self {
            unit_tag,
            unit: Row::new(),
            stamps: Vec::new(),
            versions: None,
        }
    }

    pub fn unit_tag(&self) -> &UnitTag {
        &self.unit_tag
    }

    pub fn set_state(&mut self, operation: Operation, state: OperationState) -> &mut Self {
        self.unit.set(schema::state_column(operation), state.to_string());
        self
    }

    /// Record `claimant` on the spool, or clear the occupation cells.
    pub fn set_claimant(&mut self, claimant: Option<&Claimant>) -> &mut Self {
        match claimant {
            Some(claimant) => {
                self.unit.set(units::OCCUPIED_BY, claimant.actor.as_str());
                self.unit
                    .set(units::OCCUPIED_AT, schema::format_timestamp(&claimant.claimed_at));
                self.unit
                    .set(units::OCCUPIED_OPERATION, claimant.operation.as_str());
            }
            None => {
                self.unit.set(units::OCCUPIED_BY, "");
                self.unit.set(units::OCCUPIED_AT, "");
                self.unit.set(units::OCCUPIED_OPERATION, "");
            }
        }
        self
    }

    /// Stamp `next` on the spool row, and have the store refuse the write
    /// unless the row still carries `expected`.
    pub fn guard_version(&mut self, expected: &VersionToken, next: &VersionToken) -> &mut Self {
        self.unit.set(units::VERSION, next.as_str());
        self.versions = Some((expected.clone(), next.clone()));
        self
    }

    /// Denormalized counters: unions done for `operation` out of `total`,
    /// and the rounded metric sum.
    pub fn set_progress(
        &mut self,
        operation: Operation,
        done: usize,
        total: usize,
        metric: f64,
    ) -> &mut Self {
        if let Some((done_column, metric_column)) = schema::progress_columns(operation) {
            self.unit.set(units::TOTAL_UNIONS, total.to_string());
            self.unit.set(done_column, done.to_string());
            self.unit.set(metric_column, schema::format_metric(metric));
        }
        self
    }

    pub fn set_repair_cycles(&mut self, cycles: u8) -> &mut Self {
        self.unit.set(units::REPAIR_CYCLES, cycles.to_string());
        self
    }

    pub fn stamp_sub_unit(&mut self, id: &str, operation: Operation, completion: &Completion) -> &mut Self {
        if let Some((at_column, by_column)) = schema::stamp_columns(operation) {
            let row = Row::new()
                .with(at_column, schema::format_timestamp(&completion.at))
                .with(by_column, completion.by.as_str());
            self.stamps.push((id.to_string(), row));
        }
        self
    }

    pub fn touch(&mut self, at: &DateTime<Utc>) -> &mut Self {
        self.unit.set(units::UPDATED_AT, schema::format_timestamp(at));
        self
    }

    pub fn stamped_count(&self) -> usize {
        self.stamps.len()
    }

    pub fn into_batch(self) -> WriteBatch {
        let mut batch = WriteBatch::new();
        if let Some((expected, next)) = &self.versions {
            batch.require_version(self.unit_tag.as_str(), expected.as_str(), next.as_str());
        }
        batch.push(Sheet::Units, self.unit_tag.as_str(), self.unit);
        for (id, row) in self.stamps {
            batch.push(Sheet::SubUnits, id, row);
        }
        batch
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("batch of {rows} rows exceeds the store limit of {limit} rows per call")]
    TooLarge { rows: usize, limit: usize },

    #[error("spool moved from version {expected} to {found} before the write")]
    Conflict { expected: String, found: String },

    #[error("store layout does not match: {0}")]
    Schema(StoreError),

    #[error("store write failed after {attempts} attempt(s): {source}")]
    WriteFailed { source: StoreError, attempts: usize },
}

/// Applies a whole write batch in one atomic store call.
///
/// Columns are checked against the live header row first, so a renamed or
/// missing column fails loudly instead of writing the wrong cell. Transient
/// failures are retried per the configured policy; nothing is ever split
/// across calls.
pub struct BatchSyncWriter {
    store: Arc<dyn RowStore>,
    retry: RetryPolicy,
    max_rows_per_call: usize,
}

impl BatchSyncWriter {
    pub fn new(store: Arc<dyn RowStore>, retry: RetryPolicy, max_rows_per_call: usize) -> Self {
        Self {
            store,
            retry,
            max_rows_per_call,
        }
    }

    pub async fn validate(&self, batch: &WriteBatch) -> Result<(), SyncError> {
        let sheets: BTreeSet<Sheet> = batch.updates().iter().map(|update| update.sheet).collect();
        for sheet in sheets {
            let columns = self
                .store
                .column_map(sheet)
                .await
                .map_err(SyncError::Schema)?;
            for update in batch.updates().iter().filter(|update| update.sheet == sheet) {
                for column in update.cells.columns() {
                    columns.require(sheet, column).map_err(SyncError::Schema)?;
                }
            }
        }
        Ok(())
    }

    pub async fn write(&self, batch: &WriteBatch) -> Result<(), SyncError> {
        if batch.is_empty() {
            return Ok(());
        }
        if batch.len() > self.max_rows_per_call {
            return Err(SyncError::TooLarge {
                rows: batch.len(),
                limit: self.max_rows_per_call,
            });
        }

        self.validate(batch).await?;

        debug!(rows = batch.len(), "Writing batch");
        self.retry
            .run(
                "batch_write",
                || self.store.batch_write(batch),
                StoreError::is_transient,
            )
            .await
            .map_err(|failure| match failure.error {
                StoreError::VersionMismatch {
                    expected, found, ..
                } => SyncError::Conflict { expected, found },
                source => SyncError::WriteFailed {
                    source,
                    attempts: failure.attempts,
                },
            })?;

        info!(rows = batch.len(), "Batch written");
        Ok(())
    }

    pub async fn apply(&self, plan: SyncPlan) -> Result<(), SyncError> {
        self.write(&plan.into_batch()).await
    }
}
