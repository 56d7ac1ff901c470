use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::locks::KeyedLocks;
use crate::domain::{UnitTag, VersionToken};
use crate::store::schema::units;
use crate::store::{RowStore, Sheet, StoreError};
use crate::sync::{BatchSyncWriter, SyncError, SyncPlan};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GuardError {
    #[error("version conflict on {unit_tag}: expected {expected}, found {found}")]
    Conflict {
        unit_tag: UnitTag,
        expected: VersionToken,
        found: VersionToken,
    },
    #[error("spool {0} not found")]
    NotFound(UnitTag),
    #[error("could not read current version: {0}")]
    Read(StoreError),
    #[error(transparent)]
    Write(SyncError),
}

/// Compare-and-swap on a spool row's version token.
///
/// A read up front turns away stale writers early. The deciding check runs
/// inside the store's own write lock, so writers in other processes sharing
/// the store cannot both pass it for the same version.
pub struct VersionGuard {
    store: Arc<dyn RowStore>,
    writer: BatchSyncWriter,
    unit_locks: KeyedLocks<UnitTag>,
}

impl VersionGuard {
    pub fn new(store: Arc<dyn RowStore>, writer: BatchSyncWriter) -> Self {
        Self {
            store,
            writer,
            unit_locks: KeyedLocks::new(),
        }
    }

    pub async fn current_version(&self, unit_tag: &UnitTag) -> Result<VersionToken, GuardError> {
        let row = self
            .store
            .read_row(Sheet::Units, unit_tag.as_str())
            .await
            .map_err(GuardError::Read)?
            .ok_or_else(|| GuardError::NotFound(unit_tag.clone()))?;
        Ok(VersionToken(row.get(units::VERSION).unwrap_or_default().to_string()))
    }

    /// Write `plan` stamped with `next` if the row still carries `expected`.
    ///
    /// Finding `next` already in place means an earlier attempt of this same
    /// write landed, which counts as success.
    pub async fn write(
        &self,
        expected: &VersionToken,
        next: &VersionToken,
        mut plan: SyncPlan,
    ) -> Result<(), GuardError> {
        let unit_tag = plan.unit_tag().clone();
        let _guard = self.unit_locks.lock(&unit_tag).await;

        let found = self.current_version(&unit_tag).await?;
        if &found == next {
            debug!(unit_tag = %unit_tag, version = %next, "Write already applied");
            return Ok(());
        }
        if &found != expected {
            warn!(
                unit_tag = %unit_tag,
                expected = %expected,
                found = %found,
                "Version conflict"
            );
            return Err(GuardError::Conflict {
                unit_tag,
                expected: expected.clone(),
                found,
            });
        }

        plan.guard_version(expected, next);
        match self.writer.apply(plan).await {
            Ok(()) => {}
            Err(SyncError::Conflict { found, .. }) => {
                warn!(
                    unit_tag = %unit_tag,
                    expected = %expected,
                    found = %found,
                    "Version moved between check and write"
                );
                return Err(GuardError::Conflict {
                    unit_tag,
                    expected: expected.clone(),
                    found: VersionToken(found),
                });
            }
            Err(err) => return Err(GuardError::Write(err)),
        }
        debug!(unit_tag = %unit_tag, version = %next, "Version advanced");
        Ok(())
    }

    pub async fn prune_locks(&self) -> usize {
        self.unit_locks.prune().await
    }
}
