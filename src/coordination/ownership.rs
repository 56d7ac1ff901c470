use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::locks::KeyedLocks;
use crate::domain::{ActorId, Claimant, Operation, UnitTag, WorkUnit};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClaimKey {
    pub unit_tag: UnitTag,
    pub operation: Operation,
}

impl ClaimKey {
    pub fn new(unit_tag: UnitTag, operation: Operation) -> Self {
        Self {
            unit_tag,
            operation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimRecord {
    pub unit_tag: UnitTag,
    pub operation: Operation,
    pub actor: ActorId,
    pub claimed_at: DateTime<Utc>,
}

impl ClaimRecord {
    pub fn from_claimant(unit_tag: &UnitTag, claimant: &Claimant) -> Self {
        Self {
            unit_tag: unit_tag.clone(),
            operation: claimant.operation,
            actor: claimant.actor.clone(),
            claimed_at: claimant.claimed_at,
        }
    }

    pub fn key(&self) -> ClaimKey {
        ClaimKey::new(self.unit_tag.clone(), self.operation)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OwnershipError {
    #[error("{unit_tag} is not claimed for {operation}")]
    NotClaimed {
        unit_tag: UnitTag,
        operation: Operation,
    },
    #[error("{unit_tag} {operation} is held by worker {claimant}; worker {actor} cannot act on it")]
    Violation {
        unit_tag: UnitTag,
        operation: Operation,
        claimant: ActorId,
        actor: ActorId,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Claims found in the store that were missing in memory.
    pub restored: Vec<ClaimKey>,
    /// In-memory claims the store no longer records.
    pub discarded: Vec<ClaimKey>,
    /// Claims older than the stale threshold. Reported only.
    pub stale: Vec<ClaimRecord>,
    /// Spool rows skipped because they could not be decoded.
    pub unreadable: Vec<String>,
}

/// In-memory mirror of who holds what, plus the per-(spool, operation)
/// serialization locks.
///
/// The store stays the ground truth: every check is made against the
/// claimant read from the store, and the mirror is corrected whenever the
/// two disagree.
#[derive(Debug, Default)]
pub struct OwnershipLock {
    claims: Mutex<HashMap<ClaimKey, ClaimRecord>>,
    key_locks: KeyedLocks<ClaimKey>,
}

impl OwnershipLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize every request for the same spool and operation.
    pub async fn lock_key(&self, key: &ClaimKey) -> OwnedMutexGuard<()> {
        self.key_locks.lock(key).await
    }

    /// Drop key locks nobody holds or waits on.
    pub async fn prune_locks(&self) -> usize {
        self.key_locks.prune().await
    }

    /// Record a claim that was just written to the store.
    pub async fn acquire(&self, record: ClaimRecord) {
        let mut claims = self.claims.lock().await;
        // One claimant per spool: drop whatever the mirror held for it.
        claims.retain(|key, _| key.unit_tag != record.unit_tag);
        debug!(unit_tag = %record.unit_tag, operation = %record.operation, actor = %record.actor, "Claim recorded");
        claims.insert(record.key(), record);
    }

    pub async fn release(&self, key: &ClaimKey) -> Option<ClaimRecord> {
        self.claims.lock().await.remove(key)
    }

    pub async fn holder(&self, key: &ClaimKey) -> Option<ClaimRecord> {
        self.claims.lock().await.get(key).cloned()
    }

    pub async fn claims(&self) -> Vec<ClaimRecord> {
        let mut claims: Vec<ClaimRecord> = self.claims.lock().await.values().cloned().collect();
        claims.sort_by(|a, b| a.key().cmp(&b.key()));
        claims
    }

    /// Check that `actor` holds `unit` for `operation` according to the
    /// store, correcting the mirror from the store on the way.
    pub async fn verify(
        &self,
        unit: &WorkUnit,
        operation: Operation,
        actor: &ActorId,
    ) -> Result<ClaimRecord, OwnershipError> {
        self.sync(unit).await;
        Self::check(unit, operation, actor)
    }

    /// Ownership check against the claimant recorded on `unit`.
    pub fn check(
        unit: &WorkUnit,
        operation: Operation,
        actor: &ActorId,
    ) -> Result<ClaimRecord, OwnershipError> {
        let claimant = unit
            .claimant_for(operation)
            .ok_or_else(|| OwnershipError::NotClaimed {
                unit_tag: unit.tag.clone(),
                operation,
            })?;

        if &claimant.actor != actor {
            warn!(
                unit_tag = %unit.tag,
                operation = %operation,
                claimant = %claimant.actor,
                actor = %actor,
                "Ownership violation"
            );
            return Err(OwnershipError::Violation {
                unit_tag: unit.tag.clone(),
                operation,
                claimant: claimant.actor.clone(),
                actor: actor.clone(),
            });
        }

        Ok(ClaimRecord::from_claimant(&unit.tag, claimant))
    }

    /// Make the mirror agree with the store for one spool.
    pub async fn sync(&self, unit: &WorkUnit) {
        let mut claims = self.claims.lock().await;
        let stored = unit
            .claimant
            .as_ref()
            .map(|claimant| ClaimRecord::from_claimant(&unit.tag, claimant));

        let mirrored: Vec<ClaimKey> = claims
            .keys()
            .filter(|key| key.unit_tag == unit.tag)
            .cloned()
            .collect();
        for key in mirrored {
            if stored.as_ref().map(ClaimRecord::key) != Some(key.clone()) {
                debug!(unit_tag = %key.unit_tag, operation = %key.operation, "Dropping claim the store no longer records");
                claims.remove(&key);
            }
        }
        if let Some(record) = stored {
            claims.insert(record.key(), record);
        }
    }

    /// Rebuild the mirror from every claimant recorded in the store.
    pub async fn reconcile(
        &self,
        recorded: Vec<ClaimRecord>,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> ReconcileReport {
        let mut claims = self.claims.lock().await;
        let mut report = ReconcileReport::default();

        let fresh: HashMap<ClaimKey, ClaimRecord> = recorded
            .into_iter()
            .map(|record| (record.key(), record))
            .collect();

        for (key, record) in claims.iter() {
            if fresh.get(key).map(|r| &r.actor) != Some(&record.actor) {
                report.discarded.push(key.clone());
            }
        }
        for (key, record) in &fresh {
            if claims.get(key).map(|r| &r.actor) != Some(&record.actor) {
                report.restored.push(key.clone());
            }
            if now - record.claimed_at > stale_after {
                report.stale.push(record.clone());
            }
        }

        report.restored.sort();
        report.discarded.sort();
        report.stale.sort_by(|a, b| a.claimed_at.cmp(&b.claimed_at));
        *claims = fresh;
        drop(claims);

        for record in &report.stale {
            warn!(
                unit_tag = %record.unit_tag,
                operation = %record.operation,
                actor = %record.actor,
                claimed_at = %record.claimed_at,
                "Stale claim"
            );
        }
        info!(
            restored = report.restored.len(),
            discarded = report.discarded.len(),
            stale = report.stale.len(),
            "Ownership reconciled with store"
        );
        report
    }
}
