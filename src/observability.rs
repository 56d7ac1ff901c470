use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Counters for the occupation engine, owned by the coordinator.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub claims: AtomicU64,
    pub releases: AtomicU64,
    pub cancellations: AtomicU64,
    pub rejections: AtomicU64,
    pub version_conflicts: AtomicU64,
    pub retries: AtomicU64,
    pub store_failures: AtomicU64,
    pub audit_flush_failures: AtomicU64,
    pub audit_events_flushed: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_claim(&self) {
        self.claims.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_version_conflict(&self) {
        self.version_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retries(&self, count: u64) {
        self.retries.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_audit_flush_failure(&self) {
        self.audit_flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_audit_flushed(&self, events: u64) {
        self.audit_events_flushed.fetch_add(events, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> EngineStats {
        EngineStats {
            claims: self.claims.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            version_conflicts: self.version_conflicts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            audit_flush_failures: self.audit_flush_failures.load(Ordering::Relaxed),
            audit_events_flushed: self.audit_events_flushed.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            claims = stats.claims,
            releases = stats.releases,
            cancellations = stats.cancellations,
            rejections = stats.rejections,
            version_conflicts = stats.version_conflicts,
            retries = stats.retries,
            store_failures = stats.store_failures,
            audit_flush_failures = stats.audit_flush_failures,
            "Engine metrics"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub claims: u64,
    pub releases: u64,
    pub cancellations: u64,
    pub rejections: u64,
    pub version_conflicts: u64,
    pub retries: u64,
    pub store_failures: u64,
    pub audit_flush_failures: u64,
    pub audit_events_flushed: u64,
}

/// Time an operation and log its duration when finished
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        info!(
            operation = self.operation,
            duration_ms = self.start.elapsed().as_millis() as u64,
            "Operation completed"
        );
    }
}
