// Shared fixtures for the occupation engine integration tests
#![allow(dead_code)]

use spooltrack::audit::InMemoryOutbox;
use spooltrack::coordination::{
    ClaimRequest, CoordinatorSettings, OccupationCoordinator, OccupationResponse, ReleaseRequest,
};
use spooltrack::domain::Operation;
use spooltrack::store::schema::{sub_units, units};
use spooltrack::store::{InMemoryRowStore, Row, RowStore, Sheet};
use spooltrack::sync::RetryConfig;
use std::sync::Arc;

pub fn fast_retry(max_attempts: usize) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay_ms: 1,
        max_delay_ms: 4,
        jitter: false,
    }
}

/// Default settings with millisecond backoff.
pub fn fast_settings() -> CoordinatorSettings {
    CoordinatorSettings {
        version_retry: fast_retry(3),
        store_retry: fast_retry(3),
        flush_retry: fast_retry(2),
        ..CoordinatorSettings::default()
    }
}

pub fn union_id(tag: &str, n: usize) -> String {
    format!("{tag}-U{n:02}")
}

pub fn union_ids(tag: &str, range: std::ops::RangeInclusive<usize>) -> Vec<String> {
    range.map(|n| union_id(tag, n)).collect()
}

pub fn unit_row(tag: &str) -> Row {
    Row::new()
        .with(units::TAG, tag)
        .with(units::VERSION, format!("{tag}-v0"))
}

/// Union rows with weights 1.0, 1.5, 2.0 … so sums are easy to check.
pub fn union_rows(tag: &str, count: usize) -> Vec<Row> {
    (1..=count)
        .map(|n| {
            Row::new()
                .with(sub_units::ID, union_id(tag, n))
                .with(sub_units::TAG, tag)
                .with(sub_units::WEIGHT, format!("{:.1}", 0.5 + n as f64 * 0.5))
        })
        .collect()
}

pub async fn seed_spool(store: &InMemoryRowStore, tag: &str, unions: usize) {
    store.seed(Sheet::Units, unit_row(tag)).await.unwrap();
    for row in union_rows(tag, unions) {
        store.seed(Sheet::SubUnits, row).await.unwrap();
    }
}

pub struct Harness {
    pub store: Arc<InMemoryRowStore>,
    pub outbox: Arc<InMemoryOutbox>,
    pub coordinator: OccupationCoordinator,
}

impl Harness {
    pub async fn new(spools: &[(&str, usize)]) -> Self {
        Self::with_settings(spools, fast_settings()).await
    }

    pub async fn with_settings(spools: &[(&str, usize)], settings: CoordinatorSettings) -> Self {
        let store = Arc::new(InMemoryRowStore::default());
        for (tag, unions) in spools {
            seed_spool(&store, tag, *unions).await;
        }
        let outbox = Arc::new(InMemoryOutbox::new());
        let coordinator = OccupationCoordinator::new(store.clone(), outbox.clone(), settings);
        Self {
            store,
            outbox,
            coordinator,
        }
    }

    pub async fn claim(&self, tag: &str, operation: Operation, worker: &str) -> OccupationResponse {
        self.coordinator
            .claim(ClaimRequest::new(tag, operation, worker))
            .await
            .unwrap()
    }

    pub async fn release(
        &self,
        tag: &str,
        operation: Operation,
        worker: &str,
        selected: Vec<String>,
    ) -> OccupationResponse {
        self.coordinator
            .release(ReleaseRequest::new(tag, operation, worker, selected))
            .await
            .unwrap()
    }

    /// Claim and release every union still eligible for `operation`.
    pub async fn finish(&self, tag: &str, operation: Operation, worker: &str, unions: usize) {
        self.claim(tag, operation, worker).await;
        self.release(tag, operation, worker, union_ids(tag, 1..=unions))
            .await;
    }

    pub async fn audit_rows(&self) -> Vec<Row> {
        self.store.read_all(Sheet::Audit).await.unwrap()
    }

    pub async fn unit_row(&self, tag: &str) -> Row {
        self.store.read_row(Sheet::Units, tag).await.unwrap().unwrap()
    }
}

pub fn count_events(rows: &[Row], event_type: &str) -> usize {
    rows.iter()
        .filter(|row| row.get(spooltrack::store::schema::audit::EVENT_TYPE) == Some(event_type))
        .count()
}
