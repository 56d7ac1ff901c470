// File Store Integration Tests
// Two engine instances sharing one store document, and startup reconciliation

mod fixtures;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use fixtures::{count_events, fast_settings, union_ids, union_rows, unit_row};
use spooltrack::audit::FileOutbox;
use spooltrack::coordination::{CancelRequest, ClaimKey, ClaimRequest, OccupationCoordinator, ReleaseRequest};
use spooltrack::domain::{ActorId, Operation, UnitTag};
use spooltrack::store::schema::units;
use spooltrack::store::{ColumnMap, FileRowStore, Row, RowStore, Sheet, StoreError, WriteBatch};

async fn seeded_store(dir: &TempDir, spools: &[(&str, usize)]) -> FileRowStore {
    let store = FileRowStore::new(dir.path().join("store.json"), 500);
    store.init().await.unwrap();
    for (tag, unions) in spools {
        store.seed(Sheet::Units, unit_row(tag)).await.unwrap();
        for row in union_rows(tag, *unions) {
            store.seed(Sheet::SubUnits, row).await.unwrap();
        }
    }
    store
}

/// An engine instance with its own store handle and outbox file.
fn instance(dir: &TempDir, name: &str) -> OccupationCoordinator {
    let store = FileRowStore::new(dir.path().join("store.json"), 500);
    let outbox = FileOutbox::new(dir.path().join(format!("{name}-outbox.json")));
    OccupationCoordinator::new(Arc::new(store), Arc::new(outbox), fast_settings())
}

#[tokio::test]
async fn second_instance_sees_the_first_instances_claim() {
    let dir = TempDir::new().unwrap();
    seeded_store(&dir, &[("SP-60", 3)]).await;
    let tablet_a = instance(&dir, "a");
    let tablet_b = instance(&dir, "b");

    tablet_a
        .claim(ClaimRequest::new("SP-60", Operation::Arm, "93"))
        .await
        .unwrap();

    let err = tablet_b
        .claim(ClaimRequest::new("SP-60", Operation::Arm, "45"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "ALREADY_CLAIMED");
    assert!(err.to_string().contains("93"));

    // Tablet B never saw the claim happen, yet the owner can release through it.
    let released = tablet_b
        .release(ReleaseRequest::new("SP-60", Operation::Arm, "93", union_ids("SP-60", 1..=3)))
        .await
        .unwrap();
    assert_eq!(released.new_state.as_deref(), Some("DONE"));
}

#[tokio::test]
async fn state_survives_a_reopen() {
    let dir = TempDir::new().unwrap();
    seeded_store(&dir, &[("SP-61", 2)]).await;

    {
        let coordinator = instance(&dir, "first");
        coordinator
            .claim(ClaimRequest::new("SP-61", Operation::Arm, "93"))
            .await
            .unwrap();
        coordinator
            .release(ReleaseRequest::new("SP-61", Operation::Arm, "93", union_ids("SP-61", 1..=1)))
            .await
            .unwrap();
    }

    let reopened = FileRowStore::new(dir.path().join("store.json"), 500);
    let row = reopened.read_row(Sheet::Units, "SP-61").await.unwrap().unwrap();
    assert_eq!(row.get(units::ARM_STATE), Some("IN_PROGRESS"));
    assert_eq!(row.get(units::ARM_UNIONS_DONE), Some("1"));
    assert_eq!(reopened.read_all(Sheet::Audit).await.unwrap().len(), 3);

    let status = instance(&dir, "second")
        .status(&UnitTag::from("SP-61"))
        .await
        .unwrap();
    assert_eq!(status.eligible[&Operation::Sold], vec![union_ids("SP-61", 1..=1)[0].clone()]);
}

#[tokio::test]
async fn startup_restores_and_reports_abandoned_claims() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store(&dir, &[("SP-62", 2), ("SP-63", 2)]).await;
    store
        .seed(
            Sheet::Units,
            unit_row("SP-62")
                .with(units::ARM_STATE, "CLAIMED")
                .with(units::OCCUPIED_BY, "93")
                .with(units::OCCUPIED_OPERATION, "ARM")
                .with(units::OCCUPIED_AT, "2026-01-05T07:30:00Z"),
        )
        .await
        .unwrap();

    let coordinator = instance(&dir, "supervisor");
    let report = coordinator.startup().await.unwrap();
    assert_eq!(
        report.reconcile.restored,
        vec![ClaimKey::new(UnitTag::from("SP-62"), Operation::Arm)]
    );
    assert_eq!(report.reconcile.stale.len(), 1);
    assert_eq!(report.reconcile.stale[0].actor, ActorId::from("93"));
    assert!(report.reconcile.unreadable.is_empty());

    let cancelled = coordinator
        .cancel(CancelRequest {
            unit_tag: UnitTag::from("SP-62"),
            operation: Operation::Arm,
            actor_id: ActorId::from("S1"),
            admin: true,
            reason: Some("claim left open over the weekend".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(cancelled.new_state.as_deref(), Some("PENDING"));
    assert!(coordinator.claims().await.is_empty());

    let again = coordinator.reconcile().await.unwrap();
    assert!(again.restored.is_empty());
    assert!(again.stale.is_empty());
}

#[tokio::test]
async fn unreadable_claimant_is_skipped_not_fatal() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store(&dir, &[("SP-64", 1), ("SP-65", 1)]).await;
    store
        .seed(
            Sheet::Units,
            unit_row("SP-64").with(units::OCCUPIED_BY, "93"),
        )
        .await
        .unwrap();

    let report = instance(&dir, "a").reconcile().await.unwrap();
    assert_eq!(report.unreadable, vec!["SP-64".to_string()]);
    assert!(report.restored.is_empty());
}

/// File store whose batch writes wait before taking the file lock, so two
/// instances both read the old version before either writes.
struct SlowWrites {
    inner: FileRowStore,
}

#[async_trait]
impl RowStore for SlowWrites {
    async fn read_row(&self, sheet: Sheet, key: &str) -> Result<Option<Row>, StoreError> {
        self.inner.read_row(sheet, key).await
    }

    async fn read_children(
        &self,
        sheet: Sheet,
        parent_column: &str,
        parent_key: &str,
    ) -> Result<Vec<Row>, StoreError> {
        self.inner
            .read_children(sheet, parent_column, parent_key)
            .await
    }

    async fn read_all(&self, sheet: Sheet) -> Result<Vec<Row>, StoreError> {
        self.inner.read_all(sheet).await
    }

    async fn column_map(&self, sheet: Sheet) -> Result<ColumnMap, StoreError> {
        self.inner.column_map(sheet).await
    }

    async fn batch_write(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        tokio::time::sleep(Duration::from_millis(150)).await;
        self.inner.batch_write(batch).await
    }

    async fn append_rows(&self, sheet: Sheet, rows: &[Row]) -> Result<(), StoreError> {
        self.inner.append_rows(sheet, rows).await
    }
}

fn slow_instance(dir: &TempDir, name: &str) -> OccupationCoordinator {
    let store = SlowWrites {
        inner: FileRowStore::new(dir.path().join("store.json"), 500),
    };
    let outbox = FileOutbox::new(dir.path().join(format!("{name}-outbox.json")));
    OccupationCoordinator::new(Arc::new(store), Arc::new(outbox), fast_settings())
}

#[tokio::test]
async fn racing_instances_cannot_both_claim() {
    let dir = TempDir::new().unwrap();
    seeded_store(&dir, &[("SP-66", 2)]).await;
    let tablet_a = slow_instance(&dir, "a");
    let tablet_b = slow_instance(&dir, "b");

    let (a, b) = tokio::join!(
        tablet_a.claim(ClaimRequest::new("SP-66", Operation::Arm, "93")),
        tablet_b.claim(ClaimRequest::new("SP-66", Operation::Arm, "45")),
    );

    let (winner, loser) = match (&a, &b) {
        (Ok(_), Err(err)) => ("93", err),
        (Err(err), Ok(_)) => ("45", err),
        other => panic!("expected exactly one claim to win, got {other:?}"),
    };
    assert_eq!(loser.error_code(), "ALREADY_CLAIMED");
    assert!(loser.to_string().contains(winner));

    let store = FileRowStore::new(dir.path().join("store.json"), 500);
    let row = store.read_row(Sheet::Units, "SP-66").await.unwrap().unwrap();
    assert_eq!(row.get(units::OCCUPIED_BY), Some(winner));
    let audit = store.read_all(Sheet::Audit).await.unwrap();
    assert_eq!(count_events(&audit, "CLAIMED"), 1);
}
