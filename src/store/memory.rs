use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use super::table::StoreDocument;
use super::{ColumnMap, Row, RowStore, Sheet, StoreError, WriteBatch};

/// Row store kept entirely in memory. Used by tests and dry runs.
///
/// Failures can be injected per call kind so callers can exercise retry and
/// outbox paths without a real backend.
#[derive(Debug)]
pub struct InMemoryRowStore {
    document: Mutex<StoreDocument>,
    max_rows_per_call: usize,
    batch_writes: AtomicUsize,
    appends: AtomicUsize,
    failing_writes: AtomicUsize,
    failing_appends: AtomicUsize,
    passing_appends: AtomicUsize,
    failing_reads: AtomicUsize,
}

impl Default for InMemoryRowStore {
    fn default() -> Self {
        Self::new(500)
    }
}

impl InMemoryRowStore {
    pub fn new(max_rows_per_call: usize) -> Self {
        Self::from_document(StoreDocument::with_default_schema(), max_rows_per_call)
    }

    pub fn from_document(document: StoreDocument, max_rows_per_call: usize) -> Self {
        Self {
            document: Mutex::new(document),
            max_rows_per_call,
            batch_writes: AtomicUsize::new(0),
            appends: AtomicUsize::new(0),
            failing_writes: AtomicUsize::new(0),
            failing_appends: AtomicUsize::new(0),
            passing_appends: AtomicUsize::new(0),
            failing_reads: AtomicUsize::new(0),
        }
    }

    pub async fn seed(&self, sheet: Sheet, row: Row) -> Result<(), StoreError> {
        self.document.lock().await.upsert(sheet, row)
    }

    pub async fn snapshot(&self) -> StoreDocument {
        self.document.lock().await.clone()
    }

    pub async fn set_headers(&self, sheet: Sheet, headers: Vec<String>) {
        self.document.lock().await.set_headers(sheet, headers);
    }

    /// Successful `batch_write` calls so far.
    pub fn batch_write_count(&self) -> usize {
        self.batch_writes.load(Ordering::SeqCst)
    }

    /// Successful `append_rows` calls so far.
    pub fn append_count(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    /// Make the next `n` batch writes fail with a transient error.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_appends(&self, n: usize) {
        self.fail_appends_after(0, n);
    }

    /// Let `ok` appends through, then fail the `n` after them.
    pub fn fail_appends_after(&self, ok: usize, n: usize) {
        self.passing_appends.store(ok, Ordering::SeqCst);
        self.failing_appends.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if Self::take_failure(&self.failing_reads) {
            return Err(StoreError::Transient("injected read failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RowStore for InMemoryRowStore {
    async fn read_row(&self, sheet: Sheet, key: &str) -> Result<Option<Row>, StoreError> {
        self.check_read()?;
        Ok(self.document.lock().await.read_row(sheet, key))
    }

    async fn read_children(
        &self,
        sheet: Sheet,
        parent_column: &str,
        parent_key: &str,
    ) -> Result<Vec<Row>, StoreError> {
        self.check_read()?;
        Ok(self
            .document
            .lock()
            .await
            .read_children(sheet, parent_column, parent_key))
    }

    async fn read_all(&self, sheet: Sheet) -> Result<Vec<Row>, StoreError> {
        self.check_read()?;
        Ok(self.document.lock().await.read_all(sheet))
    }

    async fn column_map(&self, sheet: Sheet) -> Result<ColumnMap, StoreError> {
        Ok(self.document.lock().await.column_map(sheet))
    }

    async fn batch_write(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if Self::take_failure(&self.failing_writes) {
            return Err(StoreError::Transient("injected write failure".to_string()));
        }
        self.document
            .lock()
            .await
            .apply_batch(batch, self.max_rows_per_call)?;
        self.batch_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn append_rows(&self, sheet: Sheet, rows: &[Row]) -> Result<(), StoreError> {
        if !Self::take_failure(&self.passing_appends) && Self::take_failure(&self.failing_appends) {
            return Err(StoreError::Transient("injected append failure".to_string()));
        }
        self.document
            .lock()
            .await
            .append(sheet, rows, self.max_rows_per_call)?;
        self.appends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::units;

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = InMemoryRowStore::default();
        store
            .seed(Sheet::Units, Row::new().with(units::TAG, "SP-01"))
            .await
            .unwrap();

        let mut batch = WriteBatch::new();
        batch.push(Sheet::Units, "SP-01", Row::new().with(units::VERSION, "v1"));

        store.fail_next_writes(1);
        assert!(store.batch_write(&batch).await.unwrap_err().is_transient());
        store.batch_write(&batch).await.unwrap();
        assert_eq!(store.batch_write_count(), 1);

        let row = store.read_row(Sheet::Units, "SP-01").await.unwrap().unwrap();
        assert_eq!(row.get(units::VERSION), Some("v1"));
    }
}
