use async_trait::async_trait;
use fd_lock::RwLock;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::table::StoreDocument;
use super::{ColumnMap, Row, RowStore, Sheet, StoreError, WriteBatch};

/// Row store persisted as a single JSON document on local disk.
///
/// Every call takes an advisory lock on a sibling `.lock` file, so several
/// engine processes can share one document. Writes go to a temporary file
/// that is then renamed over the original.
#[derive(Debug, Clone)]
pub struct FileRowStore {
    path: PathBuf,
    lock_path: PathBuf,
    max_rows_per_call: usize,
}

enum Access {
    Shared,
    Exclusive,
}

impl FileRowStore {
    pub fn new(path: impl Into<PathBuf>, max_rows_per_call: usize) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self {
            path,
            lock_path,
            max_rows_per_call,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the document with the default headers if it does not exist yet.
    pub async fn init(&self) -> Result<(), StoreError> {
        self.with_document(Access::Exclusive, |_| Ok(((), true)))
            .await
    }

    /// Insert or replace a row, bypassing batch limits. Meant for seeding.
    pub async fn seed(&self, sheet: Sheet, row: Row) -> Result<(), StoreError> {
        self.with_document(Access::Exclusive, move |doc| {
            doc.upsert(sheet, row)?;
            Ok(((), true))
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<StoreDocument, StoreError> {
        self.with_document(Access::Shared, |doc| Ok((doc.clone(), false)))
            .await
    }

    /// Run `f` against the loaded document under the file lock. When `f`
    /// reports the document dirty it is saved before the lock is dropped.
    async fn with_document<T, F>(&self, access: Access, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreDocument) -> Result<(T, bool), StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();

        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let lock_file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            let mut lock = RwLock::new(lock_file);

            match access {
                Access::Shared => {
                    let _guard = lock.read()?;
                    let mut doc = load(&path)?;
                    let (value, _) = f(&mut doc)?;
                    Ok(value)
                }
                Access::Exclusive => {
                    let _guard = lock.write()?;
                    let mut doc = load(&path)?;
                    let (value, dirty) = f(&mut doc)?;
                    if dirty {
                        save(&path, &doc)?;
                    }
                    Ok(value)
                }
            }
        })
        .await
        .map_err(|err| StoreError::Io(format!("store task failed: {err}")))?
    }
}

fn load(path: &Path) -> Result<StoreDocument, StoreError> {
    if !path.exists() {
        debug!(path = ?path, "Store document missing, starting from default schema");
        return Ok(StoreDocument::with_default_schema());
    }
    let file = File::open(path)?;
    let doc: StoreDocument = serde_json::from_reader(std::io::BufReader::new(file))?;
    Ok(doc)
}

fn save(path: &Path, doc: &StoreDocument) -> Result<(), StoreError> {
    let serialized = serde_json::to_string_pretty(doc)
        .map_err(|err| StoreError::Rejected(err.to_string()))?;
    let temp = path.with_extension("json.tmp");
    fs::write(&temp, serialized)?;
    fs::rename(&temp, path)?;
    Ok(())
}

#[async_trait]
impl RowStore for FileRowStore {
    async fn read_row(&self, sheet: Sheet, key: &str) -> Result<Option<Row>, StoreError> {
        let key = key.to_string();
        self.with_document(Access::Shared, move |doc| Ok((doc.read_row(sheet, &key), false)))
            .await
    }

    async fn read_children(
        &self,
        sheet: Sheet,
        parent_column: &str,
        parent_key: &str,
    ) -> Result<Vec<Row>, StoreError> {
        let column = parent_column.to_string();
        let key = parent_key.to_string();
        self.with_document(Access::Shared, move |doc| {
            Ok((doc.read_children(sheet, &column, &key), false))
        })
        .await
    }

    async fn read_all(&self, sheet: Sheet) -> Result<Vec<Row>, StoreError> {
        self.with_document(Access::Shared, move |doc| Ok((doc.read_all(sheet), false)))
            .await
    }

    async fn column_map(&self, sheet: Sheet) -> Result<ColumnMap, StoreError> {
        self.with_document(Access::Shared, move |doc| Ok((doc.column_map(sheet), false)))
            .await
    }

    async fn batch_write(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let batch = batch.clone();
        let limit = self.max_rows_per_call;
        self.with_document(Access::Exclusive, move |doc| {
            doc.apply_batch(&batch, limit)?;
            Ok(((), true))
        })
        .await
    }

    async fn append_rows(&self, sheet: Sheet, rows: &[Row]) -> Result<(), StoreError> {
        let rows = rows.to_vec();
        let limit = self.max_rows_per_call;
        self.with_document(Access::Exclusive, move |doc| {
            doc.append(sheet, &rows, limit)?;
            Ok(((), true))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::units;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_survive_a_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");

        let store = FileRowStore::new(&path, 10);
        store
            .seed(Sheet::Units, Row::new().with(units::TAG, "SP-01"))
            .await
            .unwrap();
        let mut batch = WriteBatch::new();
        batch.push(Sheet::Units, "SP-01", Row::new().with(units::VERSION, "v7"));
        store.batch_write(&batch).await.unwrap();

        let reopened = FileRowStore::new(&path, 10);
        let row = reopened.read_row(Sheet::Units, "SP-01").await.unwrap().unwrap();
        assert_eq!(row.get(units::VERSION), Some("v7"));
    }

    #[tokio::test]
    async fn missing_document_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileRowStore::new(dir.path().join("absent.json"), 10);
        assert!(store.read_all(Sheet::Units).await.unwrap().is_empty());
        assert!(store.column_map(Sheet::Units).await.unwrap().contains(units::VERSION));
    }
}
