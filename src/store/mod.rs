// Row Store Interface
//
// The external spreadsheet-like store is the durable source of truth. The
// engine only reads rows, writes batches of cells addressed by column NAME,
// and appends audit rows. Positional access never leaves this module.

pub mod file;
pub mod memory;
pub mod rate_limited;
pub mod schema;
pub mod table;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

pub use file::FileRowStore;
pub use memory::InMemoryRowStore;
pub use rate_limited::RateLimitedStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sheet {
    Units,
    SubUnits,
    Audit,
}

impl Sheet {
    pub const ALL: [Sheet; 3] = [Sheet::Units, Sheet::SubUnits, Sheet::Audit];

    pub fn name(&self) -> &'static str {
        match self {
            Sheet::Units => "units",
            Sheet::SubUnits => "sub_units",
            Sheet::Audit => "audit",
        }
    }

    /// Column holding the unique row key.
    pub fn key_column(&self) -> &'static str {
        match self {
            Sheet::Units => schema::units::TAG,
            Sheet::SubUnits => schema::sub_units::ID,
            Sheet::Audit => schema::audit::ID,
        }
    }

    pub fn default_headers(&self) -> &'static [&'static str] {
        match self {
            Sheet::Units => schema::units::HEADERS,
            Sheet::SubUnits => schema::sub_units::HEADERS,
            Sheet::Audit => schema::audit::HEADERS,
        }
    }
}

impl fmt::Display for Sheet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One row, as a map from column name to cell text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    cells: BTreeMap<String, String>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, value: impl Into<String>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: &str, value: impl Into<String>) {
        self.cells.insert(column.to_string(), value.into());
    }

    /// Cell text, with blank cells treated as absent.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells
            .get(column)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.keys().map(String::as_str)
    }

    pub fn cells(&self) -> &BTreeMap<String, String> {
        &self.cells
    }

    pub fn merge(&mut self, other: &Row) {
        for (column, value) in &other.cells {
            self.cells.insert(column.clone(), value.clone());
        }
    }
}

impl FromIterator<(String, String)> for Row {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            cells: iter.into_iter().collect(),
        }
    }
}

/// Header row of a sheet: column name → position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    headers: Vec<String>,
    index: HashMap<String, usize>,
}

impl ColumnMap {
    pub fn from_headers<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let headers: Vec<String> = headers.into_iter().map(Into::into).collect();
        let index = headers
            .iter()
            .enumerate()
            .map(|(position, name)| (name.clone(), position))
            .collect();
        Self { headers, index }
    }

    pub fn index_of(&self, column: &str) -> Option<usize> {
        self.index.get(column).copied()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.index.contains_key(column)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Fail loudly on a column that is not in the sheet.
    pub fn require(&self, sheet: Sheet, column: &str) -> Result<usize, StoreError> {
        self.index_of(column).ok_or_else(|| StoreError::UnknownColumn {
            sheet,
            column: column.to_string(),
        })
    }
}

/// Cell updates for one existing row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowUpdate {
    pub sheet: Sheet,
    pub key: String,
    pub cells: Row,
}

/// Compare-and-swap condition on a spool row's VERSION cell. The store
/// evaluates it under the same lock that applies the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCheck {
    pub key: String,
    pub expected: String,
    /// Token the batch writes. Finding it already in place means the batch
    /// landed earlier and is not applied again.
    pub next: String,
}

/// A set of row updates the store applies all-or-nothing in one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    updates: Vec<RowUpdate>,
    version_check: Option<VersionCheck>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sheet: Sheet, key: impl Into<String>, cells: Row) {
        let key = key.into();
        if let Some(existing) = self
            .updates
            .iter_mut()
            .find(|update| update.sheet == sheet && update.key == key)
        {
            existing.cells.merge(&cells);
        } else {
            self.updates.push(RowUpdate { sheet, key, cells });
        }
    }

    pub fn updates(&self) -> &[RowUpdate] {
        &self.updates
    }

    /// Apply only while the spool row `key` still carries `expected`.
    pub fn require_version(
        &mut self,
        key: impl Into<String>,
        expected: impl Into<String>,
        next: impl Into<String>,
    ) {
        self.version_check = Some(VersionCheck {
            key: key.into(),
            expected: expected.into(),
            next: next.into(),
        });
    }

    pub fn version_check(&self) -> Option<&VersionCheck> {
        self.version_check.as_ref()
    }

    pub fn get(&self, sheet: Sheet, key: &str) -> Option<&RowUpdate> {
        self.updates
            .iter()
            .find(|update| update.sheet == sheet && update.key == key)
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("row '{key}' not found in sheet {sheet}")]
    RowNotFound { sheet: Sheet, key: String },

    #[error("column '{column}' does not exist in sheet {sheet}")]
    UnknownColumn { sheet: Sheet, column: String },

    #[error("{rows} rows exceed the per-call limit of {limit}")]
    RowLimitExceeded { rows: usize, limit: usize },

    #[error("malformed row '{key}' in sheet {sheet}: {reason}")]
    Malformed {
        sheet: Sheet,
        key: String,
        reason: String,
    },

    #[error("spool '{key}' is at version '{found}', expected '{expected}'")]
    VersionMismatch {
        key: String,
        expected: String,
        found: String,
    },

    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("store I/O error: {0}")]
    Io(String),

    #[error("store rejected the request: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Io(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Rejected(format!("unreadable store document: {err}"))
    }
}

/// Operations the engine needs from the external row store.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Read a single row by its key column.
    async fn read_row(&self, sheet: Sheet, key: &str) -> Result<Option<Row>, StoreError>;

    /// Read every row whose `parent_column` equals `parent_key`.
    async fn read_children(
        &self,
        sheet: Sheet,
        parent_column: &str,
        parent_key: &str,
    ) -> Result<Vec<Row>, StoreError>;

    async fn read_all(&self, sheet: Sheet) -> Result<Vec<Row>, StoreError>;

    async fn column_map(&self, sheet: Sheet) -> Result<ColumnMap, StoreError>;

    /// Apply every update in the batch, or none of them. A batch carrying a
    /// [`VersionCheck`] fails with [`StoreError::VersionMismatch`] when the
    /// spool row has moved on.
    async fn batch_write(&self, batch: &WriteBatch) -> Result<(), StoreError>;

    async fn append_rows(&self, sheet: Sheet, rows: &[Row]) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_cells_read_as_absent() {
        let row = Row::new().with("A", "  ").with("B", "x");
        assert_eq!(row.get("A"), None);
        assert_eq!(row.get("B"), Some("x"));
        assert_eq!(row.get("C"), None);
    }

    #[test]
    fn column_map_requires_known_columns() {
        let map = ColumnMap::from_headers(["TAG_SPOOL", "VERSION"]);
        assert_eq!(map.index_of("VERSION"), Some(1));
        assert_eq!(
            map.require(Sheet::Units, "NOPE"),
            Err(StoreError::UnknownColumn {
                sheet: Sheet::Units,
                column: "NOPE".to_string()
            })
        );
    }

    #[test]
    fn write_batch_merges_updates_for_the_same_row() {
        let mut batch = WriteBatch::new();
        batch.push(Sheet::Units, "SP-01", Row::new().with("A", "1"));
        batch.push(Sheet::Units, "SP-01", Row::new().with("B", "2"));
        batch.push(Sheet::SubUnits, "U1", Row::new().with("A", "3"));

        assert_eq!(batch.len(), 2);
        let unit = batch.get(Sheet::Units, "SP-01").unwrap();
        assert_eq!(unit.cells.get("A"), Some("1"));
        assert_eq!(unit.cells.get("B"), Some("2"));
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(StoreError::Transient("quota".into()).is_transient());
        assert!(StoreError::Io("reset".into()).is_transient());
        assert!(!StoreError::Rejected("bad".into()).is_transient());
        assert!(!StoreError::RowLimitExceeded { rows: 2, limit: 1 }.is_transient());
        assert!(!StoreError::VersionMismatch {
            key: "SP-01".into(),
            expected: "v1".into(),
            found: "v2".into()
        }
        .is_transient());
    }
}
