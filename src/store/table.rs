use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::schema::units;
use super::{ColumnMap, Row, Sheet, StoreError, WriteBatch};

/// Header row plus data rows of one sheet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetTable {
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

impl SheetTable {
    fn for_sheet(sheet: Sheet) -> Self {
        Self {
            headers: sheet
                .default_headers()
                .iter()
                .map(|header| header.to_string())
                .collect(),
            rows: Vec::new(),
        }
    }

    fn position(&self, sheet: Sheet, key: &str) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| row.get(sheet.key_column()) == Some(key))
    }

    fn check_columns(&self, sheet: Sheet, row: &Row) -> Result<(), StoreError> {
        let map = ColumnMap::from_headers(self.headers.iter().cloned());
        for column in row.columns() {
            map.require(sheet, column)?;
        }
        Ok(())
    }
}

/// Every sheet of a store, in a shape that serializes to a single JSON
/// document. Shared by the in-memory and file-backed stores.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub sheets: BTreeMap<Sheet, SheetTable>,
}

impl StoreDocument {
    pub fn with_default_schema() -> Self {
        Self {
            sheets: Sheet::ALL
                .iter()
                .map(|sheet| (*sheet, SheetTable::for_sheet(*sheet)))
                .collect(),
        }
    }

    fn table_mut(&mut self, sheet: Sheet) -> &mut SheetTable {
        self.sheets
            .entry(sheet)
            .or_insert_with(|| SheetTable::for_sheet(sheet))
    }

    pub fn read_row(&self, sheet: Sheet, key: &str) -> Option<Row> {
        let table = self.sheets.get(&sheet)?;
        table.position(sheet, key).map(|index| table.rows[index].clone())
    }

    pub fn read_children(&self, sheet: Sheet, parent_column: &str, parent_key: &str) -> Vec<Row> {
        self.sheets
            .get(&sheet)
            .map(|table| {
                table
                    .rows
                    .iter()
                    .filter(|row| row.get(parent_column) == Some(parent_key))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn read_all(&self, sheet: Sheet) -> Vec<Row> {
        self.sheets
            .get(&sheet)
            .map(|table| table.rows.clone())
            .unwrap_or_default()
    }

    pub fn column_map(&self, sheet: Sheet) -> ColumnMap {
        match self.sheets.get(&sheet) {
            Some(table) => ColumnMap::from_headers(table.headers.iter().cloned()),
            None => ColumnMap::from_headers(sheet.default_headers().iter().copied()),
        }
    }

    /// Validate the whole batch, then apply it. Nothing is written when any
    /// update is invalid or the batch's version check fails.
    pub fn apply_batch(&mut self, batch: &WriteBatch, max_rows: usize) -> Result<(), StoreError> {
        if batch.len() > max_rows {
            return Err(StoreError::RowLimitExceeded {
                rows: batch.len(),
                limit: max_rows,
            });
        }

        if let Some(check) = batch.version_check() {
            let row = self
                .read_row(Sheet::Units, &check.key)
                .ok_or_else(|| StoreError::RowNotFound {
                    sheet: Sheet::Units,
                    key: check.key.clone(),
                })?;
            let found = row.get(units::VERSION).unwrap_or_default();
            if found == check.next {
                return Ok(());
            }
            if found != check.expected {
                return Err(StoreError::VersionMismatch {
                    key: check.key.clone(),
                    expected: check.expected.clone(),
                    found: found.to_string(),
                });
            }
        }

        let mut targets = Vec::with_capacity(batch.len());
        for update in batch.updates() {
            let table = self.table_mut(update.sheet);
            table.check_columns(update.sheet, &update.cells)?;
            let index = table
                .position(update.sheet, &update.key)
                .ok_or_else(|| StoreError::RowNotFound {
                    sheet: update.sheet,
                    key: update.key.clone(),
                })?;
            targets.push(index);
        }

        for (update, index) in batch.updates().iter().zip(targets) {
            self.table_mut(update.sheet).rows[index].merge(&update.cells);
        }
        Ok(())
    }

    pub fn append(&mut self, sheet: Sheet, rows: &[Row], max_rows: usize) -> Result<(), StoreError> {
        if rows.len() > max_rows {
            return Err(StoreError::RowLimitExceeded {
                rows: rows.len(),
                limit: max_rows,
            });
        }
        let table = self.table_mut(sheet);
        for row in rows {
            table.check_columns(sheet, row)?;
        }
        table.rows.extend(rows.iter().cloned());
        Ok(())
    }

    /// Seed a row, replacing any row with the same key.
    pub fn upsert(&mut self, sheet: Sheet, row: Row) -> Result<(), StoreError> {
        let table = self.table_mut(sheet);
        table.check_columns(sheet, &row)?;
        let key = row
            .get(sheet.key_column())
            .map(str::to_string)
            .ok_or_else(|| StoreError::Malformed {
                sheet,
                key: String::new(),
                reason: format!("missing key column {}", sheet.key_column()),
            })?;
        match table.position(sheet, &key) {
            Some(index) => table.rows[index] = row,
            None => table.rows.push(row),
        }
        Ok(())
    }

    /// Change the header row of a sheet, e.g. to simulate schema drift.
    pub fn set_headers(&mut self, sheet: Sheet, headers: Vec<String>) {
        self.table_mut(sheet).headers = headers;
    }
}
