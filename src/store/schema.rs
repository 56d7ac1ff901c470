//! Column names for every sheet the engine touches, plus row ↔ domain codecs.
//!
//! Rows are always addressed by column name. If the store's header row stops
//! matching these names, writes fail with [`StoreError::UnknownColumn`]
//! instead of landing in the wrong cell.

use chrono::{DateTime, SecondsFormat, Utc};

use super::{Row, Sheet, StoreError};
use crate::domain::{ActorId, Claimant, Completion, Operation, SubUnit, UnitTag, VersionToken, WorkUnit};
use crate::workflows::OperationState;

/// Column mappings for the spool sheet.
pub mod units {
    /// Unique spool tag (key)
    pub const TAG: &str = "TAG_SPOOL";
    pub const ARM_STATE: &str = "ARM_STATE";
    pub const SOLD_STATE: &str = "SOLD_STATE";
    pub const INSPECTION_STATE: &str = "INSPECTION_STATE";
    pub const REPAIR_CYCLES: &str = "REPAIR_CYCLES";
    /// Worker currently holding the spool
    pub const OCCUPIED_BY: &str = "OCCUPIED_BY";
    pub const OCCUPIED_AT: &str = "OCCUPIED_AT";
    pub const OCCUPIED_OPERATION: &str = "OCCUPIED_OPERATION";
    /// Optimistic-concurrency token
    pub const VERSION: &str = "VERSION";
    pub const TOTAL_UNIONS: &str = "TOTAL_UNIONS";
    pub const ARM_UNIONS_DONE: &str = "ARM_UNIONS_DONE";
    pub const SOLD_UNIONS_DONE: &str = "SOLD_UNIONS_DONE";
    pub const ARM_METRIC: &str = "ARM_METRIC";
    pub const SOLD_METRIC: &str = "SOLD_METRIC";
    pub const UPDATED_AT: &str = "UPDATED_AT";

    pub const HEADERS: &[&str] = &[
        TAG,
        ARM_STATE,
        SOLD_STATE,
        INSPECTION_STATE,
        REPAIR_CYCLES,
        OCCUPIED_BY,
        OCCUPIED_AT,
        OCCUPIED_OPERATION,
        VERSION,
        TOTAL_UNIONS,
        ARM_UNIONS_DONE,
        SOLD_UNIONS_DONE,
        ARM_METRIC,
        SOLD_METRIC,
        UPDATED_AT,
    ];
}

/// Column mappings for the union sheet.
pub mod sub_units {
    /// Union id (key)
    pub const ID: &str = "ID";
    /// Parent spool tag
    pub const TAG: &str = "TAG_SPOOL";
    /// Diameter-inches
    pub const WEIGHT: &str = "WEIGHT";
    pub const ARM_COMPLETED_AT: &str = "ARM_COMPLETED_AT";
    pub const ARM_WORKER: &str = "ARM_WORKER";
    pub const SOLD_COMPLETED_AT: &str = "SOLD_COMPLETED_AT";
    pub const SOLD_WORKER: &str = "SOLD_WORKER";

    pub const HEADERS: &[&str] = &[
        ID,
        TAG,
        WEIGHT,
        ARM_COMPLETED_AT,
        ARM_WORKER,
        SOLD_COMPLETED_AT,
        SOLD_WORKER,
    ];
}

/// Column mappings for the append-only audit sheet.
pub mod audit {
    pub const ID: &str = "ID";
    pub const TIMESTAMP: &str = "TIMESTAMP";
    pub const EVENT_TYPE: &str = "EVENT_TYPE";
    pub const TAG: &str = "TAG_SPOOL";
    pub const ACTOR_ID: &str = "ACTOR_ID";
    pub const OPERATION: &str = "OPERATION";
    pub const ACTION: &str = "ACTION";
    pub const BUSINESS_DATE: &str = "BUSINESS_DATE";
    pub const PAYLOAD: &str = "PAYLOAD";
    pub const SUB_UNIT_ID: &str = "SUB_UNIT_ID";

    pub const HEADERS: &[&str] = &[
        ID,
        TIMESTAMP,
        EVENT_TYPE,
        TAG,
        ACTOR_ID,
        OPERATION,
        ACTION,
        BUSINESS_DATE,
        PAYLOAD,
        SUB_UNIT_ID,
    ];
}

pub fn state_column(operation: Operation) -> &'static str {
    match operation {
        Operation::Arm => units::ARM_STATE,
        Operation::Sold => units::SOLD_STATE,
        Operation::Inspection => units::INSPECTION_STATE,
    }
}

/// (unions done, metric done) counter columns; inspection has none.
pub fn progress_columns(operation: Operation) -> Option<(&'static str, &'static str)> {
    match operation {
        Operation::Arm => Some((units::ARM_UNIONS_DONE, units::ARM_METRIC)),
        Operation::Sold => Some((units::SOLD_UNIONS_DONE, units::SOLD_METRIC)),
        Operation::Inspection => None,
    }
}

/// (completed-at, worker) stamp columns on the union sheet.
pub fn stamp_columns(operation: Operation) -> Option<(&'static str, &'static str)> {
    match operation {
        Operation::Arm => Some((sub_units::ARM_COMPLETED_AT, sub_units::ARM_WORKER)),
        Operation::Sold => Some((sub_units::SOLD_COMPLETED_AT, sub_units::SOLD_WORKER)),
        Operation::Inspection => None,
    }
}

pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn format_metric(value: f64) -> String {
    format!("{value:.1}")
}

fn malformed(sheet: Sheet, key: &str, reason: String) -> StoreError {
    StoreError::Malformed {
        sheet,
        key: key.to_string(),
        reason,
    }
}

fn parse_timestamp(sheet: Sheet, key: &str, column: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| malformed(sheet, key, format!("{column}: {err}")))
}

fn parse_state(key: &str, row: &Row, column: &str) -> Result<OperationState, StoreError> {
    row.get(column)
        .unwrap_or_default()
        .parse::<OperationState>()
        .map_err(|err| malformed(Sheet::Units, key, format!("{column}: {err}")))
}

pub fn decode_sub_unit(row: &Row) -> Result<SubUnit, StoreError> {
    let id = row
        .get(sub_units::ID)
        .ok_or_else(|| malformed(Sheet::SubUnits, "", "missing union id".to_string()))?
        .to_string();
    let unit_tag = row
        .get(sub_units::TAG)
        .ok_or_else(|| malformed(Sheet::SubUnits, &id, "missing parent spool tag".to_string()))?;

    let weight = match row.get(sub_units::WEIGHT) {
        None => 0.0,
        Some(raw) => raw
            .replace(',', ".")
            .parse::<f64>()
            .map_err(|_| malformed(Sheet::SubUnits, &id, format!("weight '{raw}' is not a number")))?,
    };

    let completion = |at_column: &str, by_column: &str| -> Result<Option<Completion>, StoreError> {
        match row.get(at_column) {
            None => Ok(None),
            Some(raw) => Ok(Some(Completion {
                at: parse_timestamp(Sheet::SubUnits, &id, at_column, raw)?,
                by: ActorId::new(row.get(by_column).unwrap_or_default()),
            })),
        }
    };

    Ok(SubUnit {
        unit_tag: UnitTag::from(unit_tag),
        weight,
        arm: completion(sub_units::ARM_COMPLETED_AT, sub_units::ARM_WORKER)?,
        sold: completion(sub_units::SOLD_COMPLETED_AT, sub_units::SOLD_WORKER)?,
        id,
    })
}

/// Claimant recorded on a spool row, if any.
pub fn decode_claimant(row: &Row) -> Result<Option<Claimant>, StoreError> {
    let key = row.get(units::TAG).unwrap_or_default();
    let Some(actor) = row.get(units::OCCUPIED_BY) else {
        return Ok(None);
    };

    let operation = row
        .get(units::OCCUPIED_OPERATION)
        .ok_or_else(|| malformed(Sheet::Units, key, "occupied without an operation".to_string()))?
        .parse::<Operation>()
        .map_err(|err| malformed(Sheet::Units, key, err.to_string()))?;
    let claimed_at = row
        .get(units::OCCUPIED_AT)
        .ok_or_else(|| malformed(Sheet::Units, key, "occupied without a timestamp".to_string()))
        .and_then(|raw| parse_timestamp(Sheet::Units, key, units::OCCUPIED_AT, raw))?;

    Ok(Some(Claimant {
        actor: ActorId::from(actor),
        operation,
        claimed_at,
    }))
}

pub fn decode_work_unit(row: &Row, children: &[Row]) -> Result<WorkUnit, StoreError> {
    let key = row
        .get(units::TAG)
        .ok_or_else(|| malformed(Sheet::Units, "", "missing spool tag".to_string()))?;

    let repair_cycles = match row.get(units::REPAIR_CYCLES) {
        None => 0,
        Some(raw) => raw
            .parse::<u8>()
            .map_err(|_| malformed(Sheet::Units, key, format!("repair cycles '{raw}' is not a count")))?,
    };

    let mut sub_units = children
        .iter()
        .map(decode_sub_unit)
        .collect::<Result<Vec<_>, _>>()?;
    sub_units.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(WorkUnit {
        tag: UnitTag::from(key),
        arm_state: parse_state(key, row, units::ARM_STATE)?,
        sold_state: parse_state(key, row, units::SOLD_STATE)?,
        inspection_state: parse_state(key, row, units::INSPECTION_STATE)?,
        repair_cycles,
        claimant: decode_claimant(row)?,
        version: VersionToken(row.get(units::VERSION).unwrap_or_default().to_string()),
        sub_units,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn union_row(id: &str, weight: &str) -> Row {
        Row::new()
            .with(sub_units::ID, id)
            .with(sub_units::TAG, "SP-01")
            .with(sub_units::WEIGHT, weight)
    }

    #[test]
    fn decodes_a_fresh_spool() {
        let row = Row::new().with(units::TAG, "SP-01");
        let children = vec![union_row("U2", "2,5"), union_row("U1", "1.5")];

        let unit = decode_work_unit(&row, &children).unwrap();
        assert_eq!(unit.tag, UnitTag::from("SP-01"));
        assert_eq!(unit.arm_state, OperationState::Pending);
        assert_eq!(unit.claimant, None);
        assert_eq!(unit.version, VersionToken::default());
        assert_eq!(unit.sub_units[0].id, "U1");
        assert_eq!(unit.sub_units[1].weight, 2.5);
    }

    #[test]
    fn decodes_claimant_and_completions() {
        let row = Row::new()
            .with(units::TAG, "SP-01")
            .with(units::ARM_STATE, "CLAIMED")
            .with(units::OCCUPIED_BY, "93")
            .with(units::OCCUPIED_OPERATION, "ARM")
            .with(units::OCCUPIED_AT, "2026-10-19T08:00:00Z")
            .with(units::VERSION, "v1");
        let child = union_row("U1", "1")
            .with(sub_units::ARM_COMPLETED_AT, "2026-10-19T09:00:00Z")
            .with(sub_units::ARM_WORKER, "93");

        let unit = decode_work_unit(&row, &[child]).unwrap();
        let claimant = unit.claimant.unwrap();
        assert_eq!(claimant.actor, ActorId::from("93"));
        assert_eq!(claimant.operation, Operation::Arm);
        assert!(unit.sub_units[0].is_complete(Operation::Arm));
        assert!(!unit.sub_units[0].is_complete(Operation::Sold));
    }

    #[test]
    fn occupied_row_without_operation_is_malformed() {
        let row = Row::new()
            .with(units::TAG, "SP-01")
            .with(units::OCCUPIED_BY, "93");
        assert!(matches!(
            decode_claimant(&row),
            Err(StoreError::Malformed { .. })
        ));
    }

    #[test]
    fn bad_weight_is_malformed() {
        assert!(decode_sub_unit(&union_row("U1", "two")).is_err());
        assert_eq!(decode_sub_unit(&union_row("U1", "")).unwrap().weight, 0.0);
    }
}
