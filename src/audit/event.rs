use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::{ActorId, Operation, UnitTag};
use crate::store::schema::{self, audit};
use crate::store::Row;

/// Fixed enumeration of audit event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Claimed,
    ReleasedPartial,
    ReleasedComplete,
    Cancelled,
    /// Granular event, one per union touched by a release.
    #[serde(rename = "SUBUNIT_COMPLETED")]
    SubUnitCompleted,
    InspectionPending,
    InspectionPassed,
    InspectionFailed,
    RepairCompleted,
    Blocked,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Claimed => "CLAIMED",
            EventType::ReleasedPartial => "RELEASED_PARTIAL",
            EventType::ReleasedComplete => "RELEASED_COMPLETE",
            EventType::Cancelled => "CANCELLED",
            EventType::SubUnitCompleted => "SUBUNIT_COMPLETED",
            EventType::InspectionPending => "INSPECTION_PENDING",
            EventType::InspectionPassed => "INSPECTION_PASSED",
            EventType::InspectionFailed => "INSPECTION_FAILED",
            EventType::RepairCompleted => "REPAIR_COMPLETED",
            EventType::Blocked => "BLOCKED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The request that caused an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Claim,
    Release,
    Cancel,
    AdminCancel,
    Inspect,
    Repair,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Claim => "CLAIM",
            AuditAction::Release => "RELEASE",
            AuditAction::Cancel => "CANCEL",
            AuditAction::AdminCancel => "ADMIN_CANCEL",
            AuditAction::Inspect => "INSPECT",
            AuditAction::Repair => "REPAIR",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub unit_tag: UnitTag,
    pub actor: ActorId,
    pub operation: Operation,
    pub action: AuditAction,
    pub business_date: NaiveDate,
    pub payload: serde_json::Value,
    pub sub_unit_id: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        unit_tag: UnitTag,
        operation: Operation,
        actor: ActorId,
        action: AuditAction,
        timestamp: DateTime<Utc>,
        utc_offset_minutes: i32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            business_date: business_date(&timestamp, utc_offset_minutes),
            timestamp,
            event_type,
            unit_tag,
            actor,
            operation,
            action,
            payload: serde_json::Value::Null,
            sub_unit_id: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_sub_unit(mut self, id: impl Into<String>) -> Self {
        self.sub_unit_id = Some(id.into());
        self
    }

    pub fn to_row(&self) -> Row {
        let payload = match &self.payload {
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        };
        Row::new()
            .with(audit::ID, self.id.as_str())
            .with(audit::TIMESTAMP, schema::format_timestamp(&self.timestamp))
            .with(audit::EVENT_TYPE, self.event_type.as_str())
            .with(audit::TAG, self.unit_tag.as_str())
            .with(audit::ACTOR_ID, self.actor.as_str())
            .with(audit::OPERATION, self.operation.as_str())
            .with(audit::ACTION, self.action.as_str())
            .with(audit::BUSINESS_DATE, self.business_date.format("%Y-%m-%d").to_string())
            .with(audit::PAYLOAD, payload)
            .with(audit::SUB_UNIT_ID, self.sub_unit_id.clone().unwrap_or_default())
    }
}

/// Calendar date of the plant's working day for an instant.
pub fn business_date(at: &DateTime<Utc>, utc_offset_minutes: i32) -> NaiveDate {
    match FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60)) {
        Some(offset) => at.with_timezone(&offset).date_naive(),
        None => at.date_naive(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn business_date_follows_plant_offset() {
        let late_evening = Utc.with_ymd_and_hms(2026, 10, 20, 1, 30, 0).unwrap();
        assert_eq!(
            business_date(&late_evening, -180),
            NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
        );
        assert_eq!(
            business_date(&late_evening, 0),
            NaiveDate::from_ymd_opt(2026, 10, 20).unwrap()
        );
    }

    #[test]
    fn event_row_uses_audit_columns() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let event = AuditEvent::new(
            EventType::SubUnitCompleted,
            UnitTag::from("SP-01"),
            Operation::Arm,
            ActorId::from("93"),
            AuditAction::Release,
            at,
            -180,
        )
        .with_sub_unit("U3")
        .with_payload(serde_json::json!({ "weight": 2.5 }));

        let row = event.to_row();
        assert_eq!(row.get(audit::EVENT_TYPE), Some("SUBUNIT_COMPLETED"));
        assert_eq!(row.get(audit::BUSINESS_DATE), Some("2026-10-19"));
        assert_eq!(row.get(audit::SUB_UNIT_ID), Some("U3"));
        assert_eq!(row.get(audit::PAYLOAD), Some(r#"{"weight":2.5}"#));
    }

    #[test]
    fn event_type_serializes_to_fixed_names() {
        let json = serde_json::to_string(&EventType::SubUnitCompleted).unwrap();
        assert_eq!(json, "\"SUBUNIT_COMPLETED\"");
        let json = serde_json::to_string(&EventType::ReleasedPartial).unwrap();
        assert_eq!(json, "\"RELEASED_PARTIAL\"");
    }
}
