use serde::{Deserialize, Serialize};

use super::errors::OccupationError;
use crate::domain::{ActorId, Operation, UnitTag};
use crate::workflows::OperationState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub unit_tag: UnitTag,
    pub operation: Operation,
    pub actor_id: ActorId,
}

impl ClaimRequest {
    pub fn new(unit_tag: impl Into<String>, operation: Operation, actor_id: impl Into<String>) -> Self {
        Self {
            unit_tag: UnitTag::new(unit_tag),
            operation,
            actor_id: ActorId::new(actor_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub unit_tag: UnitTag,
    pub operation: Operation,
    pub actor_id: ActorId,
    /// Union ids finished during this claim. Empty means cancel.
    #[serde(default)]
    pub selected_subunits: Vec<String>,
}

impl ReleaseRequest {
    pub fn new(
        unit_tag: impl Into<String>,
        operation: Operation,
        actor_id: impl Into<String>,
        selected_subunits: Vec<String>,
    ) -> Self {
        Self {
            unit_tag: UnitTag::new(unit_tag),
            operation,
            actor_id: ActorId::new(actor_id),
            selected_subunits,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub unit_tag: UnitTag,
    pub operation: Operation,
    pub actor_id: ActorId,
    /// Supervisor override: skips the ownership check.
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectionRequest {
    pub unit_tag: UnitTag,
    pub actor_id: ActorId,
    pub verdict: Verdict,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairRequest {
    pub unit_tag: UnitTag,
    pub actor_id: ActorId,
}

pub(crate) fn require_present(unit_tag: &UnitTag, actor_id: &ActorId) -> Result<(), OccupationError> {
    if unit_tag.as_str().trim().is_empty() {
        return Err(OccupationError::InvalidRequest("unit tag is empty".to_string()));
    }
    if actor_id.as_str().trim().is_empty() {
        return Err(OccupationError::InvalidRequest("actor id is empty".to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseOutcome {
    Claimed,
    Complete,
    Partial,
    Cancelled,
    Passed,
    Failed,
    Blocked,
    Repaired,
    Rejected,
}

/// What a caller gets back from every mutating call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OccupationResponse {
    pub outcome: ResponseOutcome,
    pub unit_tag: UnitTag,
    pub operation: Operation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_total: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OccupationResponse {
    pub fn accepted(
        outcome: ResponseOutcome,
        unit_tag: &UnitTag,
        operation: Operation,
        new_state: OperationState,
    ) -> Self {
        Self {
            outcome,
            unit_tag: unit_tag.clone(),
            operation,
            new_state: Some(new_state.to_string()),
            metric_total: None,
            error_code: None,
            message: None,
        }
    }

    pub fn with_metric(mut self, metric: f64) -> Self {
        self.metric_total = Some(metric);
        self
    }

    pub fn rejected(unit_tag: &UnitTag, operation: Operation, err: &OccupationError) -> Self {
        Self {
            outcome: ResponseOutcome::Rejected,
            unit_tag: unit_tag.clone(),
            operation,
            new_state: None,
            metric_total: None,
            error_code: Some(err.error_code()),
            message: Some(err.to_string()),
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.outcome == ResponseOutcome::Rejected
    }
}
