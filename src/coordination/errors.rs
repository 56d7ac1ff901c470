use thiserror::Error;

use super::aggregator::IneligibleSelection;
use super::ownership::OwnershipError;
use crate::domain::{ActorId, Operation, UnitTag};
use crate::workflows::{OperationState, TransitionError};

/// Typed rejection of a claim, release, cancel or inspection call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OccupationError {
    #[error("spool {0} not found")]
    NotFound(UnitTag),

    #[error("{unit_tag} is already claimed by worker {holder} for {held_for}")]
    AlreadyClaimed {
        unit_tag: UnitTag,
        holder: ActorId,
        held_for: Operation,
    },

    #[error("{unit_tag} is not claimed for {operation}")]
    NotClaimed {
        unit_tag: UnitTag,
        operation: Operation,
    },

    #[error("{unit_tag} {operation} is held by worker {claimant}; worker {actor} cannot act on it")]
    OwnershipViolation {
        unit_tag: UnitTag,
        operation: Operation,
        claimant: ActorId,
        actor: ActorId,
    },

    #[error("cannot proceed with {operation} on {unit_tag}: {reason}")]
    PreconditionNotMet {
        unit_tag: UnitTag,
        operation: Operation,
        reason: String,
    },

    #[error("{operation} on {unit_tag} is in terminal state {state}")]
    TerminalState {
        unit_tag: UnitTag,
        operation: Operation,
        state: OperationState,
    },

    #[error("unions not eligible for {operation} on {unit_tag}: {}", ids.join(", "))]
    IneligibleSubUnits {
        unit_tag: UnitTag,
        operation: Operation,
        ids: Vec<String>,
    },

    #[error("version conflict on {unit_tag} after {attempts} attempt(s)")]
    VersionConflict { unit_tag: UnitTag, attempts: usize },

    #[error("store write failed for {unit_tag}: {reason}")]
    StoreWriteFailed { unit_tag: UnitTag, reason: String },

    #[error("store read failed: {0}")]
    StoreReadFailed(String),

    #[error("audit outbox unavailable: {0}")]
    AuditWriteFailed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl OccupationError {
    /// Stable code carried in responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            OccupationError::NotFound(_) => "NOT_FOUND",
            OccupationError::AlreadyClaimed { .. } => "ALREADY_CLAIMED",
            OccupationError::NotClaimed { .. } => "NOT_CLAIMED",
            OccupationError::OwnershipViolation { .. } => "OWNERSHIP_VIOLATION",
            OccupationError::PreconditionNotMet { .. } => "PRECONDITION_NOT_MET",
            OccupationError::TerminalState { .. } => "TERMINAL_STATE",
            OccupationError::IneligibleSubUnits { .. } => "INELIGIBLE_SUBUNITS",
            OccupationError::VersionConflict { .. } => "VERSION_CONFLICT",
            OccupationError::StoreWriteFailed { .. } => "STORE_WRITE_FAILED",
            OccupationError::StoreReadFailed(_) => "STORE_READ_FAILED",
            OccupationError::AuditWriteFailed(_) => "AUDIT_WRITE_FAILED",
            OccupationError::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }

    /// Only version conflicts are worth another attempt from a fresh read.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OccupationError::VersionConflict { .. })
    }

    pub fn from_transition(unit_tag: &UnitTag, err: TransitionError) -> Self {
        match err {
            TransitionError::AlreadyClaimed { operation } => OccupationError::PreconditionNotMet {
                unit_tag: unit_tag.clone(),
                operation,
                reason: format!("{operation} is already claimed"),
            },
            TransitionError::PreconditionNotMet {
                operation, reason, ..
            } => OccupationError::PreconditionNotMet {
                unit_tag: unit_tag.clone(),
                operation,
                reason,
            },
            TransitionError::TerminalState { operation, state } => OccupationError::TerminalState {
                unit_tag: unit_tag.clone(),
                operation,
                state,
            },
            TransitionError::InvalidEvent {
                operation,
                state,
                event,
            } => {
                if state.is_claimed() {
                    OccupationError::PreconditionNotMet {
                        unit_tag: unit_tag.clone(),
                        operation,
                        reason: format!("{event} is not valid while {state}"),
                    }
                } else {
                    OccupationError::NotClaimed {
                        unit_tag: unit_tag.clone(),
                        operation,
                    }
                }
            }
        }
    }

    pub fn from_selection(unit_tag: &UnitTag, err: IneligibleSelection) -> Self {
        OccupationError::IneligibleSubUnits {
            unit_tag: unit_tag.clone(),
            operation: err.operation,
            ids: err.ids,
        }
    }
}

impl From<OwnershipError> for OccupationError {
    fn from(err: OwnershipError) -> Self {
        match err {
            OwnershipError::NotClaimed {
                unit_tag,
                operation,
            } => OccupationError::NotClaimed {
                unit_tag,
                operation,
            },
            OwnershipError::Violation {
                unit_tag,
                operation,
                claimant,
                actor,
            } => OccupationError::OwnershipViolation {
                unit_tag,
                operation,
                claimant,
                actor,
            },
        }
    }
}
