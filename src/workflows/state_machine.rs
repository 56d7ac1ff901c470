// Spool Lifecycle State Machine
//
// One closed enum of states, one closed enum of events, and a single pure
// transition function per operation. Callers get back the next state plus the
// list of side effects the coordinator has to carry out; nothing in here
// touches the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::audit::EventType;
use crate::domain::Operation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    Pending,
    Claimed,
    /// Some unions finished, nobody holds the spool.
    InProgress,
    Done,
    /// Failed inspection `cycle` times and waits for a repair.
    Repair { cycle: u8 },
    RepairClaimed { cycle: u8 },
    /// Repair cap exceeded; needs resolution outside the engine.
    Blocked,
}

impl OperationState {
    pub fn is_claimed(&self) -> bool {
        matches!(self, OperationState::Claimed | OperationState::RepairClaimed { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Done | OperationState::Blocked)
    }
}

impl Default for OperationState {
    fn default() -> Self {
        OperationState::Pending
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationState::Pending => f.write_str("PENDING"),
            OperationState::Claimed => f.write_str("CLAIMED"),
            OperationState::InProgress => f.write_str("IN_PROGRESS"),
            OperationState::Done => f.write_str("DONE"),
            OperationState::Repair { cycle } => write!(f, "REPAIR({cycle})"),
            OperationState::RepairClaimed { cycle } => write!(f, "REPAIR_CLAIMED({cycle})"),
            OperationState::Blocked => f.write_str("BLOCKED"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognised operation state '{0}'")]
pub struct ParseStateError(pub String);

impl FromStr for OperationState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let parse_cycle = |prefix: &str| -> Option<u8> {
            raw.strip_prefix(prefix)?
                .strip_suffix(')')?
                .parse::<u8>()
                .ok()
        };

        match raw {
            "" | "PENDING" => Ok(OperationState::Pending),
            "CLAIMED" => Ok(OperationState::Claimed),
            "IN_PROGRESS" => Ok(OperationState::InProgress),
            "DONE" => Ok(OperationState::Done),
            "BLOCKED" => Ok(OperationState::Blocked),
            _ => {
                if let Some(cycle) = parse_cycle("REPAIR_CLAIMED(") {
                    Ok(OperationState::RepairClaimed { cycle })
                } else if let Some(cycle) = parse_cycle("REPAIR(") {
                    Ok(OperationState::Repair { cycle })
                } else {
                    Err(ParseStateError(raw.to_string()))
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationEvent {
    Claim,
    ReleasePartial,
    ReleaseComplete,
    /// Worker released with nothing selected.
    Cancel,
    /// Supervisor override for abandoned claims.
    AdminCancel,
    InspectionPassed,
    InspectionFailed,
    RepairCompleted,
    /// Cross-operation trigger fired when welding reaches 100%.
    TriggerInspection,
}

impl fmt::Display for OperationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationEvent::Claim => "CLAIM",
            OperationEvent::ReleasePartial => "RELEASE_PARTIAL",
            OperationEvent::ReleaseComplete => "RELEASE_COMPLETE",
            OperationEvent::Cancel => "CANCEL",
            OperationEvent::AdminCancel => "ADMIN_CANCEL",
            OperationEvent::InspectionPassed => "INSPECTION_PASSED",
            OperationEvent::InspectionFailed => "INSPECTION_FAILED",
            OperationEvent::RepairCompleted => "REPAIR_COMPLETED",
            OperationEvent::TriggerInspection => "TRIGGER_INSPECTION",
        };
        f.write_str(name)
    }
}

/// Side effects requested by a transition. The coordinator turns these into
/// cell updates and audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    CreateClaim,
    DestroyClaim,
    /// Stamp completion on every selected union (one granular event each).
    StampSubUnits,
    PersistProgress,
    TriggerInspection,
    IncrementRepairCycle,
    Audit(EventType),
}

/// Facts about the spool the transition table needs for its guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransitionContext {
    /// Unions with assembly already stamped.
    pub arm_complete: usize,
    /// Unions currently eligible for the operation being transitioned.
    pub eligible: usize,
    /// Unions of this operation already stamped before this event.
    pub completed_before: usize,
    /// Unions that will still lack this operation once the event is applied.
    pub remaining_after: usize,
    pub sold_done: bool,
    pub repair_cycles: u8,
    pub repair_cycle_cap: u8,
    pub inspection_trigger: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: OperationState,
    pub to: OperationState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn new(from: OperationState, to: OperationState, effects: Vec<Effect>) -> Self {
        Self { from, to, effects }
    }

    pub fn has_effect(&self, effect: Effect) -> bool {
        self.effects.contains(&effect)
    }

    pub fn audit_events(&self) -> impl Iterator<Item = EventType> + '_ {
        self.effects.iter().filter_map(|effect| match effect {
            Effect::Audit(event_type) => Some(*event_type),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("{operation} is already claimed")]
    AlreadyClaimed { operation: Operation },
    #[error("cannot {event} {operation}: {reason}")]
    PreconditionNotMet {
        operation: Operation,
        event: OperationEvent,
        reason: String,
    },
    #[error("{operation} is in terminal state {state}")]
    TerminalState {
        operation: Operation,
        state: OperationState,
    },
    #[error("{event} is not valid for {operation} in state {state}")]
    InvalidEvent {
        operation: Operation,
        state: OperationState,
        event: OperationEvent,
    },
}

/// Pure transition function: (operation, state, event, guards) → next state.
pub fn transition(
    operation: Operation,
    state: OperationState,
    event: OperationEvent,
    ctx: &TransitionContext,
) -> Result<Transition, TransitionError> {
    match operation {
        Operation::Arm | Operation::Sold => production_transition(operation, state, event, ctx),
        Operation::Inspection => inspection_transition(state, event, ctx),
    }
}

fn production_transition(
    operation: Operation,
    state: OperationState,
    event: OperationEvent,
    ctx: &TransitionContext,
) -> Result<Transition, TransitionError> {
    use OperationState::*;

    let invalid = || TransitionError::InvalidEvent {
        operation,
        state,
        event,
    };

    if state.is_terminal() && event != OperationEvent::AdminCancel {
        return Err(TransitionError::TerminalState { operation, state });
    }

    match (state, event) {
        (Pending | InProgress, OperationEvent::Claim) => {
            if operation == Operation::Sold && ctx.arm_complete == 0 {
                return Err(TransitionError::PreconditionNotMet {
                    operation,
                    event,
                    reason: "no union has assembly (ARM) completed yet".to_string(),
                });
            }
            if ctx.eligible == 0 {
                return Err(TransitionError::PreconditionNotMet {
                    operation,
                    event,
                    reason: "no unions are eligible for this operation".to_string(),
                });
            }
            Ok(Transition::new(
                state,
                Claimed,
                vec![Effect::CreateClaim, Effect::Audit(EventType::Claimed)],
            ))
        }
        (Claimed, OperationEvent::Claim) => Err(TransitionError::AlreadyClaimed { operation }),
        (Claimed, OperationEvent::ReleasePartial) => Ok(Transition::new(
            state,
            InProgress,
            vec![
                Effect::DestroyClaim,
                Effect::StampSubUnits,
                Effect::PersistProgress,
                Effect::Audit(EventType::ReleasedPartial),
            ],
        )),
        (Claimed, OperationEvent::ReleaseComplete) => {
            let mut effects = vec![
                Effect::DestroyClaim,
                Effect::StampSubUnits,
                Effect::PersistProgress,
                Effect::Audit(EventType::ReleasedComplete),
            ];
            // Every eligible union was selected, but welding can only be done
            // once assembly caught up with the whole spool.
            let next = if ctx.remaining_after == 0 {
                if operation == Operation::Sold && ctx.inspection_trigger {
                    effects.push(Effect::TriggerInspection);
                }
                Done
            } else {
                InProgress
            };
            Ok(Transition::new(state, next, effects))
        }
        (Claimed, OperationEvent::Cancel | OperationEvent::AdminCancel) => {
            let next = if ctx.completed_before == 0 {
                Pending
            } else {
                InProgress
            };
            Ok(Transition::new(
                state,
                next,
                vec![Effect::DestroyClaim, Effect::Audit(EventType::Cancelled)],
            ))
        }
        _ => Err(invalid()),
    }
}

fn inspection_transition(
    state: OperationState,
    event: OperationEvent,
    ctx: &TransitionContext,
) -> Result<Transition, TransitionError> {
    use OperationState::*;
    let operation = Operation::Inspection;

    if state.is_terminal() {
        return Err(TransitionError::TerminalState { operation, state });
    }

    match (state, event) {
        (Pending, OperationEvent::TriggerInspection) => Ok(Transition::new(
            state,
            Pending,
            vec![Effect::Audit(EventType::InspectionPending)],
        )),
        (Pending, OperationEvent::Claim) => {
            if !ctx.sold_done {
                return Err(TransitionError::PreconditionNotMet {
                    operation,
                    event,
                    reason: "welding (SOLD) is not complete".to_string(),
                });
            }
            Ok(Transition::new(
                state,
                Claimed,
                vec![Effect::CreateClaim, Effect::Audit(EventType::Claimed)],
            ))
        }
        (Repair { cycle }, OperationEvent::Claim) => Ok(Transition::new(
            state,
            RepairClaimed { cycle },
            vec![Effect::CreateClaim, Effect::Audit(EventType::Claimed)],
        )),
        (Claimed | RepairClaimed { .. }, OperationEvent::Claim) => {
            Err(TransitionError::AlreadyClaimed { operation })
        }
        (Claimed, OperationEvent::InspectionPassed) => Ok(Transition::new(
            state,
            Done,
            vec![
                Effect::DestroyClaim,
                Effect::Audit(EventType::InspectionPassed),
            ],
        )),
        (Claimed, OperationEvent::InspectionFailed) => {
            let cycle = ctx.repair_cycles.saturating_add(1);
            let mut effects = vec![
                Effect::DestroyClaim,
                Effect::IncrementRepairCycle,
                Effect::Audit(EventType::InspectionFailed),
            ];
            let next = if cycle > ctx.repair_cycle_cap {
                effects.push(Effect::Audit(EventType::Blocked));
                Blocked
            } else {
                Repair { cycle }
            };
            Ok(Transition::new(state, next, effects))
        }
        (RepairClaimed { .. }, OperationEvent::RepairCompleted) => Ok(Transition::new(
            state,
            Pending,
            vec![
                Effect::DestroyClaim,
                Effect::Audit(EventType::RepairCompleted),
            ],
        )),
        (Claimed, OperationEvent::Cancel | OperationEvent::AdminCancel) => Ok(Transition::new(
            state,
            Pending,
            vec![Effect::DestroyClaim, Effect::Audit(EventType::Cancelled)],
        )),
        (RepairClaimed { cycle }, OperationEvent::Cancel | OperationEvent::AdminCancel) => {
            Ok(Transition::new(
                state,
                Repair { cycle },
                vec![Effect::DestroyClaim, Effect::Audit(EventType::Cancelled)],
            ))
        }
        _ => Err(TransitionError::InvalidEvent {
            operation,
            state,
            event,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TransitionContext {
        TransitionContext {
            arm_complete: 0,
            eligible: 10,
            completed_before: 0,
            remaining_after: 10,
            sold_done: false,
            repair_cycles: 0,
            repair_cycle_cap: 3,
            inspection_trigger: true,
        }
    }

    #[test]
    fn test_arm_claim_from_pending() {
        let t = transition(Operation::Arm, OperationState::Pending, OperationEvent::Claim, &ctx())
            .unwrap();
        assert_eq!(t.to, OperationState::Claimed);
        assert!(t.has_effect(Effect::CreateClaim));
        assert_eq!(t.audit_events().collect::<Vec<_>>(), vec![EventType::Claimed]);
    }

    #[test]
    fn test_claim_on_claimed_is_rejected() {
        let err = transition(Operation::Arm, OperationState::Claimed, OperationEvent::Claim, &ctx())
            .unwrap_err();
        assert_eq!(err, TransitionError::AlreadyClaimed { operation: Operation::Arm });
    }

    #[test]
    fn test_sold_claim_requires_an_armed_union() {
        let err = transition(Operation::Sold, OperationState::Pending, OperationEvent::Claim, &ctx())
            .unwrap_err();
        assert!(matches!(err, TransitionError::PreconditionNotMet { .. }));

        let armed = TransitionContext { arm_complete: 1, eligible: 1, ..ctx() };
        let t = transition(Operation::Sold, OperationState::Pending, OperationEvent::Claim, &armed)
            .unwrap();
        assert_eq!(t.to, OperationState::Claimed);
    }

    #[test]
    fn test_claim_with_nothing_eligible_is_rejected() {
        let empty = TransitionContext { eligible: 0, ..ctx() };
        let err = transition(Operation::Arm, OperationState::InProgress, OperationEvent::Claim, &empty)
            .unwrap_err();
        assert!(matches!(err, TransitionError::PreconditionNotMet { .. }));
    }

    #[test]
    fn test_done_is_terminal() {
        let err = transition(Operation::Arm, OperationState::Done, OperationEvent::Claim, &ctx())
            .unwrap_err();
        assert_eq!(
            err,
            TransitionError::TerminalState {
                operation: Operation::Arm,
                state: OperationState::Done
            }
        );
    }

    #[test]
    fn test_partial_release_moves_to_in_progress() {
        let t = transition(
            Operation::Arm,
            OperationState::Claimed,
            OperationEvent::ReleasePartial,
            &ctx(),
        )
        .unwrap();
        assert_eq!(t.to, OperationState::InProgress);
        assert!(t.has_effect(Effect::DestroyClaim));
        assert!(t.has_effect(Effect::StampSubUnits));
    }

    #[test]
    fn test_complete_release_reaches_done() {
        let finished = TransitionContext { remaining_after: 0, ..ctx() };
        let t = transition(
            Operation::Arm,
            OperationState::Claimed,
            OperationEvent::ReleaseComplete,
            &finished,
        )
        .unwrap();
        assert_eq!(t.to, OperationState::Done);
        assert!(!t.has_effect(Effect::TriggerInspection));
    }

    #[test]
    fn test_sold_completion_triggers_inspection() {
        let finished = TransitionContext { remaining_after: 0, ..ctx() };
        let t = transition(
            Operation::Sold,
            OperationState::Claimed,
            OperationEvent::ReleaseComplete,
            &finished,
        )
        .unwrap();
        assert_eq!(t.to, OperationState::Done);
        assert!(t.has_effect(Effect::TriggerInspection));

        let disabled = TransitionContext { inspection_trigger: false, ..finished };
        let t = transition(
            Operation::Sold,
            OperationState::Claimed,
            OperationEvent::ReleaseComplete,
            &disabled,
        )
        .unwrap();
        assert!(!t.has_effect(Effect::TriggerInspection));
    }

    #[test]
    fn test_sold_complete_with_unarmed_unions_stays_in_progress() {
        let waiting = TransitionContext { remaining_after: 4, ..ctx() };
        let t = transition(
            Operation::Sold,
            OperationState::Claimed,
            OperationEvent::ReleaseComplete,
            &waiting,
        )
        .unwrap();
        assert_eq!(t.to, OperationState::InProgress);
        assert!(!t.has_effect(Effect::TriggerInspection));
    }

    #[test]
    fn test_cancel_reverts_to_pending_without_prior_progress() {
        let t = transition(Operation::Arm, OperationState::Claimed, OperationEvent::Cancel, &ctx())
            .unwrap();
        assert_eq!(t.to, OperationState::Pending);

        let started = TransitionContext { completed_before: 6, ..ctx() };
        let t = transition(
            Operation::Arm,
            OperationState::Claimed,
            OperationEvent::AdminCancel,
            &started,
        )
        .unwrap();
        assert_eq!(t.to, OperationState::InProgress);
    }

    #[test]
    fn test_release_without_claim_is_invalid() {
        let err = transition(
            Operation::Arm,
            OperationState::Pending,
            OperationEvent::ReleasePartial,
            &ctx(),
        )
        .unwrap_err();
        assert!(matches!(err, TransitionError::InvalidEvent { .. }));
    }

    #[test]
    fn test_inspection_claim_requires_sold_done() {
        let err = transition(
            Operation::Inspection,
            OperationState::Pending,
            OperationEvent::Claim,
            &ctx(),
        )
        .unwrap_err();
        assert!(matches!(err, TransitionError::PreconditionNotMet { .. }));

        let welded = TransitionContext { sold_done: true, ..ctx() };
        let t = transition(
            Operation::Inspection,
            OperationState::Pending,
            OperationEvent::Claim,
            &welded,
        )
        .unwrap();
        assert_eq!(t.to, OperationState::Claimed);
    }

    #[test]
    fn test_repair_cycle_is_bounded() {
        let mut cycles = 0u8;
        let mut state = OperationState::Claimed;
        for expected in 1..=3u8 {
            let c = TransitionContext { repair_cycles: cycles, ..ctx() };
            let t = transition(Operation::Inspection, state, OperationEvent::InspectionFailed, &c)
                .unwrap();
            assert_eq!(t.to, OperationState::Repair { cycle: expected });
            cycles = expected;

            // repair and go back through inspection
            let t = transition(Operation::Inspection, t.to, OperationEvent::Claim, &c).unwrap();
            assert_eq!(t.to, OperationState::RepairClaimed { cycle: expected });
            let t = transition(Operation::Inspection, t.to, OperationEvent::RepairCompleted, &c)
                .unwrap();
            assert_eq!(t.to, OperationState::Pending);
            state = OperationState::Claimed;
        }

        let c = TransitionContext { repair_cycles: cycles, ..ctx() };
        let t = transition(Operation::Inspection, state, OperationEvent::InspectionFailed, &c)
            .unwrap();
        assert_eq!(t.to, OperationState::Blocked);
        assert!(t.audit_events().any(|e| e == EventType::Blocked));

        let err = transition(Operation::Inspection, t.to, OperationEvent::Claim, &c).unwrap_err();
        assert!(matches!(err, TransitionError::TerminalState { .. }));
    }

    #[test]
    fn test_repair_cancel_returns_to_repair() {
        let t = transition(
            Operation::Inspection,
            OperationState::RepairClaimed { cycle: 2 },
            OperationEvent::Cancel,
            &ctx(),
        )
        .unwrap();
        assert_eq!(t.to, OperationState::Repair { cycle: 2 });
    }

    #[test]
    fn test_state_text_round_trips() {
        for state in [
            OperationState::Pending,
            OperationState::Claimed,
            OperationState::InProgress,
            OperationState::Done,
            OperationState::Repair { cycle: 2 },
            OperationState::RepairClaimed { cycle: 3 },
            OperationState::Blocked,
        ] {
            assert_eq!(state.to_string().parse::<OperationState>(), Ok(state));
        }
        assert_eq!("".parse::<OperationState>(), Ok(OperationState::Pending));
        assert!("REPAIR(x)".parse::<OperationState>().is_err());
    }

    #[test]
    fn test_transition_is_deterministic() {
        let c = TransitionContext { remaining_after: 0, ..ctx() };
        let a = transition(Operation::Sold, OperationState::Claimed, OperationEvent::ReleaseComplete, &c);
        let b = transition(Operation::Sold, OperationState::Claimed, OperationEvent::ReleaseComplete, &c);
        assert_eq!(a, b);
    }
}
