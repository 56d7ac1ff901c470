use serde::Serialize;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::domain::{Operation, SubUnit, WorkUnit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseOutcome {
    /// Every eligible union was selected.
    Complete,
    Partial,
    /// Nothing selected; voluntary cancellation.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReleaseSummary {
    pub outcome: ReleaseOutcome,
    pub selected: usize,
    pub eligible: usize,
    /// Sum of the selected weights, one decimal.
    pub metric_sum: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub operation: Operation,
    pub done: usize,
    pub total: usize,
    pub metric_done: f64,
    pub metric_total: f64,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.done == self.total
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        UnitAggregator::round_metric(self.done as f64 * 100.0 / self.total as f64)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unions not eligible for {operation}: {}", ids.join(", "))]
pub struct IneligibleSelection {
    pub operation: Operation,
    pub ids: Vec<String>,
}

/// Pure completion arithmetic over a spool's unions.
pub struct UnitAggregator;

impl UnitAggregator {
    /// Authoritative eligible set: unions lacking `operation`, and for
    /// welding only those already assembled.
    pub fn eligible_for_operation(unit: &WorkUnit, operation: Operation) -> Vec<&SubUnit> {
        unit.sub_units
            .iter()
            .filter(|sub| match operation {
                Operation::Arm => !sub.is_complete(Operation::Arm),
                Operation::Sold => sub.is_complete(Operation::Arm) && !sub.is_complete(Operation::Sold),
                Operation::Inspection => false,
            })
            .collect()
    }

    /// Check a requested selection against the eligible set. Duplicates are
    /// collapsed; the result keeps the spool's union order.
    pub fn select<'a>(
        unit: &'a WorkUnit,
        operation: Operation,
        requested: &[String],
    ) -> Result<Vec<&'a SubUnit>, IneligibleSelection> {
        let eligible = Self::eligible_for_operation(unit, operation);
        let wanted: BTreeSet<&str> = requested.iter().map(|id| id.trim()).collect();

        let ineligible: Vec<String> = wanted
            .iter()
            .filter(|id| !eligible.iter().any(|sub| sub.id == **id))
            .map(|id| id.to_string())
            .collect();
        if !ineligible.is_empty() {
            return Err(IneligibleSelection {
                operation,
                ids: ineligible,
            });
        }

        Ok(eligible
            .into_iter()
            .filter(|sub| wanted.contains(sub.id.as_str()))
            .collect())
    }

    pub fn summarize(total_eligible: usize, selected: &[&SubUnit]) -> ReleaseSummary {
        let outcome = if selected.is_empty() {
            ReleaseOutcome::Cancelled
        } else if selected.len() >= total_eligible {
            ReleaseOutcome::Complete
        } else {
            ReleaseOutcome::Partial
        };
        ReleaseSummary {
            outcome,
            selected: selected.len(),
            eligible: total_eligible,
            metric_sum: Self::round_metric(selected.iter().map(|sub| sub.weight).sum()),
        }
    }

    pub fn progress(unit: &WorkUnit, operation: Operation) -> Progress {
        let done: Vec<&SubUnit> = unit
            .sub_units
            .iter()
            .filter(|sub| sub.is_complete(operation))
            .collect();
        Progress {
            operation,
            done: done.len(),
            total: unit.sub_units.len(),
            metric_done: Self::round_metric(done.iter().map(|sub| sub.weight).sum()),
            metric_total: Self::round_metric(unit.sub_units.iter().map(|sub| sub.weight).sum()),
        }
    }

    pub fn round_metric(value: f64) -> f64 {
        (value * 10.0).round() / 10.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ActorId, Completion, UnitTag, VersionToken};
    use crate::workflows::OperationState;
    use chrono::Utc;

    fn sub(id: &str, weight: f64, armed: bool, welded: bool) -> SubUnit {
        let done = || {
            Some(Completion {
                at: Utc::now(),
                by: ActorId::from("93"),
            })
        };
        SubUnit {
            id: id.to_string(),
            unit_tag: UnitTag::from("SP-01"),
            weight,
            arm: if armed { done() } else { None },
            sold: if welded { done() } else { None },
        }
    }

    fn unit(sub_units: Vec<SubUnit>) -> WorkUnit {
        WorkUnit {
            tag: UnitTag::from("SP-01"),
            arm_state: OperationState::Pending,
            sold_state: OperationState::Pending,
            inspection_state: OperationState::Pending,
            repair_cycles: 0,
            claimant: None,
            version: VersionToken::default(),
            sub_units,
        }
    }

    #[test]
    fn welding_needs_assembly_first() {
        let u = unit(vec![
            sub("U1", 1.0, true, false),
            sub("U2", 1.0, false, false),
            sub("U3", 1.0, true, true),
        ]);
        let arm: Vec<&str> = UnitAggregator::eligible_for_operation(&u, Operation::Arm)
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        let sold: Vec<&str> = UnitAggregator::eligible_for_operation(&u, Operation::Sold)
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(arm, vec!["U2"]);
        assert_eq!(sold, vec!["U1"]);
        assert!(UnitAggregator::eligible_for_operation(&u, Operation::Inspection).is_empty());
    }

    #[test]
    fn summarize_classifies_outcomes() {
        let a = sub("U1", 2.25, false, false);
        let b = sub("U2", 1.0, false, false);
        assert_eq!(UnitAggregator::summarize(2, &[]).outcome, ReleaseOutcome::Cancelled);
        assert_eq!(UnitAggregator::summarize(2, &[&a]).outcome, ReleaseOutcome::Partial);

        let all = UnitAggregator::summarize(2, &[&a, &b]);
        assert_eq!(all.outcome, ReleaseOutcome::Complete);
        assert_eq!(all.metric_sum, 3.3);
    }

    #[test]
    fn selection_rejects_ineligible_ids() {
        let u = unit(vec![sub("U1", 1.0, true, false), sub("U2", 1.0, false, false)]);
        let err = UnitAggregator::select(&u, Operation::Sold, &["U2".to_string(), "U9".to_string()])
            .unwrap_err();
        assert_eq!(err.ids, vec!["U2".to_string(), "U9".to_string()]);

        let ok = UnitAggregator::select(&u, Operation::Arm, &["U2".to_string(), "U2".to_string()])
            .unwrap();
        assert_eq!(ok.len(), 1);
    }

    #[test]
    fn progress_counts_weights() {
        let u = unit(vec![sub("U1", 1.5, true, false), sub("U2", 2.0, false, false)]);
        let p = UnitAggregator::progress(&u, Operation::Arm);
        assert_eq!((p.done, p.total), (1, 2));
        assert_eq!(p.metric_done, 1.5);
        assert_eq!(p.metric_total, 3.5);
        assert_eq!(p.percent(), 50.0);
        assert!(!p.is_complete());
    }
}
