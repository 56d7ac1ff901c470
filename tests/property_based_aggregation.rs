// Property-Based Testing for Union Aggregation
// Eligibility, release classification and metric arithmetic over random spools

mod fixtures;

use chrono::Utc;
use proptest::prelude::*;
use std::collections::HashSet;

use spooltrack::coordination::{ReleaseOutcome, ResponseOutcome, UnitAggregator};
use spooltrack::domain::{ActorId, Completion, Operation, SubUnit, UnitTag, VersionToken, WorkUnit};
use spooltrack::workflows::OperationState;

#[derive(Debug, Clone)]
struct UnionSpec {
    tenths: u32,
    armed: bool,
    welded: bool,
}

fn union_strategy() -> impl Strategy<Value = UnionSpec> {
    (1u32..=200, any::<bool>(), any::<bool>()).prop_map(|(tenths, armed, welded)| UnionSpec {
        tenths,
        armed,
        // Welding never precedes assembly.
        welded: armed && welded,
    })
}

fn spool(specs: &[UnionSpec]) -> WorkUnit {
    let done = || {
        Some(Completion {
            at: Utc::now(),
            by: ActorId::from("93"),
        })
    };
    WorkUnit {
        tag: UnitTag::from("SP-P"),
        arm_state: OperationState::Pending,
        sold_state: OperationState::Pending,
        inspection_state: OperationState::Pending,
        repair_cycles: 0,
        claimant: None,
        version: VersionToken::default(),
        sub_units: specs
            .iter()
            .enumerate()
            .map(|(n, spec)| SubUnit {
                id: format!("SP-P-U{n:02}"),
                unit_tag: UnitTag::from("SP-P"),
                weight: spec.tenths as f64 / 10.0,
                arm: if spec.armed { done() } else { None },
                sold: if spec.welded { done() } else { None },
            })
            .collect(),
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;

    #[test]
    fn prop_eligible_sets_partition_the_unions() {
        let mut runner = proptest::test_runner::TestRunner::default();

        runner
            .run(&prop::collection::vec(union_strategy(), 0..30), |specs| {
                let unit = spool(&specs);
                let arm: HashSet<&str> = UnitAggregator::eligible_for_operation(&unit, Operation::Arm)
                    .iter()
                    .map(|sub| sub.id.as_str())
                    .collect();
                let sold: HashSet<&str> = UnitAggregator::eligible_for_operation(&unit, Operation::Sold)
                    .iter()
                    .map(|sub| sub.id.as_str())
                    .collect();

                prop_assert!(arm.is_disjoint(&sold), "a union cannot await both operations");
                for sub in &unit.sub_units {
                    let expected_sold = sub.is_complete(Operation::Arm) && !sub.is_complete(Operation::Sold);
                    prop_assert_eq!(arm.contains(sub.id.as_str()), !sub.is_complete(Operation::Arm));
                    prop_assert_eq!(sold.contains(sub.id.as_str()), expected_sold);
                }
                prop_assert!(UnitAggregator::eligible_for_operation(&unit, Operation::Inspection).is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn prop_release_outcome_follows_selection_size() {
        let mut runner = proptest::test_runner::TestRunner::default();

        runner
            .run(
                &(prop::collection::vec(union_strategy(), 1..30), any::<prop::sample::Index>()),
                |(specs, pick)| {
                    let unit = spool(&specs);
                    let eligible = UnitAggregator::eligible_for_operation(&unit, Operation::Arm);
                    let take = if eligible.is_empty() { 0 } else { pick.index(eligible.len() + 1) };
                    let selected: Vec<&SubUnit> = eligible.iter().copied().take(take).collect();

                    let summary = UnitAggregator::summarize(eligible.len(), &selected);
                    let expected = match take {
                        0 => ReleaseOutcome::Cancelled,
                        n if n == eligible.len() => ReleaseOutcome::Complete,
                        _ => ReleaseOutcome::Partial,
                    };
                    prop_assert_eq!(summary.outcome, expected);
                    prop_assert_eq!(summary.selected, take);
                    prop_assert_eq!(summary.eligible, eligible.len());
                    Ok(())
                },
            )
            .unwrap();
    }

    #[test]
    fn prop_metric_sum_is_rounded_to_one_decimal() {
        let mut runner = proptest::test_runner::TestRunner::default();

        runner
            .run(&prop::collection::vec(union_strategy(), 0..30), |specs| {
                let unit = spool(&specs);
                let all: Vec<&SubUnit> = unit.sub_units.iter().collect();
                let summary = UnitAggregator::summarize(all.len(), &all);

                let tenths: u32 = specs.iter().map(|spec| spec.tenths).sum();
                prop_assert!((summary.metric_sum - tenths as f64 / 10.0).abs() < 1e-9);
                prop_assert_eq!(summary.metric_sum, UnitAggregator::round_metric(summary.metric_sum));

                let progress = UnitAggregator::progress(&unit, Operation::Arm);
                prop_assert!(progress.metric_done <= progress.metric_total + 1e-9);
                prop_assert!(progress.done <= progress.total);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn prop_selection_ignores_duplicates_and_order() {
        let mut runner = proptest::test_runner::TestRunner::default();

        runner
            .run(
                &(
                    prop::collection::vec(union_strategy(), 1..20),
                    prop::collection::vec(any::<prop::sample::Index>(), 1..40),
                ),
                |(specs, picks)| {
                    let unit = spool(&specs);
                    let eligible: Vec<String> = UnitAggregator::eligible_for_operation(&unit, Operation::Arm)
                        .iter()
                        .map(|sub| sub.id.clone())
                        .collect();
                    if eligible.is_empty() {
                        return Ok(());
                    }

                    let requested: Vec<String> = picks
                        .iter()
                        .map(|pick| eligible[pick.index(eligible.len())].clone())
                        .collect();
                    let mut reversed = requested.clone();
                    reversed.reverse();

                    let forward = UnitAggregator::select(&unit, Operation::Arm, &requested).unwrap();
                    let backward = UnitAggregator::select(&unit, Operation::Arm, &reversed).unwrap();
                    let unique: HashSet<&String> = requested.iter().collect();

                    prop_assert_eq!(forward.len(), unique.len());
                    prop_assert_eq!(forward, backward);
                    Ok(())
                },
            )
            .unwrap();
    }

    #[test]
    fn prop_releases_never_overcount_progress() {
        let mut runner = proptest::test_runner::TestRunner::new(proptest::test_runner::Config {
            cases: 16,
            ..proptest::test_runner::Config::default()
        });

        runner
            .run(
                &(2usize..8, prop::collection::vec(1usize..4, 1..6)),
                |(unions, chunks)| {
                    let rt = tokio::runtime::Runtime::new().unwrap();
                    rt.block_on(async {
                        let h = fixtures::Harness::new(&[("SP-P", unions)]).await;
                        let mut next = 1;
                        for chunk in chunks {
                            if next > unions {
                                break;
                            }
                            let last = (next + chunk - 1).min(unions);
                            h.claim("SP-P", Operation::Arm, "93").await;
                            let response = h
                                .release("SP-P", Operation::Arm, "93", fixtures::union_ids("SP-P", next..=last))
                                .await;
                            let expected = if last == unions {
                                ResponseOutcome::Complete
                            } else {
                                ResponseOutcome::Partial
                            };
                            prop_assert_eq!(response.outcome, expected);
                            next = last + 1;
                        }

                        let status = h.coordinator.status(&UnitTag::from("SP-P")).await.unwrap();
                        let arm = &status.progress[0];
                        prop_assert_eq!(arm.done, next - 1);
                        prop_assert_eq!(status.eligible[&Operation::Arm].len(), unions - (next - 1));
                        let expected_state = if next > unions { "DONE" } else { "IN_PROGRESS" };
                        prop_assert_eq!(status.states[&Operation::Arm].as_str(), expected_state);
                        Ok(())
                    })
                },
            )
            .unwrap();
    }
}
