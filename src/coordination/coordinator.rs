// Occupation Coordinator - claim, release and cancel against the row store
//
// Every mutating call runs the same pipeline: read the spool, decide the
// transition, stage the audit events, compare-and-swap the spool row, then
// settle the staged events. Version conflicts rerun the pipeline from a
// fresh read.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

use super::aggregator::{Progress, ReleaseOutcome, UnitAggregator};
use super::errors::OccupationError;
use super::ownership::{ClaimKey, ClaimRecord, OwnershipLock, ReconcileReport};
use super::requests::{
    require_present, CancelRequest, ClaimRequest, InspectionRequest, OccupationResponse,
    ReleaseRequest, RepairRequest, ResponseOutcome, Verdict,
};
use super::version_guard::{GuardError, VersionGuard};
use crate::audit::{
    AuditAction, AuditEvent, EventLog, EventType, FlushReport, Outbox, RecoveryReport, Resolution,
};
use crate::config::SpoolTrackConfig;
use crate::domain::{ActorId, Claimant, Completion, Operation, UnitTag, VersionToken, WorkUnit};
use crate::observability::{EngineMetrics, EngineStats, OperationTimer};
use crate::store::schema::{self, sub_units, units};
use crate::store::{Row, RowStore, Sheet, StoreError};
use crate::sync::{BatchSyncWriter, RetryConfig, RetryError, RetryPolicy, SyncPlan};
use crate::telemetry::{create_occupation_span, generate_correlation_id};
use crate::workflows::{transition, Effect, OperationEvent, OperationState, TransitionContext};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub max_rows_per_call: usize,
    pub version_retry: RetryConfig,
    pub store_retry: RetryConfig,
    pub flush_retry: RetryConfig,
    pub repair_cycle_cap: u8,
    pub inspection_trigger: bool,
    pub stale_after: Duration,
    pub business_utc_offset_minutes: i32,
}

impl From<&SpoolTrackConfig> for CoordinatorSettings {
    fn from(config: &SpoolTrackConfig) -> Self {
        let coordination = &config.coordination;
        Self {
            max_rows_per_call: config.store.max_rows_per_call,
            version_retry: coordination.version_retry(),
            store_retry: coordination.store_retry(),
            flush_retry: RetryConfig {
                max_attempts: config.audit.flush_attempts,
                ..coordination.store_retry()
            },
            repair_cycle_cap: coordination.repair_cycle_cap,
            inspection_trigger: coordination.inspection_trigger,
            stale_after: Duration::hours(coordination.stale_claim_hours),
            business_utc_offset_minutes: coordination.business_utc_offset_minutes,
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&SpoolTrackConfig::default())
    }
}

/// Read-only snapshot of one spool.
#[derive(Debug, Clone, Serialize)]
pub struct UnitStatus {
    pub unit_tag: UnitTag,
    pub states: BTreeMap<Operation, String>,
    pub claimant: Option<Claimant>,
    pub repair_cycles: u8,
    pub version: VersionToken,
    pub progress: Vec<Progress>,
    /// Union ids each operation could still complete.
    pub eligible: BTreeMap<Operation, Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    pub recovery: RecoveryReport,
    pub reconcile: ReconcileReport,
    pub flush: FlushReport,
}

/// Everything one attempt wants to change, decided from a single read.
struct Mutation {
    plan: SyncPlan,
    events: Vec<AuditEvent>,
    response: OccupationResponse,
    claim: ClaimChange,
}

enum ClaimChange {
    Acquire(ClaimRecord),
    Release(ClaimKey),
}

pub struct OccupationCoordinator {
    store: Arc<dyn RowStore>,
    guard: VersionGuard,
    ownership: OwnershipLock,
    events: EventLog,
    version_retry: RetryPolicy,
    read_retry: RetryPolicy,
    metrics: Arc<EngineMetrics>,
    settings: CoordinatorSettings,
}

impl OccupationCoordinator {
    pub fn new(
        store: Arc<dyn RowStore>,
        outbox: Arc<dyn Outbox>,
        settings: CoordinatorSettings,
    ) -> Self {
        let metrics = Arc::new(EngineMetrics::new());
        let store_retry = RetryPolicy::new(settings.store_retry.clone()).with_metrics(metrics.clone());
        let writer = BatchSyncWriter::new(store.clone(), store_retry.clone(), settings.max_rows_per_call);
        let events = EventLog::new(
            store.clone(),
            outbox,
            RetryPolicy::new(settings.flush_retry.clone()).with_metrics(metrics.clone()),
            settings.max_rows_per_call,
            metrics.clone(),
        );

        Self {
            guard: VersionGuard::new(store.clone(), writer),
            store,
            ownership: OwnershipLock::new(),
            events,
            version_retry: RetryPolicy::new(settings.version_retry.clone()).with_metrics(metrics.clone()),
            read_retry: store_retry,
            metrics,
            settings,
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn metrics(&self) -> EngineStats {
        self.metrics.get_stats()
    }

    pub fn metrics_handle(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    pub fn event_log(&self) -> &EventLog {
        &self.events
    }

    /// Settle what a previous run left behind: staged audit batches,
    /// in-memory claims, and committed events not yet on the audit sheet.
    pub async fn startup(&self) -> Result<StartupReport, OccupationError> {
        let recovery = self
            .events
            .recover()
            .await
            .map_err(|err| OccupationError::AuditWriteFailed(err.to_string()))?;
        let reconcile = self.reconcile().await?;
        let flush = self.events.flush().await;

        info!(
            recovered = recovery.committed + recovery.aborted,
            claims = reconcile.restored.len(),
            stale_claims = reconcile.stale.len(),
            flushed_events = flush.events_flushed,
            "Coordinator ready"
        );
        Ok(StartupReport {
            recovery,
            reconcile,
            flush,
        })
    }

    pub async fn claim(&self, request: ClaimRequest) -> Result<OccupationResponse, OccupationError> {
        require_present(&request.unit_tag, &request.actor_id)?;
        let correlation_id = generate_correlation_id();
        let span = create_occupation_span(
            "claim",
            &request.unit_tag,
            request.operation,
            Some(&request.actor_id),
            &correlation_id,
        );

        async move {
            let timer = OperationTimer::new("claim");
            let key = ClaimKey::new(request.unit_tag.clone(), request.operation);
            let result = self
                .mutate("claim", key, |unit, now| self.plan_claim(unit, &request, now))
                .await;
            timer.finish();
            self.settle(result).await
        }
        .instrument(span)
        .await
    }

    /// Release a claim, stamping the selected unions. An empty selection
    /// is a voluntary cancel.
    pub async fn release(
        &self,
        request: ReleaseRequest,
    ) -> Result<OccupationResponse, OccupationError> {
        require_present(&request.unit_tag, &request.actor_id)?;
        let correlation_id = generate_correlation_id();
        let span = create_occupation_span(
            "release",
            &request.unit_tag,
            request.operation,
            Some(&request.actor_id),
            &correlation_id,
        );

        async move {
            let timer = OperationTimer::new("release");
            let key = ClaimKey::new(request.unit_tag.clone(), request.operation);
            let result = self
                .mutate("release", key, |unit, now| self.plan_release(unit, &request, now))
                .await;
            timer.finish();
            self.settle(result).await
        }
        .instrument(span)
        .await
    }

    pub async fn cancel(&self, request: CancelRequest) -> Result<OccupationResponse, OccupationError> {
        if !request.admin {
            return self
                .release(ReleaseRequest {
                    unit_tag: request.unit_tag,
                    operation: request.operation,
                    actor_id: request.actor_id,
                    selected_subunits: Vec::new(),
                })
                .await;
        }

        require_present(&request.unit_tag, &request.actor_id)?;
        let correlation_id = generate_correlation_id();
        let span = create_occupation_span(
            "admin_cancel",
            &request.unit_tag,
            request.operation,
            Some(&request.actor_id),
            &correlation_id,
        );

        async move {
            warn!(
                unit_tag = %request.unit_tag,
                operation = %request.operation,
                supervisor = %request.actor_id,
                reason = request.reason.as_deref().unwrap_or(""),
                "Administrative cancel requested"
            );
            let timer = OperationTimer::new("admin_cancel");
            let key = ClaimKey::new(request.unit_tag.clone(), request.operation);
            let result = self
                .mutate("admin_cancel", key, |unit, now| {
                    self.plan_admin_cancel(unit, &request, now)
                })
                .await;
            timer.finish();
            self.settle(result).await
        }
        .instrument(span)
        .await
    }

    /// Record the inspector's verdict on a claimed inspection.
    pub async fn record_inspection(
        &self,
        request: InspectionRequest,
    ) -> Result<OccupationResponse, OccupationError> {
        require_present(&request.unit_tag, &request.actor_id)?;
        let correlation_id = generate_correlation_id();
        let span = create_occupation_span(
            "inspect",
            &request.unit_tag,
            Operation::Inspection,
            Some(&request.actor_id),
            &correlation_id,
        );

        async move {
            let key = ClaimKey::new(request.unit_tag.clone(), Operation::Inspection);
            let result = self
                .mutate("inspect", key, |unit, now| {
                    self.plan_inspection(unit, &request, now)
                })
                .await;
            self.settle(result).await
        }
        .instrument(span)
        .await
    }

    pub async fn complete_repair(
        &self,
        request: RepairRequest,
    ) -> Result<OccupationResponse, OccupationError> {
        require_present(&request.unit_tag, &request.actor_id)?;
        let correlation_id = generate_correlation_id();
        let span = create_occupation_span(
            "repair_done",
            &request.unit_tag,
            Operation::Inspection,
            Some(&request.actor_id),
            &correlation_id,
        );

        async move {
            let key = ClaimKey::new(request.unit_tag.clone(), Operation::Inspection);
            let result = self
                .mutate("repair_done", key, |unit, now| self.plan_repair(unit, &request, now))
                .await;
            self.settle(result).await
        }
        .instrument(span)
        .await
    }

    pub async fn status(&self, unit_tag: &UnitTag) -> Result<UnitStatus, OccupationError> {
        let unit = self.load_unit(unit_tag).await?;

        let states = Operation::ALL
            .iter()
            .map(|op| (*op, unit.state(*op).to_string()))
            .collect();
        let progress = Operation::ALL
            .iter()
            .filter(|op| op.tracks_sub_units())
            .map(|op| UnitAggregator::progress(&unit, *op))
            .collect();
        let eligible = Operation::ALL
            .iter()
            .filter(|op| op.tracks_sub_units())
            .map(|op| {
                let ids = UnitAggregator::eligible_for_operation(&unit, *op)
                    .into_iter()
                    .map(|sub| sub.id.clone())
                    .collect();
                (*op, ids)
            })
            .collect();

        Ok(UnitStatus {
            unit_tag: unit.tag.clone(),
            states,
            claimant: unit.claimant.clone(),
            repair_cycles: unit.repair_cycles,
            version: unit.version.clone(),
            progress,
            eligible,
        })
    }

    /// Rebuild the claim mirror from the claimants recorded in the store.
    pub async fn reconcile(&self) -> Result<ReconcileReport, OccupationError> {
        let rows = self
            .read_retry
            .run(
                "read_units",
                || self.store.read_all(Sheet::Units),
                StoreError::is_transient,
            )
            .await
            .map_err(|failure| self.read_failed(failure.error))?;

        let mut recorded = Vec::new();
        let mut unreadable = Vec::new();
        for row in &rows {
            let tag = row.get(units::TAG).unwrap_or_default();
            match schema::decode_claimant(row) {
                Ok(Some(claimant)) => {
                    recorded.push(ClaimRecord::from_claimant(&UnitTag::from(tag), &claimant))
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(unit_tag = tag, error = %err, "Skipping spool with unreadable claimant");
                    unreadable.push(tag.to_string());
                }
            }
        }

        let mut report = self
            .ownership
            .reconcile(recorded, self.settings.stale_after, Utc::now())
            .await;
        report.unreadable = unreadable;

        let pruned = self.ownership.prune_locks().await + self.guard.prune_locks().await;
        debug!(pruned, "Idle locks pruned");
        Ok(report)
    }

    pub async fn flush_audit(&self) -> FlushReport {
        self.events.flush().await
    }

    pub async fn claims(&self) -> Vec<ClaimRecord> {
        self.ownership.claims().await
    }

    async fn load_unit(&self, unit_tag: &UnitTag) -> Result<WorkUnit, OccupationError> {
        let row = self
            .read_retry
            .run(
                "read_unit",
                || self.store.read_row(Sheet::Units, unit_tag.as_str()),
                StoreError::is_transient,
            )
            .await
            .map_err(|failure| self.read_failed(failure.error))?
            .ok_or_else(|| OccupationError::NotFound(unit_tag.clone()))?;

        let children: Vec<Row> = self
            .read_retry
            .run(
                "read_unions",
                || {
                    self.store
                        .read_children(Sheet::SubUnits, sub_units::TAG, unit_tag.as_str())
                },
                StoreError::is_transient,
            )
            .await
            .map_err(|failure| self.read_failed(failure.error))?;

        schema::decode_work_unit(&row, &children).map_err(|err| self.read_failed(err))
    }

    fn read_failed(&self, err: StoreError) -> OccupationError {
        self.metrics.record_store_failure();
        OccupationError::StoreReadFailed(err.to_string())
    }

    /// Run `decide` against fresh reads until the version check passes or
    /// the attempts run out. Requests for the same key wait their turn.
    async fn mutate<F>(
        &self,
        action: &'static str,
        key: ClaimKey,
        decide: F,
    ) -> Result<OccupationResponse, OccupationError>
    where
        F: Fn(&WorkUnit, DateTime<Utc>) -> Result<Mutation, OccupationError>,
    {
        let _key_guard = self.ownership.lock_key(&key).await;
        let decide = &decide;
        let unit_tag = &key.unit_tag;

        let result = self
            .version_retry
            .run(
                action,
                move || self.attempt(unit_tag, decide),
                OccupationError::is_retryable,
            )
            .await;

        match result {
            Ok(response) => Ok(response),
            Err(RetryError {
                error: OccupationError::VersionConflict { unit_tag, .. },
                attempts,
            }) => {
                error!(unit_tag = %unit_tag, attempts, "Giving up after repeated version conflicts");
                Err(OccupationError::VersionConflict { unit_tag, attempts })
            }
            Err(failure) => Err(failure.error),
        }
    }

    async fn attempt<F>(
        &self,
        unit_tag: &UnitTag,
        decide: &F,
    ) -> Result<OccupationResponse, OccupationError>
    where
        F: Fn(&WorkUnit, DateTime<Utc>) -> Result<Mutation, OccupationError>,
    {
        let unit = self.load_unit(unit_tag).await?;
        self.ownership.sync(&unit).await;

        let Mutation {
            plan,
            events,
            response,
            claim,
        } = decide(&unit, Utc::now())?;
        let next = VersionToken::fresh();

        // No state write happens unless its audit events are durable first.
        let batch = self
            .events
            .stage(unit_tag, &next, events)
            .await
            .map_err(|err| {
                error!(unit_tag = %unit_tag, error = %err, "Audit staging failed; state left unchanged");
                OccupationError::AuditWriteFailed(err.to_string())
            })?;

        match self.guard.write(&unit.version, &next, plan).await {
            Ok(()) => self.events.commit(&batch.id).await,
            Err(GuardError::Conflict { .. }) => {
                self.events.abort(&batch.id).await;
                self.metrics.record_version_conflict();
                return Err(OccupationError::VersionConflict {
                    unit_tag: unit_tag.clone(),
                    attempts: 1,
                });
            }
            Err(GuardError::NotFound(tag)) => {
                self.events.abort(&batch.id).await;
                return Err(OccupationError::NotFound(tag));
            }
            Err(GuardError::Read(err)) => {
                self.events.abort(&batch.id).await;
                return Err(self.read_failed(err));
            }
            Err(GuardError::Write(err)) => {
                // The store may have applied the batch before reporting failure.
                if self.events.resolve(&batch).await != Resolution::Committed {
                    self.metrics.record_store_failure();
                    error!(unit_tag = %unit_tag, error = %err, "Store write failed; claim state unchanged");
                    return Err(OccupationError::StoreWriteFailed {
                        unit_tag: unit_tag.clone(),
                        reason: err.to_string(),
                    });
                }
                warn!(unit_tag = %unit_tag, error = %err, "Store reported a failure but the write landed");
            }
        }

        match claim {
            ClaimChange::Acquire(record) => self.ownership.acquire(record).await,
            ClaimChange::Release(key) => {
                self.ownership.release(&key).await;
            }
        }
        Ok(response)
    }

    async fn settle(
        &self,
        result: Result<OccupationResponse, OccupationError>,
    ) -> Result<OccupationResponse, OccupationError> {
        match &result {
            Ok(response) => {
                match response.outcome {
                    ResponseOutcome::Claimed => self.metrics.record_claim(),
                    ResponseOutcome::Cancelled => self.metrics.record_cancellation(),
                    _ => self.metrics.record_release(),
                }
                info!(
                    outcome = ?response.outcome,
                    new_state = response.new_state.as_deref().unwrap_or(""),
                    "Request accepted"
                );
                // Failures are logged inside and the events stay committed.
                self.events.flush().await;
            }
            Err(err) => {
                self.metrics.record_rejection();
                info!(error_code = err.error_code(), error = %err, "Request rejected");
            }
        }
        result
    }

    fn context(&self, unit: &WorkUnit, operation: Operation, selected: usize) -> TransitionContext {
        let completed_before = unit.completed_count(operation);
        TransitionContext {
            arm_complete: unit.completed_count(Operation::Arm),
            eligible: UnitAggregator::eligible_for_operation(unit, operation).len(),
            completed_before,
            remaining_after: unit
                .sub_units
                .len()
                .saturating_sub(completed_before + selected),
            sold_done: unit.sold_state == OperationState::Done,
            repair_cycles: unit.repair_cycles,
            repair_cycle_cap: self.settings.repair_cycle_cap,
            inspection_trigger: self.settings.inspection_trigger,
        }
    }

    fn event(
        &self,
        event_type: EventType,
        unit_tag: &UnitTag,
        operation: Operation,
        actor: &ActorId,
        action: AuditAction,
        at: DateTime<Utc>,
    ) -> AuditEvent {
        AuditEvent::new(
            event_type,
            unit_tag.clone(),
            operation,
            actor.clone(),
            action,
            at,
            self.settings.business_utc_offset_minutes,
        )
    }

    fn plan_claim(
        &self,
        unit: &WorkUnit,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> Result<Mutation, OccupationError> {
        let operation = request.operation;
        // One occupant per spool, whatever the operation.
        if let Some(holder) = &unit.claimant {
            return Err(OccupationError::AlreadyClaimed {
                unit_tag: unit.tag.clone(),
                holder: holder.actor.clone(),
                held_for: holder.operation,
            });
        }

        let ctx = self.context(unit, operation, 0);
        let step = transition(operation, unit.state(operation), OperationEvent::Claim, &ctx)
            .map_err(|err| OccupationError::from_transition(&unit.tag, err))?;

        let claimant = Claimant {
            actor: request.actor_id.clone(),
            operation,
            claimed_at: now,
        };
        let mut plan = SyncPlan::new(unit.tag.clone());
        plan.set_state(operation, step.to)
            .set_claimant(Some(&claimant))
            .touch(&now);

        let payload = json!({ "from": step.from.to_string(), "to": step.to.to_string() });
        let events = step
            .audit_events()
            .map(|event_type| {
                self.event(event_type, &unit.tag, operation, &request.actor_id, AuditAction::Claim, now)
                    .with_payload(payload.clone())
            })
            .collect();

        Ok(Mutation {
            plan,
            events,
            response: OccupationResponse::accepted(
                ResponseOutcome::Claimed,
                &unit.tag,
                operation,
                step.to,
            ),
            claim: ClaimChange::Acquire(ClaimRecord::from_claimant(&unit.tag, &claimant)),
        })
    }

    fn plan_release(
        &self,
        unit: &WorkUnit,
        request: &ReleaseRequest,
        now: DateTime<Utc>,
    ) -> Result<Mutation, OccupationError> {
        let operation = request.operation;
        let actor = &request.actor_id;
        OwnershipLock::check(unit, operation, actor)?;

        let (selected, eligible) = if operation.tracks_sub_units() {
            let selected = UnitAggregator::select(unit, operation, &request.selected_subunits)
                .map_err(|err| OccupationError::from_selection(&unit.tag, err))?;
            let eligible = UnitAggregator::eligible_for_operation(unit, operation).len();
            (selected, eligible)
        } else if request.selected_subunits.is_empty() {
            (Vec::new(), 0)
        } else {
            let mut ids: Vec<String> = request
                .selected_subunits
                .iter()
                .map(|id| id.trim().to_string())
                .collect();
            ids.sort();
            ids.dedup();
            return Err(OccupationError::IneligibleSubUnits {
                unit_tag: unit.tag.clone(),
                operation,
                ids,
            });
        };

        // The spool row and every stamped union go out in one write.
        if selected.len() + 1 > self.settings.max_rows_per_call {
            return Err(OccupationError::InvalidRequest(format!(
                "{} unions cannot be released in one request (limit {}); release them in smaller selections",
                selected.len(),
                self.settings.max_rows_per_call.saturating_sub(1)
            )));
        }

        let summary = UnitAggregator::summarize(eligible, &selected);
        let (event, action, outcome) = match summary.outcome {
            ReleaseOutcome::Complete => (
                OperationEvent::ReleaseComplete,
                AuditAction::Release,
                ResponseOutcome::Complete,
            ),
            ReleaseOutcome::Partial => (
                OperationEvent::ReleasePartial,
                AuditAction::Release,
                ResponseOutcome::Partial,
            ),
            ReleaseOutcome::Cancelled => (
                OperationEvent::Cancel,
                AuditAction::Cancel,
                ResponseOutcome::Cancelled,
            ),
        };

        let ctx = self.context(unit, operation, selected.len());
        let step = transition(operation, unit.state(operation), event, &ctx)
            .map_err(|err| OccupationError::from_transition(&unit.tag, err))?;

        let mut plan = SyncPlan::new(unit.tag.clone());
        plan.set_state(operation, step.to).set_claimant(None).touch(&now);

        let payload = json!({
            "from": step.from.to_string(),
            "to": step.to.to_string(),
            "selected": summary.selected,
            "eligible": summary.eligible,
            "metric_sum": summary.metric_sum,
        });
        let mut events: Vec<AuditEvent> = step
            .audit_events()
            .map(|event_type| {
                self.event(event_type, &unit.tag, operation, actor, action, now)
                    .with_payload(payload.clone())
            })
            .collect();

        if step.has_effect(Effect::StampSubUnits) {
            let completion = Completion {
                at: now,
                by: actor.clone(),
            };
            for sub in &selected {
                plan.stamp_sub_unit(&sub.id, operation, &completion);
                events.push(
                    self.event(EventType::SubUnitCompleted, &unit.tag, operation, actor, action, now)
                        .with_sub_unit(sub.id.clone())
                        .with_payload(json!({ "weight": sub.weight })),
                );
            }
        }

        if step.has_effect(Effect::PersistProgress) {
            let before = UnitAggregator::progress(unit, operation);
            plan.set_progress(
                operation,
                before.done + selected.len(),
                before.total,
                UnitAggregator::round_metric(before.metric_done + summary.metric_sum),
            );
        }

        if step.has_effect(Effect::TriggerInspection) {
            match transition(
                Operation::Inspection,
                unit.inspection_state,
                OperationEvent::TriggerInspection,
                &ctx,
            ) {
                Ok(trigger) => {
                    plan.set_state(Operation::Inspection, trigger.to);
                    events.extend(trigger.audit_events().map(|event_type| {
                        self.event(event_type, &unit.tag, Operation::Inspection, actor, action, now)
                    }));
                }
                Err(err) => debug!(unit_tag = %unit.tag, error = %err, "Inspection not triggered"),
            }
        }

        let mut response = OccupationResponse::accepted(outcome, &unit.tag, operation, step.to);
        if operation.tracks_sub_units() {
            response = response.with_metric(summary.metric_sum);
        }

        Ok(Mutation {
            plan,
            events,
            response,
            claim: ClaimChange::Release(ClaimKey::new(unit.tag.clone(), operation)),
        })
    }

    fn plan_admin_cancel(
        &self,
        unit: &WorkUnit,
        request: &CancelRequest,
        now: DateTime<Utc>,
    ) -> Result<Mutation, OccupationError> {
        let operation = request.operation;
        let holder = unit
            .claimant_for(operation)
            .ok_or_else(|| OccupationError::NotClaimed {
                unit_tag: unit.tag.clone(),
                operation,
            })?;

        let ctx = self.context(unit, operation, 0);
        let step = transition(operation, unit.state(operation), OperationEvent::AdminCancel, &ctx)
            .map_err(|err| OccupationError::from_transition(&unit.tag, err))?;

        let mut plan = SyncPlan::new(unit.tag.clone());
        plan.set_state(operation, step.to).set_claimant(None).touch(&now);

        let payload = json!({
            "from": step.from.to_string(),
            "to": step.to.to_string(),
            "claimant": holder.actor.as_str(),
            "claimed_at": schema::format_timestamp(&holder.claimed_at),
            "reason": request.reason,
        });
        let events = step
            .audit_events()
            .map(|event_type| {
                self.event(event_type, &unit.tag, operation, &request.actor_id, AuditAction::AdminCancel, now)
                    .with_payload(payload.clone())
            })
            .collect();

        Ok(Mutation {
            plan,
            events,
            response: OccupationResponse::accepted(
                ResponseOutcome::Cancelled,
                &unit.tag,
                operation,
                step.to,
            ),
            claim: ClaimChange::Release(ClaimKey::new(unit.tag.clone(), operation)),
        })
    }

    fn plan_inspection(
        &self,
        unit: &WorkUnit,
        request: &InspectionRequest,
        now: DateTime<Utc>,
    ) -> Result<Mutation, OccupationError> {
        let operation = Operation::Inspection;
        OwnershipLock::check(unit, operation, &request.actor_id)?;

        let event = match request.verdict {
            Verdict::Passed => OperationEvent::InspectionPassed,
            Verdict::Failed => OperationEvent::InspectionFailed,
        };
        let ctx = self.context(unit, operation, 0);
        let step = transition(operation, unit.state(operation), event, &ctx)
            .map_err(|err| OccupationError::from_transition(&unit.tag, err))?;

        let mut plan = SyncPlan::new(unit.tag.clone());
        plan.set_state(operation, step.to).set_claimant(None).touch(&now);
        let mut repair_cycles = unit.repair_cycles;
        if step.has_effect(Effect::IncrementRepairCycle) {
            repair_cycles = repair_cycles.saturating_add(1);
            plan.set_repair_cycles(repair_cycles);
        }

        let payload = json!({
            "from": step.from.to_string(),
            "to": step.to.to_string(),
            "verdict": request.verdict,
            "notes": request.notes,
            "repair_cycles": repair_cycles,
        });
        let events = step
            .audit_events()
            .map(|event_type| {
                self.event(event_type, &unit.tag, operation, &request.actor_id, AuditAction::Inspect, now)
                    .with_payload(payload.clone())
            })
            .collect();

        let outcome = match (request.verdict, step.to) {
            (Verdict::Passed, _) => ResponseOutcome::Passed,
            (Verdict::Failed, OperationState::Blocked) => {
                warn!(unit_tag = %unit.tag, repair_cycles, "Spool blocked after repeated failed inspections");
                ResponseOutcome::Blocked
            }
            (Verdict::Failed, _) => ResponseOutcome::Failed,
        };

        Ok(Mutation {
            plan,
            events,
            response: OccupationResponse::accepted(outcome, &unit.tag, operation, step.to),
            claim: ClaimChange::Release(ClaimKey::new(unit.tag.clone(), operation)),
        })
    }

    fn plan_repair(
        &self,
        unit: &WorkUnit,
        request: &RepairRequest,
        now: DateTime<Utc>,
    ) -> Result<Mutation, OccupationError> {
        let operation = Operation::Inspection;
        OwnershipLock::check(unit, operation, &request.actor_id)?;

        let ctx = self.context(unit, operation, 0);
        let step = transition(operation, unit.state(operation), OperationEvent::RepairCompleted, &ctx)
            .map_err(|err| OccupationError::from_transition(&unit.tag, err))?;

        let mut plan = SyncPlan::new(unit.tag.clone());
        plan.set_state(operation, step.to).set_claimant(None).touch(&now);

        let payload = json!({
            "from": step.from.to_string(),
            "to": step.to.to_string(),
            "repair_cycles": unit.repair_cycles,
        });
        let events = step
            .audit_events()
            .map(|event_type| {
                self.event(event_type, &unit.tag, operation, &request.actor_id, AuditAction::Repair, now)
                    .with_payload(payload.clone())
            })
            .collect();

        Ok(Mutation {
            plan,
            events,
            response: OccupationResponse::accepted(
                ResponseOutcome::Repaired,
                &unit.tag,
                operation,
                step.to,
            ),
            claim: ClaimChange::Release(ClaimKey::new(unit.tag.clone(), operation)),
        })
    }
}
