// SpoolTrack Library - shop-floor occupation and workflow state engine
// This exposes the core components for testing and integration

pub mod audit;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod observability;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod workflows;

// Re-export key types for easy access
pub use audit::{AuditEvent, EventLog, EventType, FileOutbox, InMemoryOutbox, Outbox};
pub use config::SpoolTrackConfig;
pub use coordination::{
    CancelRequest, ClaimRequest, CoordinatorSettings, InspectionRequest, OccupationCoordinator,
    OccupationError, OccupationResponse, ReleaseRequest, RepairRequest, ResponseOutcome, Verdict,
};
pub use domain::{ActorId, Operation, SubUnit, UnitTag, VersionToken, WorkUnit};
pub use observability::{EngineMetrics, OperationTimer};
pub use store::{FileRowStore, InMemoryRowStore, RateLimitedStore, RowStore, StoreError};
pub use telemetry::{create_occupation_span, generate_correlation_id, init_telemetry};
pub use workflows::{transition, OperationEvent, OperationState};
