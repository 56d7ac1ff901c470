// Occupation Coordination
//
// Claims, releases and cancellations against the shared row store. The store
// is the only source of truth for who holds a spool; everything kept in
// memory here is a mirror plus the locks that serialize requests.

pub mod aggregator;
pub mod coordinator;
pub mod errors;
pub mod locks;
pub mod ownership;
pub mod requests;
pub mod version_guard;

pub use aggregator::{IneligibleSelection, Progress, ReleaseOutcome, ReleaseSummary, UnitAggregator};
pub use coordinator::{CoordinatorSettings, OccupationCoordinator, StartupReport, UnitStatus};
pub use errors::OccupationError;
pub use locks::KeyedLocks;
pub use ownership::{ClaimKey, ClaimRecord, OwnershipError, OwnershipLock, ReconcileReport};
pub use requests::{
    CancelRequest, ClaimRequest, InspectionRequest, OccupationResponse, ReleaseRequest,
    RepairRequest, ResponseOutcome, Verdict,
};
pub use version_guard::{GuardError, VersionGuard};
