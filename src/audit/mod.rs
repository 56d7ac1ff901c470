// Audit Trail
//
// Immutable events for every transition, staged in a write-ahead outbox
// before the state write and flushed to the append-only audit sheet after.

pub mod event;
pub mod event_log;
pub mod outbox;
#[cfg(feature = "database")]
pub mod sqlite;

pub use event::{business_date, AuditAction, AuditEvent, EventType};
pub use event_log::{AppendOutcome, EventLog, FlushReport, RecoveryReport, Resolution};
pub use outbox::{BatchStatus, FileOutbox, InMemoryOutbox, Outbox, OutboxBatch, OutboxError};
#[cfg(feature = "database")]
pub use sqlite::SqliteOutbox;
