pub mod batch_writer;
pub mod retry;

pub use batch_writer::{BatchSyncWriter, SyncError, SyncPlan};
pub use retry::{RetryConfig, RetryError, RetryPolicy};
