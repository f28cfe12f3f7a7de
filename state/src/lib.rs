//! SQLite-backed storage for the conveyor work-dispatch core.
//!
//! One [`StoreRuntime`] per backing database. The runtime owns the pool and
//! exposes the row-level operations the dispatcher loops build on: claim,
//! ack, abandon, fail, reap, plus the scheduler, lease, idempotency and join
//! tables. Policy (retry classification, backoff, worker pools) lives in
//! `conveyor-core`.

mod model;
mod runtime;
mod schema;
mod tables;

pub use model::AcceptOutcome;
pub use model::BeginOutcome;
pub use model::EnqueueOutcome;
pub use model::EnqueueOutbox;
pub use model::IdempotencyEntry;
pub use model::IdempotencyState;
pub use model::InboxRecord;
pub use model::InboxStatus;
pub use model::JobDefinition;
pub use model::JobRun;
pub use model::JoinRecord;
pub use model::JoinStatus;
pub use model::LeaseGrant;
pub use model::LeaseRow;
pub use model::OutboxMessage;
pub use model::OutboxStatus;
pub use model::RunStatus;
pub use model::TimerRow;
pub use model::TimerStatus;
pub use runtime::ClaimedRun;
pub use runtime::StoreRuntime;
pub use tables::TableNames;

/// Rows claimed per queue. Tags: [queue]
pub const METRIC_ITEMS_CLAIMED: &str = "conveyor.db.items_claimed";
/// Rows acknowledged per queue. Tags: [queue]
pub const METRIC_ITEMS_ACKED: &str = "conveyor.db.items_acknowledged";
/// Rows abandoned back to pending. Tags: [queue]
pub const METRIC_ITEMS_ABANDONED: &str = "conveyor.db.items_abandoned";
/// Rows moved to terminal failure. Tags: [queue]
pub const METRIC_ITEMS_FAILED: &str = "conveyor.db.items_failed";
/// Expired leases restored to pending. Tags: [queue]
pub const METRIC_ITEMS_REAPED: &str = "conveyor.db.items_reaped";
/// Terminal rows deleted by the retention sweep. Tags: [queue]
pub const METRIC_ITEMS_SWEPT: &str = "conveyor.db.items_swept";
/// Claim batch size observed per call. Tags: [queue]
pub const METRIC_CLAIM_BATCH_SIZE: &str = "conveyor.db.claim.batch_size";
/// Claim statement duration. Tags: [queue]
pub const METRIC_CLAIM_DURATION_MS: &str = "conveyor.db.claim.duration_ms";
/// Settle (ack/abandon/fail) statement duration. Tags: [queue, op]
pub const METRIC_SETTLE_DURATION_MS: &str = "conveyor.db.settle.duration_ms";
