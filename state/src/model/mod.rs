use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;

mod idempotency;
mod inbox;
mod job;
mod join;
mod lease;
mod outbox;
mod timer;

pub use idempotency::BeginOutcome;
pub use idempotency::IdempotencyEntry;
pub use idempotency::IdempotencyState;
pub(crate) use idempotency::IdempotencyRow;
pub use inbox::AcceptOutcome;
pub use inbox::InboxRecord;
pub use inbox::InboxStatus;
pub(crate) use inbox::InboxRow;
pub use job::JobDefinition;
pub use job::JobRun;
pub use job::RunStatus;
pub(crate) use job::JobRow;
pub(crate) use job::JobRunRow;
pub use join::JoinRecord;
pub use join::JoinStatus;
pub(crate) use join::JoinRow;
pub use lease::LeaseGrant;
pub use lease::LeaseRow;
pub(crate) use lease::grant_from_row;
pub use outbox::EnqueueOutbox;
pub use outbox::EnqueueOutcome;
pub use outbox::OutboxMessage;
pub use outbox::OutboxStatus;
pub(crate) use outbox::OutboxRow;
pub use timer::TimerRow;
pub use timer::TimerStatus;
pub(crate) use timer::TimerRowRecord;

pub(crate) fn datetime_to_epoch_millis(value: DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

pub(crate) fn epoch_millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| anyhow::anyhow!("invalid unix timestamp: {millis}"))
}

pub(crate) fn opt_epoch_millis_to_datetime(millis: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    millis.map(epoch_millis_to_datetime).transpose()
}
