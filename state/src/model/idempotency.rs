use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;

use super::epoch_millis_to_datetime;
use super::opt_epoch_millis_to_datetime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyState {
    InProgress,
    Completed,
    Failed,
}

impl IdempotencyState {
    pub const fn as_str(self) -> &'static str {
        match self {
            IdempotencyState::InProgress => "in_progress",
            IdempotencyState::Completed => "completed",
            IdempotencyState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(anyhow::anyhow!("invalid idempotency state: {value}")),
        }
    }
}

/// One key-scoped execution record.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyEntry {
    pub key: String,
    pub state: IdempotencyState,
    pub owner: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub outcome: Option<Vec<u8>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of `begin` for an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// The caller owns the key and must run the side effect.
    ///
    /// `prior_attempt` is true when an expired in-progress lock was taken
    /// over; an interrupted earlier execution may have landed its side
    /// effect, which is what the executor's probe path checks.
    Fresh { prior_attempt: bool },
    AlreadyInProgress {
        owner: Option<String>,
        deadline: Option<DateTime<Utc>>,
    },
    AlreadyCompleted {
        outcome: Option<Vec<u8>>,
    },
    AlreadyFailed {
        error_code: Option<String>,
        error_message: Option<String>,
    },
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct IdempotencyRow {
    pub(crate) key: String,
    pub(crate) state: String,
    pub(crate) owner: Option<String>,
    pub(crate) locked_until: Option<i64>,
    pub(crate) outcome: Option<Vec<u8>>,
    pub(crate) error_code: Option<String>,
    pub(crate) error_message: Option<String>,
    pub(crate) created_at: i64,
    pub(crate) updated_at: i64,
}

impl TryFrom<IdempotencyRow> for IdempotencyEntry {
    type Error = anyhow::Error;

    fn try_from(value: IdempotencyRow) -> Result<Self, Self::Error> {
        Ok(Self {
            key: value.key,
            state: IdempotencyState::parse(value.state.as_str())?,
            owner: value.owner,
            locked_until: opt_epoch_millis_to_datetime(value.locked_until)?,
            outcome: value.outcome,
            error_code: value.error_code,
            error_message: value.error_message,
            created_at: epoch_millis_to_datetime(value.created_at)?,
            updated_at: epoch_millis_to_datetime(value.updated_at)?,
        })
    }
}
