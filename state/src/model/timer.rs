use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use conveyor_protocol::TimerId;

use super::epoch_millis_to_datetime;
use super::opt_epoch_millis_to_datetime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStatus {
    Pending,
    Leased,
    Processed,
    Cancelled,
}

impl TimerStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            TimerStatus::Pending => "pending",
            TimerStatus::Leased => "leased",
            TimerStatus::Processed => "processed",
            TimerStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "leased" => Ok(Self::Leased),
            "processed" => Ok(Self::Processed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(anyhow::anyhow!("invalid timer status: {value}")),
        }
    }
}

/// One one-shot timer; materializes into an outbox message when due.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerRow {
    pub id: TimerId,
    pub topic: String,
    pub payload: Vec<u8>,
    pub due_time: DateTime<Utc>,
    pub status: TimerStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub owner_token: Option<String>,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TimerRowRecord {
    pub(crate) id: String,
    pub(crate) topic: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) due_time: i64,
    pub(crate) status: String,
    pub(crate) created_at: i64,
    pub(crate) updated_at: i64,
    pub(crate) locked_until: Option<i64>,
    pub(crate) owner_token: Option<String>,
    pub(crate) retry_count: i64,
    pub(crate) last_error: Option<String>,
    pub(crate) processed_at: Option<i64>,
}

impl TryFrom<TimerRowRecord> for TimerRow {
    type Error = anyhow::Error;

    fn try_from(value: TimerRowRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.parse()?,
            topic: value.topic,
            payload: value.payload,
            due_time: epoch_millis_to_datetime(value.due_time)?,
            status: TimerStatus::parse(value.status.as_str())?,
            created_at: epoch_millis_to_datetime(value.created_at)?,
            updated_at: epoch_millis_to_datetime(value.updated_at)?,
            locked_until: opt_epoch_millis_to_datetime(value.locked_until)?,
            owner_token: value.owner_token,
            retry_count: value.retry_count,
            last_error: value.last_error,
            processed_at: opt_epoch_millis_to_datetime(value.processed_at)?,
        })
    }
}
