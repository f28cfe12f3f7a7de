use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use conveyor_protocol::MessageId;

use super::epoch_millis_to_datetime;
use super::opt_epoch_millis_to_datetime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Leased,
    Dispatched,
    Failed,
}

impl OutboxStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Leased => "leased",
            OutboxStatus::Dispatched => "dispatched",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "leased" => Ok(Self::Leased),
            "dispatched" => Ok(Self::Dispatched),
            "failed" => Ok(Self::Failed),
            _ => Err(anyhow::anyhow!("invalid outbox status: {value}")),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OutboxStatus::Dispatched | OutboxStatus::Failed)
    }
}

/// One reliable side-effect waiting for (or done with) dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub topic: String,
    pub payload: Vec<u8>,
    pub correlation_id: Option<String>,
    pub message_key: Option<String>,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub due_time: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub owner_token: Option<String>,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_by: Option<String>,
}

/// Parameters for one enqueue.
#[derive(Debug, Clone)]
pub struct EnqueueOutbox {
    pub topic: String,
    pub payload: Vec<u8>,
    pub correlation_id: Option<String>,
    /// Caller-supplied uniqueness key; a second enqueue with the same key is
    /// a no-op returning the existing message id.
    pub message_key: Option<String>,
    pub due_time: Option<DateTime<Utc>>,
}

impl EnqueueOutbox {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            correlation_id: None,
            message_key: None,
            due_time: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_message_key(mut self, message_key: impl Into<String>) -> Self {
        self.message_key = Some(message_key.into());
        self
    }

    pub fn with_due_time(mut self, due_time: DateTime<Utc>) -> Self {
        self.due_time = Some(due_time);
        self
    }
}

/// Result of an enqueue against a possibly-duplicated message key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created(MessageId),
    Duplicate(MessageId),
}

impl EnqueueOutcome {
    pub fn message_id(self) -> MessageId {
        match self {
            EnqueueOutcome::Created(id) | EnqueueOutcome::Duplicate(id) => id,
        }
    }

    pub fn is_created(self) -> bool {
        matches!(self, EnqueueOutcome::Created(_))
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct OutboxRow {
    pub(crate) id: String,
    pub(crate) topic: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) correlation_id: Option<String>,
    pub(crate) message_key: Option<String>,
    pub(crate) status: String,
    pub(crate) created_at: i64,
    pub(crate) updated_at: i64,
    pub(crate) due_time: Option<i64>,
    pub(crate) locked_until: Option<i64>,
    pub(crate) owner_token: Option<String>,
    pub(crate) retry_count: i64,
    pub(crate) last_error: Option<String>,
    pub(crate) processed_at: Option<i64>,
    pub(crate) processed_by: Option<String>,
}

impl TryFrom<OutboxRow> for OutboxMessage {
    type Error = anyhow::Error;

    fn try_from(value: OutboxRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.parse()?,
            topic: value.topic,
            payload: value.payload,
            correlation_id: value.correlation_id,
            message_key: value.message_key,
            status: OutboxStatus::parse(value.status.as_str())?,
            created_at: epoch_millis_to_datetime(value.created_at)?,
            updated_at: epoch_millis_to_datetime(value.updated_at)?,
            due_time: opt_epoch_millis_to_datetime(value.due_time)?,
            locked_until: opt_epoch_millis_to_datetime(value.locked_until)?,
            owner_token: value.owner_token,
            retry_count: value.retry_count,
            last_error: value.last_error,
            processed_at: opt_epoch_millis_to_datetime(value.processed_at)?,
            processed_by: value.processed_by,
        })
    }
}
