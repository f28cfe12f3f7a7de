use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use conveyor_protocol::MessageId;

use super::epoch_millis_to_datetime;
use super::opt_epoch_millis_to_datetime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxStatus {
    Pending,
    Leased,
    Processed,
    Failed,
}

impl InboxStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            InboxStatus::Pending => "pending",
            InboxStatus::Leased => "leased",
            InboxStatus::Processed => "processed",
            InboxStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "leased" => Ok(Self::Leased),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            _ => Err(anyhow::anyhow!("invalid inbox status: {value}")),
        }
    }
}

/// One externally received message, deduplicated on `(source, message_key)`.
#[derive(Debug, Clone, PartialEq)]
pub struct InboxRecord {
    pub id: MessageId,
    pub source: String,
    pub message_key: String,
    pub payload: Vec<u8>,
    pub status: InboxStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub owner_token: Option<String>,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Result of accepting a message into the inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    Created(MessageId),
    /// The key was already present; carries the existing record's status.
    Duplicate(MessageId, InboxStatus),
}

impl AcceptOutcome {
    pub fn record_id(self) -> MessageId {
        match self {
            AcceptOutcome::Created(id) | AcceptOutcome::Duplicate(id, _) => id,
        }
    }

    pub fn is_created(self) -> bool {
        matches!(self, AcceptOutcome::Created(_))
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct InboxRow {
    pub(crate) id: String,
    pub(crate) source: String,
    pub(crate) message_key: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) status: String,
    pub(crate) created_at: i64,
    pub(crate) updated_at: i64,
    pub(crate) locked_until: Option<i64>,
    pub(crate) owner_token: Option<String>,
    pub(crate) retry_count: i64,
    pub(crate) last_error: Option<String>,
    pub(crate) processed_at: Option<i64>,
}

impl TryFrom<InboxRow> for InboxRecord {
    type Error = anyhow::Error;

    fn try_from(value: InboxRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.parse()?,
            source: value.source,
            message_key: value.message_key,
            payload: value.payload,
            status: InboxStatus::parse(value.status.as_str())?,
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
