use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use conveyor_protocol::JoinId;

use super::epoch_millis_to_datetime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    Pending,
    Satisfied,
    Failed,
}

impl JoinStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            JoinStatus::Pending => "pending",
            JoinStatus::Satisfied => "satisfied",
            JoinStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "satisfied" => Ok(Self::Satisfied),
            "failed" => Ok(Self::Failed),
            _ => Err(anyhow::anyhow!("invalid join status: {value}")),
        }
    }

    pub fn is_settled(self) -> bool {
        matches!(self, JoinStatus::Satisfied | JoinStatus::Failed)
    }
}

/// Fan-in barrier over a set of outbox messages.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRecord {
    pub join_id: JoinId,
    pub tenant_id: String,
    pub expected_steps: i64,
    pub completed_steps: i64,
    pub failed_steps: i64,
    pub status: JoinStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub metadata: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JoinRow {
    pub(crate) join_id: String,
    pub(crate) tenant_id: String,
    pub(crate) expected_steps: i64,
    pub(crate) completed_steps: i64,
    pub(crate) failed_steps: i64,
    pub(crate) status: String,
    pub(crate) created_at: i64,
    pub(crate) last_updated_at: i64,
    pub(crate) metadata: Option<String>,
}

impl TryFrom<JoinRow> for JoinRecord {
    type Error = anyhow::Error;

    fn try_from(value: JoinRow) -> Result<Self, Self::Error> {
        Ok(Self {
            join_id: value.join_id.parse()?,
            tenant_id: value.tenant_id,
            expected_steps: value.expected_steps,
            completed_steps: value.completed_steps,
            failed_steps: value.failed_steps,
            status: JoinStatus::parse(value.status.as_str())?,
            created_at: epoch_millis_to_datetime(value.created_at)?,
            last_updated_at: epoch_millis_to_datetime(value.last_updated_at)?,
            metadata: value.metadata,
        })
    }
}
