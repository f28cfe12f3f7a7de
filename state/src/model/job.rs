use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use conveyor_protocol::JobId;
use conveyor_protocol::JobRunId;

use super::epoch_millis_to_datetime;
use super::opt_epoch_millis_to_datetime;

/// Status of a materialized run. Shares the row-lease lifecycle of the
/// outbox; `processed` means the run's outbox message was enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Leased,
    Processed,
    Failed,
}

impl RunStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Leased => "leased",
            RunStatus::Processed => "processed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "leased" => Ok(Self::Leased),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            _ => Err(anyhow::anyhow!("invalid job run status: {value}")),
        }
    }
}

/// A recurring job definition driven by a cron schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDefinition {
    pub id: JobId,
    pub job_name: String,
    pub topic: String,
    pub cron_schedule: String,
    pub payload: Option<Vec<u8>>,
    pub is_enabled: bool,
    pub next_due_time: DateTime<Utc>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One materialization of a due job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRun {
    pub id: JobRunId,
    pub job_id: JobId,
    pub scheduled_time: DateTime<Utc>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub owner_token: Option<String>,
    pub retry_count: i64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub(crate) id: String,
    pub(crate) job_name: String,
    pub(crate) topic: String,
    pub(crate) cron_schedule: String,
    pub(crate) payload: Option<Vec<u8>>,
    pub(crate) is_enabled: i64,
    pub(crate) next_due_time: i64,
    pub(crate) last_run_time: Option<i64>,
    pub(crate) last_run_status: Option<String>,
    pub(crate) created_at: i64,
    pub(crate) updated_at: i64,
}

impl TryFrom<JobRow> for JobDefinition {
    type Error = anyhow::Error;

    fn try_from(value: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.parse()?,
            job_name: value.job_name,
            topic: value.topic,
            cron_schedule: value.cron_schedule,
            payload: value.payload,
            is_enabled: value.is_enabled != 0,
            next_due_time: epoch_millis_to_datetime(value.next_due_time)?,
            last_run_time: opt_epoch_millis_to_datetime(value.last_run_time)?,
            last_run_status: value.last_run_status,
            created_at: epoch_millis_to_datetime(value.created_at)?,
            updated_at: epoch_millis_to_datetime(value.updated_at)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRunRow {
    pub(crate) id: String,
    pub(crate) job_id: String,
    pub(crate) scheduled_time: i64,
    pub(crate) status: String,
    pub(crate) created_at: i64,
    pub(crate) updated_at: i64,
    pub(crate) locked_until: Option<i64>,
    pub(crate) owner_token: Option<String>,
    pub(crate) retry_count: i64,
    pub(crate) start_time: Option<i64>,
    pub(crate) end_time: Option<i64>,
    pub(crate) output: Option<String>,
    pub(crate) last_error: Option<String>,
}

impl TryFrom<JobRunRow> for JobRun {
    type Error = anyhow::Error;

    fn try_from(value: JobRunRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.parse()?,
            job_id: value.job_id.parse()?,
            scheduled_time: epoch_millis_to_datetime(value.scheduled_time)?,
            status: RunStatus::parse(value.status.as_str())?,
            created_at: epoch_millis_to_datetime(value.created_at)?,
            updated_at: epoch_millis_to_datetime(value.updated_at)?,
            locked_until: opt_epoch_millis_to_datetime(value.locked_until)?,
            owner_token: value.owner_token,
            retry_count: value.retry_count,
            start_time: opt_epoch_millis_to_datetime(value.start_time)?,
            end_time: opt_epoch_millis_to_datetime(value.end_time)?,
            output: value.output,
            last_error: value.last_error,
        })
    }
}
