use crate::model::JobDefinition;
use crate::model::JobRow;
use crate::model::JobRun;
use crate::model::JobRunRow;
use crate::model::RunStatus;
use crate::model::datetime_to_epoch_millis;
use crate::model::epoch_millis_to_datetime;
use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use conveyor_protocol::JobId;
use conveyor_protocol::JobRunId;
use conveyor_protocol::OwnerToken;
use sqlx::Sqlite;
use sqlx::Transaction;

use super::StoreRuntime;

const JOB_COLUMNS: &str = r#"
    id, job_name, topic, cron_schedule, payload, is_enabled,
    next_due_time, last_run_time, last_run_status, created_at, updated_at
"#;

const RUN_COLUMNS: &str = r#"
    id, job_id, scheduled_time, status, created_at, updated_at,
    locked_until, owner_token, retry_count, start_time, end_time,
    output, last_error
"#;

/// A due job run joined with its definition, ready to be enqueued.
#[derive(Debug, Clone)]
pub struct ClaimedRun {
    pub run: JobRun,
    pub topic: String,
    pub payload: Option<Vec<u8>>,
}

impl StoreRuntime {
    /// Create or update a job definition by its unique name.
    ///
    /// `next_due_time` must be precomputed from the cron schedule; the
    /// store treats the schedule text as opaque.
    pub async fn upsert_job(
        &self,
        job_name: &str,
        topic: &str,
        cron_schedule: &str,
        payload: Option<&[u8]>,
        next_due_time: DateTime<Utc>,
    ) -> Result<JobId> {
        let id = JobId::new();
        let now = datetime_to_epoch_millis(Utc::now());
        let sql = format!(
            r#"
INSERT INTO {jobs} (
    id, job_name, topic, cron_schedule, payload, is_enabled,
    next_due_time, last_run_time, last_run_status, created_at, updated_at
) VALUES (?, ?, ?, ?, ?, 1, ?, NULL, NULL, ?, ?)
ON CONFLICT (job_name) DO UPDATE SET
    topic = excluded.topic,
    cron_schedule = excluded.cron_schedule,
    payload = excluded.payload,
    next_due_time = excluded.next_due_time,
    updated_at = excluded.updated_at
            "#,
            jobs = self.tables().jobs()
        );
        sqlx::query(&sql)
            .bind(id.to_string())
            .bind(job_name)
            .bind(topic)
            .bind(cron_schedule)
            .bind(payload)
            .bind(datetime_to_epoch_millis(next_due_time))
            .bind(now)
            .bind(now)
            .execute(self.pool())
            .await?;

        let sql = format!(
            "SELECT id FROM {jobs} WHERE job_name = ?",
            jobs = self.tables().jobs()
        );
        let (stored_id,): (String,) = sqlx::query_as(&sql)
            .bind(job_name)
            .fetch_one(self.pool())
            .await?;
        Ok(stored_id.parse()?)
    }

    pub async fn delete_job(&self, job_name: &str) -> Result<bool> {
        let sql = format!(
            "DELETE FROM {jobs} WHERE job_name = ?",
            jobs = self.tables().jobs()
        );
        let affected = sqlx::query(&sql)
            .bind(job_name)
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(affected == 1)
    }

    pub async fn set_job_enabled(&self, job_name: &str, enabled: bool) -> Result<bool> {
        let now = datetime_to_epoch_millis(Utc::now());
        let sql = format!(
            "UPDATE {jobs} SET is_enabled = ?, updated_at = ? WHERE job_name = ?",
            jobs = self.tables().jobs()
        );
        let affected = sqlx::query(&sql)
            .bind(i64::from(enabled))
            .bind(now)
            .bind(job_name)
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(affected == 1)
    }

    /// Force a job due immediately; the next scheduler pass materializes a
    /// run for it.
    pub async fn trigger_job(&self, job_name: &str, now: DateTime<Utc>) -> Result<bool> {
        let now_ms = datetime_to_epoch_millis(now);
        let sql = format!(
            "UPDATE {jobs} SET next_due_time = ?, updated_at = ? WHERE job_name = ? AND is_enabled = 1",
            jobs = self.tables().jobs()
        );
        let affected = sqlx::query(&sql)
            .bind(now_ms)
            .bind(now_ms)
            .bind(job_name)
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(affected == 1)
    }

    pub async fn get_job(&self, job_name: &str) -> Result<Option<JobDefinition>> {
        let sql = format!(
            "SELECT {columns} FROM {jobs} WHERE job_name = ?",
            columns = JOB_COLUMNS,
            jobs = self.tables().jobs()
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(job_name)
            .fetch_optional(self.pool())
            .await?;
        row.map(JobDefinition::try_from).transpose()
    }

    /// Enabled jobs whose `next_due_time` has elapsed.
    pub async fn due_jobs_in_txn(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobDefinition>> {
        let sql = format!(
            r#"
SELECT {columns} FROM {jobs}
WHERE is_enabled = 1 AND next_due_time <= ?
ORDER BY next_due_time ASC, id ASC
LIMIT ?
            "#,
            columns = JOB_COLUMNS,
            jobs = self.tables().jobs()
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(datetime_to_epoch_millis(now))
            .bind(limit as i64)
            .fetch_all(&mut **tx)
            .await?;
        rows.into_iter().map(JobDefinition::try_from).collect()
    }

    pub async fn insert_job_run_in_txn(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        job_id: JobId,
        scheduled_time: DateTime<Utc>,
    ) -> Result<JobRunId> {
        let id = JobRunId::new();
        let now = datetime_to_epoch_millis(Utc::now());
        let sql = format!(
            r#"
INSERT INTO {job_runs} (
    id, job_id, scheduled_time, status, created_at, updated_at,
    locked_until, owner_token, retry_count, start_time, end_time,
    output, last_error
) VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, 0, NULL, NULL, NULL, NULL)
            "#,
            job_runs = self.tables().job_runs()
        );
        sqlx::query(&sql)
            .bind(id.to_string())
            .bind(job_id.to_string())
            .bind(datetime_to_epoch_millis(scheduled_time))
            .bind(RunStatus::Pending.as_str())
            .bind(now)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        Ok(id)
    }

    /// Advance a job past a materialization: stamp the run bookkeeping and
    /// move `next_due_time` to the next occurrence.
    pub async fn advance_job_in_txn(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        job_id: JobId,
        next_due_time: DateTime<Utc>,
        last_run_time: DateTime<Utc>,
        last_run_status: &str,
    ) -> Result<()> {
        let now = datetime_to_epoch_millis(Utc::now());
        let sql = format!(
            r#"
UPDATE {jobs}
SET next_due_time = ?, last_run_time = ?, last_run_status = ?, updated_at = ?
WHERE id = ?
            "#,
            jobs = self.tables().jobs()
        );
        sqlx::query(&sql)
            .bind(datetime_to_epoch_millis(next_due_time))
            .bind(datetime_to_epoch_millis(last_run_time))
            .bind(last_run_status)
            .bind(now)
            .bind(job_id.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Disable a job mid-pass; used when its schedule has no further
    /// occurrences.
    pub async fn disable_job_in_txn(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        job_id: JobId,
    ) -> Result<()> {
        let now = datetime_to_epoch_millis(Utc::now());
        let sql = format!(
            "UPDATE {jobs} SET is_enabled = 0, updated_at = ? WHERE id = ?",
            jobs = self.tables().jobs()
        );
        sqlx::query(&sql)
            .bind(now)
            .bind(job_id.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Lease due job runs joined with their definitions.
    pub async fn claim_due_runs_in_txn(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        owner: &OwnerToken,
        lease_seconds: i64,
        batch: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedRun>> {
        let now_ms = datetime_to_epoch_millis(now);
        let locked_until = now_ms + lease_seconds.max(0) * 1000;
        let sql = format!(
            r#"
UPDATE {job_runs}
SET status = ?, owner_token = ?, locked_until = ?, start_time = ?, updated_at = ?
WHERE id IN (
    SELECT id FROM {job_runs}
    WHERE status = ?
      AND scheduled_time <= ?
      AND (locked_until IS NULL OR locked_until <= ?)
    ORDER BY scheduled_time ASC, id ASC
    LIMIT ?
)
RETURNING {columns}
            "#,
            job_runs = self.tables().job_runs(),
            columns = RUN_COLUMNS
        );
        let rows: Vec<JobRunRow> = sqlx::query_as(&sql)
            .bind(RunStatus::Leased.as_str())
            .bind(owner.as_str())
            .bind(locked_until)
            .bind(now_ms)
            .bind(now_ms)
            .bind(RunStatus::Pending.as_str())
            .bind(now_ms)
            .bind(now_ms)
            .bind(batch as i64)
            .fetch_all(&mut **tx)
            .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let run = JobRun::try_from(row)?;
            let sql = format!(
                "SELECT topic, payload FROM {jobs} WHERE id = ?",
                jobs = self.tables().jobs()
            );
            let (topic, payload): (String, Option<Vec<u8>>) = sqlx::query_as(&sql)
                .bind(run.job_id.to_string())
                .fetch_one(&mut **tx)
                .await?;
            claimed.push(ClaimedRun {
                run,
                topic,
                payload,
            });
        }
        claimed.sort_by(|a, b| {
            (a.run.scheduled_time, a.run.id).cmp(&(b.run.scheduled_time, b.run.id))
        });
        Ok(claimed)
    }

    pub async fn complete_run_in_txn(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        owner: &OwnerToken,
        run_id: JobRunId,
        output: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now_ms = datetime_to_epoch_millis(now);
        let sql = format!(
            r#"
UPDATE {job_runs}
SET status = ?, owner_token = NULL, locked_until = NULL, end_time = ?, output = ?, updated_at = ?
WHERE id = ? AND status = ? AND owner_token = ?
            "#,
            job_runs = self.tables().job_runs()
        );
        let affected = sqlx::query(&sql)
            .bind(RunStatus::Processed.as_str())
            .bind(now_ms)
            .bind(output)
            .bind(now_ms)
            .bind(run_id.to_string())
            .bind(RunStatus::Leased.as_str())
            .bind(owner.as_str())
            .execute(&mut **tx)
            .await?
            .rows_affected();
        Ok(affected == 1)
    }

    /// Restore expired run leases to pending with a retry bump.
    pub async fn reap_expired_runs(&self, now: DateTime<Utc>) -> Result<usize> {
        let now_ms = datetime_to_epoch_millis(now);
        let sql = format!(
            r#"
UPDATE {job_runs}
SET status = ?, owner_token = NULL, locked_until = NULL, updated_at = ?
WHERE status = ? AND locked_until IS NOT NULL AND locked_until <= ?
            "#,
            job_runs = self.tables().job_runs()
        );
        let affected = sqlx::query(&sql)
            .bind(RunStatus::Pending.as_str())
            .bind(now_ms)
            .bind(RunStatus::Leased.as_str())
            .bind(now_ms)
            .execute(self.pool())
            .await?
            .rows_affected() as usize;
        Ok(affected)
    }

    pub async fn list_job_runs(&self, job_id: JobId) -> Result<Vec<JobRun>> {
        let sql = format!(
            r#"
SELECT {columns} FROM {job_runs}
WHERE job_id = ?
ORDER BY scheduled_time ASC, id ASC
            "#,
            columns = RUN_COLUMNS,
            job_runs = self.tables().job_runs()
        );
        let rows: Vec<JobRunRow> = sqlx::query_as(&sql)
            .bind(job_id.to_string())
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(JobRun::try_from).collect()
    }

    /// Next enabled job deadline, for the scheduler sleep computation.
    pub async fn next_job_due_in_txn(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<Option<DateTime<Utc>>> {
        let sql = format!(
            "SELECT MIN(next_due_time) FROM {jobs} WHERE is_enabled = 1",
            jobs = self.tables().jobs()
        );
        let (due,): (Option<i64>,) = sqlx::query_as(&sql).fetch_one(&mut **tx).await?;
        due.map(epoch_millis_to_datetime).transpose()
    }

    /// Next pending run deadline, for the scheduler sleep computation.
    pub async fn next_run_due_in_txn(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<Option<DateTime<Utc>>> {
        let sql = format!(
            "SELECT MIN(scheduled_time) FROM {job_runs} WHERE status = ?",
            job_runs = self.tables().job_runs()
        );
        let (due,): (Option<i64>,) = sqlx::query_as(&sql)
            .bind(RunStatus::Pending.as_str())
            .fetch_one(&mut **tx)
            .await?;
        due.map(epoch_millis_to_datetime).transpose()
    }
}
