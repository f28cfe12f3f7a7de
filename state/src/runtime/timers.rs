use crate::model::TimerRow;
use crate::model::TimerRowRecord;
use crate::model::TimerStatus;
use crate::model::datetime_to_epoch_millis;
use crate::model::epoch_millis_to_datetime;
use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use conveyor_protocol::OwnerToken;
use conveyor_protocol::TimerId;
use sqlx::Sqlite;
use sqlx::Transaction;

use super::StoreRuntime;

const TIMER_COLUMNS: &str = r#"
    id, topic, payload, due_time, status, created_at, updated_at,
    locked_until, owner_token, retry_count, last_error, processed_at
"#;

impl StoreRuntime {
    /// Register a one-shot timer that materializes an outbox message when
    /// due.
    pub async fn schedule_timer(
        &self,
        topic: &str,
        payload: &[u8],
        due_time: DateTime<Utc>,
    ) -> Result<TimerId> {
        let id = TimerId::new();
        let now = datetime_to_epoch_millis(Utc::now());
        let sql = format!(
            r#"
INSERT INTO {timers} (
    id, topic, payload, due_time, status, created_at, updated_at,
    locked_until, owner_token, retry_count, last_error, processed_at
) VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL, 0, NULL, NULL)
            "#,
            timers = self.tables().timers()
        );
        sqlx::query(&sql)
            .bind(id.to_string())
            .bind(topic)
            .bind(payload)
            .bind(datetime_to_epoch_millis(due_time))
            .bind(TimerStatus::Pending.as_str())
            .bind(now)
            .bind(now)
            .execute(self.pool())
            .await?;
        Ok(id)
    }

    /// Cancel a timer that has not fired yet. Returns `false` when the
    /// timer was already claimed, processed or cancelled.
    pub async fn cancel_timer(&self, id: TimerId) -> Result<bool> {
        let now = datetime_to_epoch_millis(Utc::now());
        let sql = format!(
            "UPDATE {timers} SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
            timers = self.tables().timers()
        );
        let affected = sqlx::query(&sql)
            .bind(TimerStatus::Cancelled.as_str())
            .bind(now)
            .bind(id.to_string())
            .bind(TimerStatus::Pending.as_str())
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(affected == 1)
    }

    /// Lease due timers inside the scheduler pass transaction.
    pub async fn claim_due_timers_in_txn(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        owner: &OwnerToken,
        lease_seconds: i64,
        batch: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<TimerRow>> {
        let now_ms = datetime_to_epoch_millis(now);
        let locked_until = now_ms + lease_seconds.max(0) * 1000;
        let sql = format!(
            r#"
UPDATE {timers}
SET status = ?, owner_token = ?, locked_until = ?, updated_at = ?
WHERE id IN (
    SELECT id FROM {timers}
    WHERE status = ?
      AND due_time <= ?
      AND (locked_until IS NULL OR locked_until <= ?)
    ORDER BY due_time ASC, id ASC
    LIMIT ?
)
RETURNING {columns}
            "#,
            timers = self.tables().timers(),
            columns = TIMER_COLUMNS
        );
        let rows: Vec<TimerRowRecord> = sqlx::query_as(&sql)
            .bind(TimerStatus::Leased.as_str())
            .bind(owner.as_str())
            .bind(locked_until)
            .bind(now_ms)
            .bind(TimerStatus::Pending.as_str())
            .bind(now_ms)
            .bind(now_ms)
            .bind(batch as i64)
            .fetch_all(&mut **tx)
            .await?;
        let mut timers = rows
            .into_iter()
            .map(TimerRow::try_from)
            .collect::<Result<Vec<_>>>()?;
        timers.sort_by(|a, b| (a.due_time, a.id).cmp(&(b.due_time, b.id)));
        Ok(timers)
    }

    /// Mark a leased timer processed inside the scheduler pass transaction.
    pub async fn complete_timer_in_txn(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        owner: &OwnerToken,
        id: TimerId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now_ms = datetime_to_epoch_millis(now);
        let sql = format!(
            r#"
UPDATE {timers}
SET status = ?, owner_token = NULL, locked_until = NULL, processed_at = ?, updated_at = ?
WHERE id = ? AND status = ? AND owner_token = ?
            "#,
            timers = self.tables().timers()
        );
        let affected = sqlx::query(&sql)
            .bind(TimerStatus::Processed.as_str())
            .bind(now_ms)
            .bind(now_ms)
            .bind(id.to_string())
            .bind(TimerStatus::Leased.as_str())
            .bind(owner.as_str())
            .execute(&mut **tx)
            .await?
            .rows_affected();
        Ok(affected == 1)
    }

    /// Restore expired timer leases to pending with a retry bump; used when
    /// a scheduler died between leasing and committing outside the pass
    /// transaction.
    pub async fn reap_expired_timers(&self, now: DateTime<Utc>) -> Result<usize> {
        let now_ms = datetime_to_epoch_millis(now);
        let sql = format!(
            r#"
UPDATE {timers}
SET status = ?, owner_token = NULL, locked_until = NULL, updated_at = ?
WHERE status = ? AND locked_until IS NOT NULL AND locked_until <= ?
            "#,
            timers = self.tables().timers()
        );
        let affected = sqlx::query(&sql)
            .bind(TimerStatus::Pending.as_str())
            .bind(now_ms)
            .bind(TimerStatus::Leased.as_str())
            .bind(now_ms)
            .execute(self.pool())
            .await?
            .rows_affected() as usize;
        Ok(affected)
    }

    /// Next pending timer deadline, for the scheduler sleep computation.
    pub async fn next_timer_due_in_txn(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<Option<DateTime<Utc>>> {
        let sql = format!(
            "SELECT MIN(due_time) FROM {timers} WHERE status = ?",
            timers = self.tables().timers()
        );
        let (due,): (Option<i64>,) = sqlx::query_as(&sql)
            .bind(TimerStatus::Pending.as_str())
            .fetch_one(&mut **tx)
            .await?;
        due.map(epoch_millis_to_datetime).transpose()
    }

    pub async fn get_timer(&self, id: TimerId) -> Result<Option<TimerRow>> {
        let sql = format!(
            "SELECT {columns} FROM {timers} WHERE id = ?",
            columns = TIMER_COLUMNS,
            timers = self.tables().timers()
        );
        let row: Option<TimerRowRecord> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.map(TimerRow::try_from).transpose()
    }
}
