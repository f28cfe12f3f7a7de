use crate::METRIC_CLAIM_BATCH_SIZE;
use crate::METRIC_CLAIM_DURATION_MS;
use crate::METRIC_ITEMS_ABANDONED;
use crate::METRIC_ITEMS_ACKED;
use crate::METRIC_ITEMS_CLAIMED;
use crate::METRIC_ITEMS_FAILED;
use crate::METRIC_ITEMS_REAPED;
use crate::METRIC_ITEMS_SWEPT;
use crate::METRIC_SETTLE_DURATION_MS;
use crate::model::EnqueueOutbox;
use crate::model::EnqueueOutcome;
use crate::model::OutboxMessage;
use crate::model::OutboxRow;
use crate::model::OutboxStatus;
use crate::model::datetime_to_epoch_millis;
use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use conveyor_protocol::MessageId;
use conveyor_protocol::OwnerToken;
use sqlx::QueryBuilder;
use sqlx::Sqlite;
use sqlx::SqliteConnection;
use sqlx::Transaction;
use std::time::Duration;

use super::StoreRuntime;

const QUEUE_TAG: (&str, &str) = ("queue", "outbox");

impl StoreRuntime {
    /// Insert one pending outbox message.
    pub async fn enqueue(&self, params: &EnqueueOutbox) -> Result<EnqueueOutcome> {
        let mut conn = self.pool().acquire().await?;
        self.enqueue_on(&mut *conn, params).await
    }

    /// Insert one pending outbox message inside the caller's transaction so
    /// the enqueue commits (or rolls back) with the caller's domain write.
    pub async fn enqueue_in_txn(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        params: &EnqueueOutbox,
    ) -> Result<EnqueueOutcome> {
        self.enqueue_on(&mut *tx, params).await
    }

    async fn enqueue_on(
        &self,
        conn: &mut SqliteConnection,
        params: &EnqueueOutbox,
    ) -> Result<EnqueueOutcome> {
        let id = MessageId::new();
        let now = datetime_to_epoch_millis(Utc::now());
        let sql = format!(
            r#"
INSERT INTO {outbox} (
    id,
    topic,
    payload,
    correlation_id,
    message_key,
    status,
    created_at,
    updated_at,
    due_time,
    locked_until,
    owner_token,
    retry_count,
    last_error,
    processed_at,
    processed_by
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, 0, NULL, NULL, NULL)
ON CONFLICT (message_key) DO NOTHING
            "#,
            outbox = self.tables().outbox()
        );
        let result = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(params.topic.as_str())
            .bind(params.payload.as_slice())
            .bind(params.correlation_id.as_deref())
            .bind(params.message_key.as_deref())
            .bind(OutboxStatus::Pending.as_str())
            .bind(now)
            .bind(now)
            .bind(params.due_time.map(datetime_to_epoch_millis))
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 1 {
            return Ok(EnqueueOutcome::Created(id));
        }

        let message_key = params
            .message_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("enqueue inserted no row without a message key"))?;
        let sql = format!(
            "SELECT id FROM {outbox} WHERE message_key = ?",
            outbox = self.tables().outbox()
        );
        let existing: (String,) = sqlx::query_as(&sql)
            .bind(message_key)
            .fetch_one(&mut *conn)
            .await?;
        Ok(EnqueueOutcome::Duplicate(existing.0.parse()?))
    }

    /// Atomically lease up to `batch` due pending messages for `owner`.
    ///
    /// Rows come back in `(created_at, id)` order. A row whose `due_time`
    /// just elapsed competes equally with older rows.
    pub async fn claim_outbox(
        &self,
        owner: &OwnerToken,
        lease_seconds: i64,
        batch: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>> {
        let _timer = self.start_timer(METRIC_CLAIM_DURATION_MS, &[QUEUE_TAG]);
        let now_ms = datetime_to_epoch_millis(now);
        let locked_until = now_ms + lease_seconds.max(0) * 1000;
        let sql = format!(
            r#"
UPDATE {outbox}
SET
    status = ?,
    owner_token = ?,
    locked_until = ?,
    updated_at = ?
WHERE id IN (
    SELECT id FROM {outbox}
    WHERE status = ?
      AND (locked_until IS NULL OR locked_until <= ?)
      AND (due_time IS NULL OR due_time <= ?)
    ORDER BY created_at ASC, id ASC
    LIMIT ?
)
RETURNING
    id, topic, payload, correlation_id, message_key, status,
    created_at, updated_at, due_time, locked_until, owner_token,
    retry_count, last_error, processed_at, processed_by
            "#,
            outbox = self.tables().outbox()
        );
        let rows: Vec<OutboxRow> = sqlx::query_as(&sql)
            .bind(OutboxStatus::Leased.as_str())
            .bind(owner.as_str())
            .bind(locked_until)
            .bind(now_ms)
            .bind(OutboxStatus::Pending.as_str())
            .bind(now_ms)
            .bind(now_ms)
            .bind(batch as i64)
            .fetch_all(self.pool())
            .await?;

        let mut messages = rows
            .into_iter()
            .map(OutboxMessage::try_from)
            .collect::<Result<Vec<_>>>()?;
        messages.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));

        self.emit_count(METRIC_ITEMS_CLAIMED, messages.len() as i64, &[QUEUE_TAG]);
        self.emit_histogram(METRIC_CLAIM_BATCH_SIZE, messages.len() as i64, &[QUEUE_TAG]);
        Ok(messages)
    }

    /// Mark leased messages dispatched. Only rows still leased by `owner`
    /// are affected; the count of transitioned rows is returned.
    ///
    /// Join members attached to acknowledged messages advance inside the
    /// same transaction.
    pub async fn ack_outbox(
        &self,
        owner: &OwnerToken,
        ids: &[MessageId],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let timer = self.start_timer(METRIC_SETTLE_DURATION_MS, &[QUEUE_TAG, ("op", "ack")]);
        let now_ms = datetime_to_epoch_millis(now);
        let mut tx = self.pool().begin().await?;

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "UPDATE {outbox} SET status = ",
            outbox = self.tables().outbox()
        ));
        builder.push_bind(OutboxStatus::Dispatched.as_str());
        builder.push(", owner_token = NULL, locked_until = NULL, processed_at = ");
        builder.push_bind(now_ms);
        builder.push(", processed_by = ");
        builder.push_bind(owner.as_str());
        builder.push(", updated_at = ");
        builder.push_bind(now_ms);
        builder.push(" WHERE status = ");
        builder.push_bind(OutboxStatus::Leased.as_str());
        builder.push(" AND owner_token = ");
        builder.push_bind(owner.as_str());
        builder.push(" AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.to_string());
        }
        builder.push(") RETURNING id");

        let acked: Vec<(String,)> = builder.build_query_as().fetch_all(&mut *tx).await?;
        for (message_id,) in &acked {
            self.note_join_member_terminal(&mut tx, message_id, now_ms, true)
                .await?;
        }
        tx.commit().await?;

        drop(timer);
        self.emit_count(METRIC_ITEMS_ACKED, acked.len() as i64, &[QUEUE_TAG]);
        Ok(acked.len())
    }

    /// Return leased messages to pending with a retry-count bump, optionally
    /// delaying their next visibility.
    pub async fn abandon_outbox(
        &self,
        owner: &OwnerToken,
        ids: &[MessageId],
        error: Option<&str>,
        retry_delay: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let timer = self.start_timer(METRIC_SETTLE_DURATION_MS, &[QUEUE_TAG, ("op", "abandon")]);
        let now_ms = datetime_to_epoch_millis(now);
        let next_due = match retry_delay {
            Some(delay) => Some(now_ms + i64::try_from(delay.as_millis())?),
            None => None,
        };

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "UPDATE {outbox} SET status = ",
            outbox = self.tables().outbox()
        ));
        builder.push_bind(OutboxStatus::Pending.as_str());
        builder.push(", owner_token = NULL, locked_until = NULL, retry_count = retry_count + 1");
        builder.push(", last_error = COALESCE(");
        builder.push_bind(error);
        builder.push(", last_error), due_time = COALESCE(");
        builder.push_bind(next_due);
        builder.push(", due_time), updated_at = ");
        builder.push_bind(now_ms);
        builder.push(" WHERE status = ");
        builder.push_bind(OutboxStatus::Leased.as_str());
        builder.push(" AND owner_token = ");
        builder.push_bind(owner.as_str());
        builder.push(" AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.to_string());
        }
        builder.push(")");

        let affected = builder.build().execute(self.pool()).await?.rows_affected() as usize;
        drop(timer);
        self.emit_count(METRIC_ITEMS_ABANDONED, affected as i64, &[QUEUE_TAG]);
        Ok(affected)
    }

    /// Move leased messages to their terminal failed state.
    pub async fn fail_outbox(
        &self,
        owner: &OwnerToken,
        ids: &[MessageId],
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let timer = self.start_timer(METRIC_SETTLE_DURATION_MS, &[QUEUE_TAG, ("op", "fail")]);
        let now_ms = datetime_to_epoch_millis(now);
        let mut tx = self.pool().begin().await?;

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "UPDATE {outbox} SET status = ",
            outbox = self.tables().outbox()
        ));
        builder.push_bind(OutboxStatus::Failed.as_str());
        builder.push(", owner_token = NULL, locked_until = NULL, last_error = ");
        builder.push_bind(error);
        builder.push(", processed_at = ");
        builder.push_bind(now_ms);
        builder.push(", processed_by = ");
        builder.push_bind(owner.as_str());
        builder.push(", updated_at = ");
        builder.push_bind(now_ms);
        builder.push(" WHERE status = ");
        builder.push_bind(OutboxStatus::Leased.as_str());
        builder.push(" AND owner_token = ");
        builder.push_bind(owner.as_str());
        builder.push(" AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.to_string());
        }
        builder.push(") RETURNING id");

        let failed: Vec<(String,)> = builder.build_query_as().fetch_all(&mut *tx).await?;
        for (message_id,) in &failed {
            self.note_join_member_terminal(&mut tx, message_id, now_ms, false)
                .await?;
        }
        tx.commit().await?;

        drop(timer);
        self.emit_count(METRIC_ITEMS_FAILED, failed.len() as i64, &[QUEUE_TAG]);
        Ok(failed.len())
    }

    /// Push `locked_until` out for rows still leased by `owner`; used while
    /// their handlers are at risk of outliving the original lease.
    pub async fn extend_outbox_leases(
        &self,
        owner: &OwnerToken,
        ids: &[MessageId],
        lease_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let now_ms = datetime_to_epoch_millis(now);
        let locked_until = now_ms + lease_seconds.max(0) * 1000;
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "UPDATE {outbox} SET locked_until = ",
            outbox = self.tables().outbox()
        ));
        builder.push_bind(locked_until);
        builder.push(", updated_at = ");
        builder.push_bind(now_ms);
        builder.push(" WHERE status = ");
        builder.push_bind(OutboxStatus::Leased.as_str());
        builder.push(" AND owner_token = ");
        builder.push_bind(owner.as_str());
        builder.push(" AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.to_string());
        }
        builder.push(")");
        Ok(builder.build().execute(self.pool()).await?.rows_affected() as usize)
    }

    /// Restore expired leases to pending without touching the retry count:
    /// the previous worker crashed without making progress.
    pub async fn reap_expired_outbox(&self, now: DateTime<Utc>) -> Result<usize> {
        let now_ms = datetime_to_epoch_millis(now);
        let sql = format!(
            r#"
UPDATE {outbox}
SET status = ?, owner_token = NULL, locked_until = NULL, updated_at = ?
WHERE status = ? AND locked_until IS NOT NULL AND locked_until <= ?
            "#,
            outbox = self.tables().outbox()
        );
        let affected = sqlx::query(&sql)
            .bind(OutboxStatus::Pending.as_str())
            .bind(now_ms)
            .bind(OutboxStatus::Leased.as_str())
            .bind(now_ms)
            .execute(self.pool())
            .await?
            .rows_affected() as usize;
        self.emit_count(METRIC_ITEMS_REAPED, affected as i64, &[QUEUE_TAG]);
        Ok(affected)
    }

    /// Delete dispatched messages past the retention window.
    pub async fn sweep_dispatched_outbox(
        &self,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let cutoff = datetime_to_epoch_millis(now) - i64::try_from(retention.as_millis())?;
        let sql = format!(
            "DELETE FROM {outbox} WHERE status = ? AND processed_at IS NOT NULL AND processed_at < ?",
            outbox = self.tables().outbox()
        );
        let affected = sqlx::query(&sql)
            .bind(OutboxStatus::Dispatched.as_str())
            .bind(cutoff)
            .execute(self.pool())
            .await?
            .rows_affected() as usize;
        self.emit_count(METRIC_ITEMS_SWEPT, affected as i64, &[QUEUE_TAG]);
        Ok(affected)
    }

    pub async fn get_outbox_message(&self, id: MessageId) -> Result<Option<OutboxMessage>> {
        let sql = format!(
            r#"
SELECT
    id, topic, payload, correlation_id, message_key, status,
    created_at, updated_at, due_time, locked_until, owner_token,
    retry_count, last_error, processed_at, processed_by
FROM {outbox}
WHERE id = ?
            "#,
            outbox = self.tables().outbox()
        );
        let row: Option<OutboxRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.map(OutboxMessage::try_from).transpose()
    }

    pub async fn count_outbox_with_status(&self, status: OutboxStatus) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {outbox} WHERE status = ?",
            outbox = self.tables().outbox()
        );
        let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(status.as_str())
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }
}
