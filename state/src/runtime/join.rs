use crate::model::JoinRecord;
use crate::model::JoinRow;
use crate::model::JoinStatus;
use crate::model::datetime_to_epoch_millis;
use anyhow::Result;
use anyhow::bail;
use chrono::DateTime;
use chrono::Utc;
use conveyor_protocol::JoinId;
use conveyor_protocol::MessageId;
use sqlx::Sqlite;
use sqlx::Transaction;
use std::time::Duration;

use super::StoreRuntime;

const JOIN_COLUMNS: &str = r#"
    join_id, tenant_id, expected_steps, completed_steps, failed_steps,
    status, created_at, last_updated_at, metadata
"#;

impl StoreRuntime {
    /// Create a fan-in barrier expecting `expected_steps` member messages.
    pub async fn start_join(
        &self,
        tenant_id: &str,
        expected_steps: i64,
        metadata: Option<&str>,
    ) -> Result<JoinId> {
        if expected_steps <= 0 {
            bail!("join requires a positive expected step count, got {expected_steps}");
        }
        let join_id = JoinId::new();
        let now = datetime_to_epoch_millis(Utc::now());
        let sql = format!(
            r#"
INSERT INTO {joins} (
    join_id, tenant_id, expected_steps, completed_steps, failed_steps,
    status, created_at, last_updated_at, metadata
) VALUES (?, ?, ?, 0, 0, ?, ?, ?, ?)
            "#,
            joins = self.tables().joins()
        );
        sqlx::query(&sql)
            .bind(join_id.to_string())
            .bind(tenant_id)
            .bind(expected_steps)
            .bind(JoinStatus::Pending.as_str())
            .bind(now)
            .bind(now)
            .bind(metadata)
            .execute(self.pool())
            .await?;
        Ok(join_id)
    }

    /// Attach an outbox message to a join. Idempotent on
    /// `(join_id, outbox_message_id)`.
    pub async fn attach_join_message(
        &self,
        join_id: JoinId,
        outbox_message_id: MessageId,
    ) -> Result<()> {
        let sql = format!(
            r#"
INSERT INTO {join_members} (join_id, outbox_message_id, completed_at, failed_at)
VALUES (?, ?, NULL, NULL)
ON CONFLICT (join_id, outbox_message_id) DO NOTHING
            "#,
            join_members = self.tables().join_members()
        );
        sqlx::query(&sql)
            .bind(join_id.to_string())
            .bind(outbox_message_id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn get_join(&self, join_id: JoinId) -> Result<Option<JoinRecord>> {
        let sql = format!(
            "SELECT {columns} FROM {joins} WHERE join_id = ?",
            columns = JOIN_COLUMNS,
            joins = self.tables().joins()
        );
        let row: Option<JoinRow> = sqlx::query_as(&sql)
            .bind(join_id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.map(JoinRecord::try_from).transpose()
    }

    /// Delete settled joins (and their members) past the retention window.
    pub async fn sweep_settled_joins(
        &self,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let cutoff = datetime_to_epoch_millis(now) - i64::try_from(retention.as_millis())?;
        let mut tx = self.pool().begin().await?;
        let sql = format!(
            r#"
DELETE FROM {join_members}
WHERE join_id IN (
    SELECT join_id FROM {joins}
    WHERE status IN (?, ?) AND last_updated_at < ?
)
            "#,
            join_members = self.tables().join_members(),
            joins = self.tables().joins()
        );
        sqlx::query(&sql)
            .bind(JoinStatus::Satisfied.as_str())
            .bind(JoinStatus::Failed.as_str())
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        let sql = format!(
            "DELETE FROM {joins} WHERE status IN (?, ?) AND last_updated_at < ?",
            joins = self.tables().joins()
        );
        let affected = sqlx::query(&sql)
            .bind(JoinStatus::Satisfied.as_str())
            .bind(JoinStatus::Failed.as_str())
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        tx.commit().await?;
        Ok(affected)
    }

    /// Stamp a member terminal and advance its joins' counters. Runs inside
    /// the outbox ack/fail transaction so the barrier moves atomically with
    /// the message transition. Counters only advance while
    /// `completed + failed < expected`; settlement flips the status once all
    /// members are terminal.
    pub(crate) async fn note_join_member_terminal(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        outbox_message_id: &str,
        now_ms: i64,
        completed: bool,
    ) -> Result<()> {
        let sql = format!(
            r#"
SELECT join_id FROM {join_members}
WHERE outbox_message_id = ? AND completed_at IS NULL AND failed_at IS NULL
            "#,
            join_members = self.tables().join_members()
        );
        let join_ids: Vec<(String,)> = sqlx::query_as(&sql)
            .bind(outbox_message_id)
            .fetch_all(&mut **tx)
            .await?;

        for (join_id,) in join_ids {
            let stamp_column = if completed { "completed_at" } else { "failed_at" };
            let sql = format!(
                r#"
UPDATE {join_members}
SET {stamp_column} = ?
WHERE join_id = ? AND outbox_message_id = ?
  AND completed_at IS NULL AND failed_at IS NULL
                "#,
                join_members = self.tables().join_members()
            );
            let stamped = sqlx::query(&sql)
                .bind(now_ms)
                .bind(&join_id)
                .bind(outbox_message_id)
                .execute(&mut **tx)
                .await?
                .rows_affected();
            if stamped == 0 {
                continue;
            }

            let counter_column = if completed {
                "completed_steps"
            } else {
                "failed_steps"
            };
            let sql = format!(
                r#"
UPDATE {joins}
SET {counter_column} = {counter_column} + 1, last_updated_at = ?
WHERE join_id = ? AND completed_steps + failed_steps < expected_steps
                "#,
                joins = self.tables().joins()
            );
            sqlx::query(&sql)
                .bind(now_ms)
                .bind(&join_id)
                .execute(&mut **tx)
                .await?;

            let sql = format!(
                r#"
UPDATE {joins}
SET status = CASE
        WHEN completed_steps >= expected_steps THEN ?
        WHEN completed_steps + failed_steps >= expected_steps THEN ?
        ELSE status
    END,
    last_updated_at = ?
WHERE join_id = ? AND status = ?
                "#,
                joins = self.tables().joins()
            );
            sqlx::query(&sql)
                .bind(JoinStatus::Satisfied.as_str())
                .bind(JoinStatus::Failed.as_str())
                .bind(now_ms)
                .bind(&join_id)
                .bind(JoinStatus::Pending.as_str())
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }
}
