use crate::model::datetime_to_epoch_millis;
use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use sqlx::Sqlite;
use sqlx::Transaction;

use super::StoreRuntime;

impl StoreRuntime {
    /// Record a scheduler pass under `fencing_token`.
    ///
    /// The singleton row keeps the highest token it has seen. A pass whose
    /// token is lower than the stored one gets `false` back and must abort
    /// without materializing anything: a newer leaseholder has already run.
    pub async fn advance_scheduler_state_in_txn(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        fencing_token: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now_ms = datetime_to_epoch_millis(now);
        let sql = format!(
            r#"
INSERT INTO {scheduler_state} (id, current_fencing_token, last_run_at)
VALUES (1, ?, ?)
ON CONFLICT (id) DO UPDATE SET
    current_fencing_token = excluded.current_fencing_token,
    last_run_at = excluded.last_run_at
WHERE excluded.current_fencing_token >= {scheduler_state}.current_fencing_token
            "#,
            scheduler_state = self.tables().scheduler_state()
        );
        let affected = sqlx::query(&sql)
            .bind(fencing_token)
            .bind(now_ms)
            .execute(&mut **tx)
            .await?
            .rows_affected();
        Ok(affected == 1)
    }

    pub async fn current_fencing_token(&self) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT current_fencing_token FROM {scheduler_state} WHERE id = 1",
            scheduler_state = self.tables().scheduler_state()
        );
        let row: Option<(i64,)> = sqlx::query_as(&sql).fetch_optional(self.pool()).await?;
        Ok(row.map(|(token,)| token))
    }
}
