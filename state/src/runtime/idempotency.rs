use crate::model::BeginOutcome;
use crate::model::IdempotencyEntry;
use crate::model::IdempotencyRow;
use crate::model::IdempotencyState;
use crate::model::datetime_to_epoch_millis;
use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use conveyor_protocol::OwnerToken;
use sqlx::Sqlite;
use sqlx::Transaction;
use std::time::Duration;

use super::StoreRuntime;

const IDEMPOTENCY_COLUMNS: &str = r#"
    key, state, owner, locked_until, outcome, error_code, error_message,
    created_at, updated_at
"#;

impl StoreRuntime {
    /// Try to open a key-scoped execution window.
    ///
    /// Exactly one concurrent caller gets `Fresh`; everyone else observes
    /// the key's current state. An expired in-progress lock is taken over
    /// and reported as `Fresh { prior_attempt: true }` so the caller can
    /// probe for a side effect the interrupted attempt may have landed.
    pub async fn begin_idempotent(
        &self,
        key: &str,
        owner: &OwnerToken,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome> {
        let now_ms = datetime_to_epoch_millis(now);
        let deadline_ms = now_ms + i64::try_from(ttl.as_millis())?;
        let mut tx = self.pool().begin().await?;

        let sql = format!(
            r#"
INSERT INTO {idempotency} (
    key, state, owner, locked_until, outcome, error_code, error_message,
    created_at, updated_at
) VALUES (?, ?, ?, ?, NULL, NULL, NULL, ?, ?)
ON CONFLICT (key) DO NOTHING
            "#,
            idempotency = self.tables().idempotency()
        );
        let inserted = sqlx::query(&sql)
            .bind(key)
            .bind(IdempotencyState::InProgress.as_str())
            .bind(owner.as_str())
            .bind(deadline_ms)
            .bind(now_ms)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if inserted == 1 {
            tx.commit().await?;
            return Ok(BeginOutcome::Fresh {
                prior_attempt: false,
            });
        }

        let entry = self
            .fetch_idempotency_in_txn(&mut tx, key)
            .await?
            .ok_or_else(|| anyhow::anyhow!("idempotency row for {key} vanished mid-begin"))?;
        match entry.state {
            IdempotencyState::Completed => {
                tx.commit().await?;
                Ok(BeginOutcome::AlreadyCompleted {
                    outcome: entry.outcome,
                })
            }
            IdempotencyState::Failed => {
                tx.commit().await?;
                Ok(BeginOutcome::AlreadyFailed {
                    error_code: entry.error_code,
                    error_message: entry.error_message,
                })
            }
            IdempotencyState::InProgress => {
                let expired = entry.locked_until.is_some_and(|deadline| deadline <= now);
                if !expired {
                    tx.commit().await?;
                    return Ok(BeginOutcome::AlreadyInProgress {
                        owner: entry.owner,
                        deadline: entry.locked_until,
                    });
                }
                // The lock lapsed: take it over, whoever held it.
                let sql = format!(
                    r#"
UPDATE {idempotency}
SET owner = ?, locked_until = ?, updated_at = ?
WHERE key = ? AND state = ? AND locked_until IS NOT NULL AND locked_until <= ?
                    "#,
                    idempotency = self.tables().idempotency()
                );
                let reclaimed = sqlx::query(&sql)
                    .bind(owner.as_str())
                    .bind(deadline_ms)
                    .bind(now_ms)
                    .bind(key)
                    .bind(IdempotencyState::InProgress.as_str())
                    .bind(now_ms)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                tx.commit().await?;
                if reclaimed == 1 {
                    Ok(BeginOutcome::Fresh { prior_attempt: true })
                } else {
                    Ok(BeginOutcome::AlreadyInProgress {
                        owner: entry.owner,
                        deadline: entry.locked_until,
                    })
                }
            }
        }
    }

    /// Record the successful outcome. Allowed only while the caller still
    /// holds the in-progress lock.
    pub async fn complete_idempotent(
        &self,
        key: &str,
        owner: &OwnerToken,
        outcome: Option<&[u8]>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now_ms = datetime_to_epoch_millis(now);
        let sql = format!(
            r#"
UPDATE {idempotency}
SET state = ?, outcome = ?, locked_until = NULL, updated_at = ?
WHERE key = ? AND state = ? AND owner = ?
            "#,
            idempotency = self.tables().idempotency()
        );
        let affected = sqlx::query(&sql)
            .bind(IdempotencyState::Completed.as_str())
            .bind(outcome)
            .bind(now_ms)
            .bind(key)
            .bind(IdempotencyState::InProgress.as_str())
            .bind(owner.as_str())
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(affected == 1)
    }

    /// Record a failure. A permanent failure persists as `failed`; a
    /// transient one deletes the row so a later attempt starts fresh.
    pub async fn fail_idempotent(
        &self,
        key: &str,
        owner: &OwnerToken,
        error_code: &str,
        error_message: &str,
        permanent: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = if permanent {
            let now_ms = datetime_to_epoch_millis(now);
            let sql = format!(
                r#"
UPDATE {idempotency}
SET state = ?, error_code = ?, error_message = ?, locked_until = NULL, updated_at = ?
WHERE key = ? AND state = ? AND owner = ?
                "#,
                idempotency = self.tables().idempotency()
            );
            sqlx::query(&sql)
                .bind(IdempotencyState::Failed.as_str())
                .bind(error_code)
                .bind(error_message)
                .bind(now_ms)
                .bind(key)
                .bind(IdempotencyState::InProgress.as_str())
                .bind(owner.as_str())
                .execute(self.pool())
                .await?
                .rows_affected()
        } else {
            let sql = format!(
                "DELETE FROM {idempotency} WHERE key = ? AND state = ? AND owner = ?",
                idempotency = self.tables().idempotency()
            );
            sqlx::query(&sql)
                .bind(key)
                .bind(IdempotencyState::InProgress.as_str())
                .bind(owner.as_str())
                .execute(self.pool())
                .await?
                .rows_affected()
        };
        Ok(affected == 1)
    }

    pub async fn get_idempotency_entry(&self, key: &str) -> Result<Option<IdempotencyEntry>> {
        let sql = format!(
            "SELECT {columns} FROM {idempotency} WHERE key = ?",
            columns = IDEMPOTENCY_COLUMNS,
            idempotency = self.tables().idempotency()
        );
        let row: Option<IdempotencyRow> = sqlx::query_as(&sql)
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        row.map(IdempotencyEntry::try_from).transpose()
    }

    /// Delete settled entries past the retention window.
    pub async fn sweep_idempotency(
        &self,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let cutoff = datetime_to_epoch_millis(now) - i64::try_from(retention.as_millis())?;
        let sql = format!(
            "DELETE FROM {idempotency} WHERE state IN (?, ?) AND updated_at < ?",
            idempotency = self.tables().idempotency()
        );
        let affected = sqlx::query(&sql)
            .bind(IdempotencyState::Completed.as_str())
            .bind(IdempotencyState::Failed.as_str())
            .bind(cutoff)
            .execute(self.pool())
            .await?
            .rows_affected() as usize;
        Ok(affected)
    }

    async fn fetch_idempotency_in_txn(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        key: &str,
    ) -> Result<Option<IdempotencyEntry>> {
        let sql = format!(
            "SELECT {columns} FROM {idempotency} WHERE key = ?",
            columns = IDEMPOTENCY_COLUMNS,
            idempotency = self.tables().idempotency()
        );
        let row: Option<IdempotencyRow> = sqlx::query_as(&sql)
            .bind(key)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(IdempotencyEntry::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::open_test_store;
    use crate::model::BeginOutcome;
    use crate::model::IdempotencyState;
    use chrono::Duration as ChronoDuration;
    use chrono::Utc;
    use conveyor_protocol::OwnerToken;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn begin_twice_from_the_same_owner_reports_in_progress_by_self() {
        let (store, dir) = open_test_store().await;
        let owner = OwnerToken::generate();
        let now = Utc::now();

        let first = store
            .begin_idempotent("send-invoice-9", &owner, TTL, now)
            .await
            .expect("first begin");
        assert_eq!(
            first,
            BeginOutcome::Fresh {
                prior_attempt: false
            }
        );

        let second = store
            .begin_idempotent("send-invoice-9", &owner, TTL, now)
            .await
            .expect("second begin");
        match second {
            BeginOutcome::AlreadyInProgress { owner: holder, .. } => {
                assert_eq!(holder.as_deref(), Some(owner.as_str()));
            }
            other => panic!("expected in-progress by self, got {other:?}"),
        }

        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    #[tokio::test]
    async fn completed_keys_suppress_later_begins_with_the_stored_outcome() {
        let (store, dir) = open_test_store().await;
        let owner = OwnerToken::generate();
        let other = OwnerToken::generate();
        let now = Utc::now();

        store
            .begin_idempotent("send-invoice-9", &owner, TTL, now)
            .await
            .expect("begin");
        assert!(
            store
                .complete_idempotent("send-invoice-9", &owner, Some(b"{\"sent\":true}"), now)
                .await
                .expect("complete")
        );

        let suppressed = store
            .begin_idempotent("send-invoice-9", &other, TTL, now)
            .await
            .expect("begin after completion");
        assert_eq!(
            suppressed,
            BeginOutcome::AlreadyCompleted {
                outcome: Some(b"{\"sent\":true}".to_vec())
            }
        );

        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    #[tokio::test]
    async fn expired_in_progress_locks_are_reclaimed_with_a_prior_attempt_flag() {
        let (store, dir) = open_test_store().await;
        let crashed = OwnerToken::generate();
        let successor = OwnerToken::generate();
        let now = Utc::now();

        store
            .begin_idempotent("send-invoice-9", &crashed, Duration::from_secs(1), now)
            .await
            .expect("begin");

        // Before the deadline the key is protected.
        let blocked = store
            .begin_idempotent("send-invoice-9", &successor, TTL, now)
            .await
            .expect("begin while locked");
        assert!(matches!(blocked, BeginOutcome::AlreadyInProgress { .. }));

        // After the deadline the lock is taken over.
        let reclaimed = store
            .begin_idempotent(
                "send-invoice-9",
                &successor,
                TTL,
                now + ChronoDuration::seconds(2),
            )
            .await
            .expect("begin after expiry");
        assert_eq!(reclaimed, BeginOutcome::Fresh { prior_attempt: true });

        // The crashed owner can no longer settle the key.
        assert!(
            !store
                .complete_idempotent("send-invoice-9", &crashed, None, now)
                .await
                .expect("stale complete")
        );

        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    #[tokio::test]
    async fn transient_failure_deletes_the_row_and_permanent_failure_keeps_it() {
        let (store, dir) = open_test_store().await;
        let owner = OwnerToken::generate();
        let now = Utc::now();

        store
            .begin_idempotent("k-transient", &owner, TTL, now)
            .await
            .expect("begin transient");
        assert!(
            store
                .fail_idempotent("k-transient", &owner, "timeout", "upstream timeout", false, now)
                .await
                .expect("fail transient")
        );
        assert_eq!(
            store
                .get_idempotency_entry("k-transient")
                .await
                .expect("get transient"),
            None
        );

        store
            .begin_idempotent("k-permanent", &owner, TTL, now)
            .await
            .expect("begin permanent");
        assert!(
            store
                .fail_idempotent("k-permanent", &owner, "validation", "bad payload", true, now)
                .await
                .expect("fail permanent")
        );
        let entry = store
            .get_idempotency_entry("k-permanent")
            .await
            .expect("get permanent")
            .expect("entry exists");
        assert_eq!(entry.state, IdempotencyState::Failed);
        assert_eq!(entry.error_code.as_deref(), Some("validation"));

        let blocked = store
            .begin_idempotent("k-permanent", &owner, TTL, now)
            .await
            .expect("begin after permanent failure");
        assert!(matches!(blocked, BeginOutcome::AlreadyFailed { .. }));

        let _ = tokio::fs::remove_dir_all(dir).await;
    }
}
