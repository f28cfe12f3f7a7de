use crate::METRIC_CLAIM_DURATION_MS;
use crate::METRIC_ITEMS_ABANDONED;
use crate::METRIC_ITEMS_ACKED;
use crate::METRIC_ITEMS_CLAIMED;
use crate::METRIC_ITEMS_FAILED;
use crate::METRIC_ITEMS_REAPED;
use crate::METRIC_ITEMS_SWEPT;
use crate::METRIC_SETTLE_DURATION_MS;
use crate::model::AcceptOutcome;
use crate::model::InboxRecord;
use crate::model::InboxRow;
use crate::model::InboxStatus;
use crate::model::datetime_to_epoch_millis;
use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use conveyor_protocol::MessageId;
use conveyor_protocol::OwnerToken;
use sqlx::QueryBuilder;
use sqlx::Sqlite;
use std::time::Duration;

use super::StoreRuntime;

const QUEUE_TAG: (&str, &str) = ("queue", "inbox");

const INBOX_COLUMNS: &str = r#"
    id, source, message_key, payload, status, created_at, updated_at,
    locked_until, owner_token, retry_count, last_error, processed_at
"#;

impl StoreRuntime {
    /// Accept an externally received message.
    ///
    /// `(source, message_key)` is the dedup primitive: a second accept of
    /// the same key is a silent no-op that reports the existing record's
    /// status.
    pub async fn accept_inbox(
        &self,
        source: &str,
        message_key: &str,
        payload: &[u8],
    ) -> Result<AcceptOutcome> {
        let id = MessageId::new();
        let now = datetime_to_epoch_millis(Utc::now());
        let sql = format!(
            r#"
INSERT INTO {inbox} (
    id, source, message_key, payload, status, created_at, updated_at,
    locked_until, owner_token, retry_count, last_error, processed_at
) VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL, 0, NULL, NULL)
ON CONFLICT (source, message_key) DO NOTHING
            "#,
            inbox = self.tables().inbox()
        );
        let result = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(source)
            .bind(message_key)
            .bind(payload)
            .bind(InboxStatus::Pending.as_str())
            .bind(now)
            .bind(now)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 1 {
            return Ok(AcceptOutcome::Created(id));
        }

        let sql = format!(
            "SELECT id, status FROM {inbox} WHERE source = ? AND message_key = ?",
            inbox = self.tables().inbox()
        );
        let (existing_id, status): (String, String) = sqlx::query_as(&sql)
            .bind(source)
            .bind(message_key)
            .fetch_one(self.pool())
            .await?;
        Ok(AcceptOutcome::Duplicate(
            existing_id.parse()?,
            InboxStatus::parse(status.as_str())?,
        ))
    }

    /// Lease up to `batch` pending records while keeping each `source`
    /// strictly serialized: only the head record of a source is eligible,
    /// and never while the source still has a live leased record.
    pub async fn claim_inbox(
        &self,
        owner: &OwnerToken,
        lease_seconds: i64,
        batch: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<InboxRecord>> {
        let _timer = self.start_timer(METRIC_CLAIM_DURATION_MS, &[QUEUE_TAG]);
        let now_ms = datetime_to_epoch_millis(now);
        let locked_until = now_ms + lease_seconds.max(0) * 1000;
        let sql = format!(
            r#"
UPDATE {inbox}
SET status = ?, owner_token = ?, locked_until = ?, updated_at = ?
WHERE id IN (
    SELECT i.id FROM {inbox} i
    WHERE i.status = ?
      AND (i.locked_until IS NULL OR i.locked_until <= ?)
      AND NOT EXISTS (
          SELECT 1 FROM {inbox} l
          WHERE l.source = i.source AND l.status = ? AND l.locked_until > ?
      )
      AND NOT EXISTS (
          SELECT 1 FROM {inbox} e
          WHERE e.source = i.source
            AND e.status = ?
            AND (e.created_at < i.created_at
                 OR (e.created_at = i.created_at AND e.id < i.id))
      )
    ORDER BY i.created_at ASC, i.id ASC
    LIMIT ?
)
RETURNING {columns}
            "#,
            inbox = self.tables().inbox(),
            columns = INBOX_COLUMNS
        );
        let rows: Vec<InboxRow> = sqlx::query_as(&sql)
            .bind(InboxStatus::Leased.as_str())
            .bind(owner.as_str())
            .bind(locked_until)
            .bind(now_ms)
            .bind(InboxStatus::Pending.as_str())
            .bind(now_ms)
            .bind(InboxStatus::Leased.as_str())
            .bind(now_ms)
            .bind(InboxStatus::Pending.as_str())
            .bind(batch as i64)
            .fetch_all(self.pool())
            .await?;

        let mut records = rows
            .into_iter()
            .map(InboxRecord::try_from)
            .collect::<Result<Vec<_>>>()?;
        records.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));

        self.emit_count(METRIC_ITEMS_CLAIMED, records.len() as i64, &[QUEUE_TAG]);
        Ok(records)
    }

    pub async fn ack_inbox(
        &self,
        owner: &OwnerToken,
        ids: &[MessageId],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let timer = self.start_timer(METRIC_SETTLE_DURATION_MS, &[QUEUE_TAG, ("op", "ack")]);
        let now_ms = datetime_to_epoch_millis(now);
        let affected = self
            .settle_inbox(owner, ids, InboxStatus::Processed, None, now_ms)
            .await?;
        drop(timer);
        self.emit_count(METRIC_ITEMS_ACKED, affected as i64, &[QUEUE_TAG]);
        Ok(affected)
    }

    pub async fn fail_inbox(
        &self,
        owner: &OwnerToken,
        ids: &[MessageId],
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let timer = self.start_timer(METRIC_SETTLE_DURATION_MS, &[QUEUE_TAG, ("op", "fail")]);
        let now_ms = datetime_to_epoch_millis(now);
        let affected = self
            .settle_inbox(owner, ids, InboxStatus::Failed, Some(error), now_ms)
            .await?;
        drop(timer);
        self.emit_count(METRIC_ITEMS_FAILED, affected as i64, &[QUEUE_TAG]);
        Ok(affected)
    }

    async fn settle_inbox(
        &self,
        owner: &OwnerToken,
        ids: &[MessageId],
        status: InboxStatus,
        error: Option<&str>,
        now_ms: i64,
    ) -> Result<usize> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "UPDATE {inbox} SET status = ",
            inbox = self.tables().inbox()
        ));
        builder.push_bind(status.as_str());
        builder.push(", owner_token = NULL, locked_until = NULL, processed_at = ");
        builder.push_bind(now_ms);
        builder.push(", last_error = COALESCE(");
        builder.push_bind(error);
        builder.push(", last_error), updated_at = ");
        builder.push_bind(now_ms);
        builder.push(" WHERE status = ");
        builder.push_bind(InboxStatus::Leased.as_str());
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

    pub async fn abandon_inbox(
        &self,
        owner: &OwnerToken,
        ids: &[MessageId],
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let timer = self.start_timer(METRIC_SETTLE_DURATION_MS, &[QUEUE_TAG, ("op", "abandon")]);
        let now_ms = datetime_to_epoch_millis(now);
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "UPDATE {inbox} SET status = ",
            inbox = self.tables().inbox()
        ));
        builder.push_bind(InboxStatus::Pending.as_str());
        builder.push(", owner_token = NULL, locked_until = NULL, retry_count = retry_count + 1");
        builder.push(", last_error = COALESCE(");
        builder.push_bind(error);
        builder.push(", last_error), updated_at = ");
        builder.push_bind(now_ms);
        builder.push(" WHERE status = ");
        builder.push_bind(InboxStatus::Leased.as_str());
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

    /// Push `locked_until` out for records still leased by `owner`.
    pub async fn extend_inbox_leases(
        &self,
        owner: &OwnerToken,
        ids: &[MessageId],
        lease_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let now_ms = datetime_to_epoch_millis(now);
        let locked_until = now_ms + lease_seconds.max(0) * 1000;
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "UPDATE {inbox} SET locked_until = ",
            inbox = self.tables().inbox()
        ));
        builder.push_bind(locked_until);
        builder.push(", updated_at = ");
        builder.push_bind(now_ms);
        builder.push(" WHERE status = ");
        builder.push_bind(InboxStatus::Leased.as_str());
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

    pub async fn reap_expired_inbox(&self, now: DateTime<Utc>) -> Result<usize> {
        let now_ms = datetime_to_epoch_millis(now);
        let sql = format!(
            r#"
UPDATE {inbox}
SET status = ?, owner_token = NULL, locked_until = NULL, updated_at = ?
WHERE status = ? AND locked_until IS NOT NULL AND locked_until <= ?
            "#,
            inbox = self.tables().inbox()
        );
        let affected = sqlx::query(&sql)
            .bind(InboxStatus::Pending.as_str())
            .bind(now_ms)
            .bind(InboxStatus::Leased.as_str())
            .bind(now_ms)
            .execute(self.pool())
            .await?
            .rows_affected() as usize;
        self.emit_count(METRIC_ITEMS_REAPED, affected as i64, &[QUEUE_TAG]);
        Ok(affected)
    }

    pub async fn sweep_processed_inbox(
        &self,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let cutoff = datetime_to_epoch_millis(now) - i64::try_from(retention.as_millis())?;
        let sql = format!(
            "DELETE FROM {inbox} WHERE status = ? AND processed_at IS NOT NULL AND processed_at < ?",
            inbox = self.tables().inbox()
        );
        let affected = sqlx::query(&sql)
            .bind(InboxStatus::Processed.as_str())
            .bind(cutoff)
            .execute(self.pool())
            .await?
            .rows_affected() as usize;
        self.emit_count(METRIC_ITEMS_SWEPT, affected as i64, &[QUEUE_TAG]);
        Ok(affected)
    }

    pub async fn get_inbox_record(&self, id: MessageId) -> Result<Option<InboxRecord>> {
        let sql = format!(
            "SELECT {columns} FROM {inbox} WHERE id = ?",
            columns = INBOX_COLUMNS,
            inbox = self.tables().inbox()
        );
        let row: Option<InboxRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.map(InboxRecord::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::open_test_store;
    use crate::model::AcceptOutcome;
    use crate::model::InboxStatus;
    use chrono::Utc;
    use conveyor_protocol::OwnerToken;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test]
    async fn duplicate_accept_is_a_silent_noop_reporting_existing_status() {
        let (store, dir) = open_test_store().await;
        let owner = OwnerToken::generate();

        let first = store
            .accept_inbox("billing", "evt-1", b"{}")
            .await
            .expect("first accept");
        assert!(first.is_created());

        let claimed = store
            .claim_inbox(&owner, 30, 10, Utc::now())
            .await
            .expect("claim");
        let ids: Vec<_> = claimed.iter().map(|r| r.id).collect();
        store
            .ack_inbox(&owner, &ids, Utc::now())
            .await
            .expect("ack");

        let duplicate = store
            .accept_inbox("billing", "evt-1", b"{}")
            .await
            .expect("duplicate accept");
        match duplicate {
            AcceptOutcome::Duplicate(id, status) => {
                assert_eq!(id, first.record_id());
                assert_eq!(status, InboxStatus::Processed);
            }
            AcceptOutcome::Created(_) => panic!("duplicate accept created a second record"),
        }

        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    #[tokio::test]
    async fn same_source_records_are_serialized() {
        let (store, dir) = open_test_store().await;
        let owner = OwnerToken::generate();

        store
            .accept_inbox("billing", "evt-1", b"{}")
            .await
            .expect("accept first");
        tokio::time::sleep(Duration::from_millis(3)).await;
        store
            .accept_inbox("billing", "evt-2", b"{}")
            .await
            .expect("accept second");
        store
            .accept_inbox("shipping", "evt-1", b"{}")
            .await
            .expect("accept other source");

        let claimed = store
            .claim_inbox(&owner, 30, 10, Utc::now())
            .await
            .expect("claim");
        let keys: Vec<_> = claimed
            .iter()
            .map(|r| (r.source.clone(), r.message_key.clone()))
            .collect();
        // Only the head of `billing` plus the independent source.
        assert_eq!(claimed.len(), 2);
        assert!(keys.contains(&("billing".to_string(), "evt-1".to_string())));
        assert!(keys.contains(&("shipping".to_string(), "evt-1".to_string())));

        // evt-2 stays hidden until evt-1 settles.
        let hidden = store
            .claim_inbox(&owner, 30, 10, Utc::now())
            .await
            .expect("claim while head leased");
        assert_eq!(hidden.len(), 0);

        let billing_head: Vec<_> = claimed
            .iter()
            .filter(|r| r.source == "billing")
            .map(|r| r.id)
            .collect();
        store
            .ack_inbox(&owner, &billing_head, Utc::now())
            .await
            .expect("ack head");

        let next = store
            .claim_inbox(&owner, 30, 10, Utc::now())
            .await
            .expect("claim successor");
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].message_key, "evt-2");

        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    #[tokio::test]
    async fn abandoned_record_blocks_its_source_until_reclaimed() {
        let (store, dir) = open_test_store().await;
        let owner = OwnerToken::generate();

        store
            .accept_inbox("billing", "evt-1", b"{}")
            .await
            .expect("accept first");
        tokio::time::sleep(Duration::from_millis(3)).await;
        store
            .accept_inbox("billing", "evt-2", b"{}")
            .await
            .expect("accept second");

        let claimed = store
            .claim_inbox(&owner, 30, 10, Utc::now())
            .await
            .expect("claim head");
        let ids: Vec<_> = claimed.iter().map(|r| r.id).collect();
        store
            .abandon_inbox(&owner, &ids, Some("flaky handler"), Utc::now())
            .await
            .expect("abandon");

        // The head returns to pending, so it is claimed again before evt-2.
        let retried = store
            .claim_inbox(&owner, 30, 10, Utc::now())
            .await
            .expect("claim retry");
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].message_key, "evt-1");
        assert_eq!(retried[0].retry_count, 1);

        let _ = tokio::fs::remove_dir_all(dir).await;
    }
}
