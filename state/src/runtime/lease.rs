use crate::model::LeaseGrant;
use crate::model::LeaseRow;
use crate::model::datetime_to_epoch_millis;
use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use conveyor_protocol::OwnerToken;

use super::StoreRuntime;

impl StoreRuntime {
    /// Atomically take the named lease when it is unowned, expired, or
    /// already held by this owner. The returned grant's `fencing_token` is
    /// the row version, which increases on every grant and renew.
    pub async fn acquire_lease(
        &self,
        name: &str,
        owner: &OwnerToken,
        ttl: std::time::Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<LeaseGrant>> {
        let now_ms = datetime_to_epoch_millis(now);
        let until_ms = now_ms + i64::try_from(ttl.as_millis())?;
        let sql = format!(
            r#"
INSERT INTO {leases} (name, owner, lease_until, last_granted, version)
VALUES (?, ?, ?, ?, 1)
ON CONFLICT (name) DO UPDATE SET
    owner = excluded.owner,
    lease_until = excluded.lease_until,
    last_granted = excluded.last_granted,
    version = {leases}.version + 1
WHERE {leases}.owner IS NULL
   OR {leases}.owner = excluded.owner
   OR {leases}.lease_until IS NULL
   OR {leases}.lease_until <= ?
RETURNING version, lease_until
            "#,
            leases = self.tables().leases()
        );
        let row = sqlx::query(&sql)
            .bind(name)
            .bind(owner.as_str())
            .bind(until_ms)
            .bind(now_ms)
            .bind(now_ms)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref()
            .map(crate::model::grant_from_row)
            .transpose()
    }

    /// Extend a held lease. Returns `None` when the caller no longer owns
    /// the row or it already expired; the caller must treat that as loss.
    pub async fn renew_lease(
        &self,
        name: &str,
        owner: &OwnerToken,
        ttl: std::time::Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<LeaseGrant>> {
        let now_ms = datetime_to_epoch_millis(now);
        let until_ms = now_ms + i64::try_from(ttl.as_millis())?;
        let sql = format!(
            r#"
UPDATE {leases}
SET lease_until = ?, last_granted = ?, version = version + 1
WHERE name = ? AND owner = ? AND lease_until > ?
RETURNING version, lease_until
            "#,
            leases = self.tables().leases()
        );
        let row = sqlx::query(&sql)
            .bind(until_ms)
            .bind(now_ms)
            .bind(name)
            .bind(owner.as_str())
            .bind(now_ms)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref()
            .map(crate::model::grant_from_row)
            .transpose()
    }

    /// Give the lease up early. The row (and its version) stays behind so
    /// the fencing token keeps increasing across grants.
    pub async fn release_lease(&self, name: &str, owner: &OwnerToken) -> Result<bool> {
        let sql = format!(
            "UPDATE {leases} SET owner = NULL, lease_until = NULL WHERE name = ? AND owner = ?",
            leases = self.tables().leases()
        );
        let affected = sqlx::query(&sql)
            .bind(name)
            .bind(owner.as_str())
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(affected == 1)
    }

    pub async fn get_lease(&self, name: &str) -> Result<Option<LeaseRow>> {
        let sql = format!(
            "SELECT name, owner, lease_until, last_granted, version FROM {leases} WHERE name = ?",
            leases = self.tables().leases()
        );
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(LeaseRow::try_from_row).transpose()
    }
}
