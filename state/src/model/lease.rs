use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::epoch_millis_to_datetime;
use super::opt_epoch_millis_to_datetime;

/// What a successful acquire or renew hands back.
///
/// `fencing_token` is the lease row's version: it increases on every grant
/// and renew, so a writer holding a smaller token than the store has seen is
/// stale by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub fencing_token: i64,
    pub lease_until: DateTime<Utc>,
}

/// Full lease row, mostly useful for diagnostics and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseRow {
    pub name: String,
    pub owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub last_granted: Option<DateTime<Utc>>,
    pub version: i64,
}

impl LeaseRow {
    pub(crate) fn try_from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            name: row.try_get("name")?,
            owner: row.try_get("owner")?,
            lease_until: opt_epoch_millis_to_datetime(row.try_get("lease_until")?)?,
            last_granted: opt_epoch_millis_to_datetime(row.try_get("last_granted")?)?,
            version: row.try_get("version")?,
        })
    }

    pub fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        match (&self.owner, self.lease_until) {
            (Some(_), Some(until)) => until > now,
            _ => false,
        }
    }
}

pub(crate) fn grant_from_row(row: &SqliteRow) -> Result<LeaseGrant> {
    Ok(LeaseGrant {
        fencing_token: row.try_get("version")?,
        lease_until: epoch_millis_to_datetime(row.try_get("lease_until")?)?,
    })
}
