use anyhow::bail;

/// Fully resolved table names for one store.
///
/// The prefix stands in for a schema name: the stores are SQLite databases,
/// which have no schema objects, so namespacing happens in the table name.
/// The prefix is validated before it is ever rendered into SQL.
#[derive(Debug, Clone)]
pub struct TableNames {
    outbox: String,
    inbox: String,
    timers: String,
    jobs: String,
    job_runs: String,
    scheduler_state: String,
    leases: String,
    idempotency: String,
    joins: String,
    join_members: String,
}

pub const DEFAULT_TABLE_PREFIX: &str = "infra";

fn is_valid_prefix(prefix: &str) -> bool {
    !prefix.is_empty()
        && prefix.len() <= 32
        && prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && prefix
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
}

impl TableNames {
    pub fn new(prefix: &str) -> anyhow::Result<Self> {
        if !is_valid_prefix(prefix) {
            bail!("invalid table prefix: {prefix:?}");
        }
        Ok(Self {
            outbox: format!("{prefix}_outbox"),
            inbox: format!("{prefix}_inbox"),
            timers: format!("{prefix}_timers"),
            jobs: format!("{prefix}_jobs"),
            job_runs: format!("{prefix}_job_runs"),
            scheduler_state: format!("{prefix}_scheduler_state"),
            leases: format!("{prefix}_leases"),
            idempotency: format!("{prefix}_idempotency"),
            joins: format!("{prefix}_joins"),
            join_members: format!("{prefix}_join_members"),
        })
    }

    pub fn outbox(&self) -> &str {
        &self.outbox
    }

    pub fn inbox(&self) -> &str {
        &self.inbox
    }

    pub fn timers(&self) -> &str {
        &self.timers
    }

    pub fn jobs(&self) -> &str {
        &self.jobs
    }

    pub fn job_runs(&self) -> &str {
        &self.job_runs
    }

    pub fn scheduler_state(&self) -> &str {
        &self.scheduler_state
    }

    pub fn leases(&self) -> &str {
        &self.leases
    }

    pub fn idempotency(&self) -> &str {
        &self.idempotency
    }

    pub fn joins(&self) -> &str {
        &self.joins
    }

    pub fn join_members(&self) -> &str {
        &self.join_members
    }
}

impl Default for TableNames {
    fn default() -> Self {
        #[allow(clippy::expect_used)]
        Self::new(DEFAULT_TABLE_PREFIX).expect("default prefix is valid")
    }
}
