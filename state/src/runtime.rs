use crate::schema;
use crate::tables::TableNames;
use conveyor_otel::MetricsClient;
use conveyor_otel::Timer;
use sqlx::Sqlite;
use sqlx::SqlitePool;
use sqlx::Transaction;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::sqlite::SqliteSynchronous;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

mod idempotency;
mod inbox;
mod jobs;
mod join;
mod lease;
mod outbox;
mod scheduler_state;
#[cfg(test)]
mod test_support;
mod timers;

pub use jobs::ClaimedRun;

/// Row-level storage for one store (one SQLite database).
///
/// Cheap to clone; the pool is shared.
#[derive(Clone)]
pub struct StoreRuntime {
    pool: SqlitePool,
    tables: Arc<TableNames>,
    metrics: Option<MetricsClient>,
}

impl StoreRuntime {
    /// Open (and optionally deploy the schema of) the store at `path`.
    pub async fn open(
        path: &Path,
        tables: TableNames,
        deploy_schema: bool,
        metrics: Option<MetricsClient>,
    ) -> anyhow::Result<Self> {
        let pool = open_sqlite(path).await?;
        if deploy_schema {
            schema::deploy(&pool, &tables).await?;
        }
        Ok(Self {
            pool,
            tables: Arc::new(tables),
            metrics,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    /// Start a transaction for callers that combine an enqueue with their
    /// own domain writes.
    pub async fn begin(&self) -> anyhow::Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub(crate) fn emit_count(&self, name: &str, value: i64, tags: &[(&str, &str)]) {
        if let Some(metrics) = &self.metrics
            && let Err(err) = metrics.counter(name, value, tags)
        {
            warn!("failed to record metric {name}: {err}");
        }
    }

    pub(crate) fn emit_histogram(&self, name: &str, value: i64, tags: &[(&str, &str)]) {
        if let Some(metrics) = &self.metrics
            && let Err(err) = metrics.histogram(name, value, tags)
        {
            warn!("failed to record metric {name}: {err}");
        }
    }

    pub(crate) fn start_timer(&self, name: &str, tags: &[(&str, &str)]) -> Option<Timer> {
        let metrics = self.metrics.as_ref()?;
        match metrics.start_timer(name, tags) {
            Ok(timer) => Some(timer),
            Err(err) => {
                warn!("failed to start metric timer {name}: {err}");
                None
            }
        }
    }
}

async fn open_sqlite(path: &Path) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}
