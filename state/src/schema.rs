use crate::tables::TableNames;
use sqlx::SqlitePool;

/// Apply the idempotent DDL for one store.
///
/// Every statement is `IF NOT EXISTS`, so repeated deployment (and multiple
/// dispatchers racing at startup) is safe.
pub(crate) async fn deploy(pool: &SqlitePool, tables: &TableNames) -> anyhow::Result<()> {
    for sql in statements(tables) {
        sqlx::query(&sql).execute(pool).await?;
    }
    Ok(())
}

fn statements(t: &TableNames) -> Vec<String> {
    vec![
        format!(
            r#"
CREATE TABLE IF NOT EXISTS {outbox} (
    id TEXT PRIMARY KEY,
    topic TEXT NOT NULL,
    payload BLOB NOT NULL,
    correlation_id TEXT,
    message_key TEXT UNIQUE,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    due_time INTEGER,
    locked_until INTEGER,
    owner_token TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    processed_at INTEGER,
    processed_by TEXT
)
            "#,
            outbox = t.outbox()
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{outbox}_dispatch ON {outbox} (status, due_time, created_at)",
            outbox = t.outbox()
        ),
        format!(
            r#"
CREATE TABLE IF NOT EXISTS {inbox} (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    message_key TEXT NOT NULL,
    payload BLOB NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    locked_until INTEGER,
    owner_token TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    processed_at INTEGER,
    UNIQUE (source, message_key)
)
            "#,
            inbox = t.inbox()
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{inbox}_dispatch ON {inbox} (status, created_at)",
            inbox = t.inbox()
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{inbox}_source ON {inbox} (source, status)",
            inbox = t.inbox()
        ),
        format!(
            r#"
CREATE TABLE IF NOT EXISTS {timers} (
    id TEXT PRIMARY KEY,
    topic TEXT NOT NULL,
    payload BLOB NOT NULL,
    due_time INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    locked_until INTEGER,
    owner_token TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    processed_at INTEGER
)
            "#,
            timers = t.timers()
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{timers}_due ON {timers} (status, due_time)",
            timers = t.timers()
        ),
        format!(
            r#"
CREATE TABLE IF NOT EXISTS {jobs} (
    id TEXT PRIMARY KEY,
    job_name TEXT NOT NULL UNIQUE,
    topic TEXT NOT NULL,
    cron_schedule TEXT NOT NULL,
    payload BLOB,
    is_enabled INTEGER NOT NULL DEFAULT 1,
    next_due_time INTEGER NOT NULL,
    last_run_time INTEGER,
    last_run_status TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
            "#,
            jobs = t.jobs()
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{jobs}_due ON {jobs} (is_enabled, next_due_time)",
            jobs = t.jobs()
        ),
        format!(
            r#"
CREATE TABLE IF NOT EXISTS {job_runs} (
    id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    scheduled_time INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    locked_until INTEGER,
    owner_token TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    start_time INTEGER,
    end_time INTEGER,
    output TEXT,
    last_error TEXT
)
            "#,
            job_runs = t.job_runs()
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{job_runs}_due ON {job_runs} (status, scheduled_time)",
            job_runs = t.job_runs()
        ),
        format!(
            r#"
CREATE TABLE IF NOT EXISTS {scheduler_state} (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    current_fencing_token INTEGER NOT NULL,
    last_run_at INTEGER NOT NULL
)
            "#,
            scheduler_state = t.scheduler_state()
        ),
        format!(
            r#"
CREATE TABLE IF NOT EXISTS {leases} (
    name TEXT PRIMARY KEY,
    owner TEXT,
    lease_until INTEGER,
    last_granted INTEGER,
    version INTEGER NOT NULL DEFAULT 0
)
            "#,
            leases = t.leases()
        ),
        format!(
            r#"
CREATE TABLE IF NOT EXISTS {idempotency} (
    key TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    owner TEXT,
    locked_until INTEGER,
    outcome BLOB,
    error_code TEXT,
    error_message TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
            "#,
            idempotency = t.idempotency()
        ),
        format!(
            r#"
CREATE TABLE IF NOT EXISTS {joins} (
    join_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    expected_steps INTEGER NOT NULL,
    completed_steps INTEGER NOT NULL DEFAULT 0,
    failed_steps INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    last_updated_at INTEGER NOT NULL,
    metadata TEXT
)
            "#,
            joins = t.joins()
        ),
        format!(
            r#"
CREATE TABLE IF NOT EXISTS {join_members} (
    join_id TEXT NOT NULL,
    outbox_message_id TEXT NOT NULL,
    completed_at INTEGER,
    failed_at INTEGER,
    PRIMARY KEY (join_id, outbox_message_id)
)
            "#,
            join_members = t.join_members()
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{join_members}_message ON {join_members} (outbox_message_id)",
            join_members = t.join_members()
        ),
    ]
}
