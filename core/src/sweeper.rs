use chrono::DateTime;
use chrono::Utc;
use conveyor_state::StoreRuntime;
use std::time::Duration;
use tracing::debug;

/// One retention/reap pass over a store: expired leases back to pending,
/// terminal rows past retention deleted.
pub(crate) async fn run_sweep_pass(
    store: &StoreRuntime,
    retention: Duration,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let reaped_outbox = store.reap_expired_outbox(now).await?;
    let reaped_inbox = store.reap_expired_inbox(now).await?;
    let reaped_timers = store.reap_expired_timers(now).await?;
    let reaped_runs = store.reap_expired_runs(now).await?;

    let swept_outbox = store.sweep_dispatched_outbox(retention, now).await?;
    let swept_inbox = store.sweep_processed_inbox(retention, now).await?;
    let swept_idempotency = store.sweep_idempotency(retention, now).await?;
    let swept_joins = store.sweep_settled_joins(retention, now).await?;

    debug!(
        reaped_outbox,
        reaped_inbox,
        reaped_timers,
        reaped_runs,
        swept_outbox,
        swept_inbox,
        swept_idempotency,
        swept_joins,
        "sweep pass complete"
    );
    Ok(())
}
