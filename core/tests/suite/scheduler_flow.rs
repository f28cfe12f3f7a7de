use crate::common::fast_config;
use crate::common::single_store_router;
use crate::common::wait_until;
use chrono::Duration as ChronoDuration;
use chrono::Utc;
use conveyor_core::Dispatcher;
use conveyor_core::HandlerOutcome;
use conveyor_core::HandlerRegistry;
use conveyor_state::RunStatus;
use conveyor_state::TimerStatus;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn a_due_timer_materializes_and_its_message_is_handled() {
    let dir = tempfile::tempdir().expect("temp dir");
    let router = single_store_router(dir.path()).await;
    let store = router.single_store().expect("single store");

    let invocations = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    let counter = Arc::clone(&invocations);
    registry.register_fn("reminders", move |_ctx, _payload| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::Success(None)
        }
    });

    let timer_id = store
        .schedule_timer("reminders", b"{}", Utc::now() - ChronoDuration::seconds(1))
        .await
        .expect("schedule timer");

    let handle = Dispatcher::new(Arc::clone(&router), Arc::new(registry), fast_config()).spawn();

    let handled = wait_until(Duration::from_secs(10), || {
        let invocations = Arc::clone(&invocations);
        async move { invocations.load(Ordering::SeqCst) == 1 }
    })
    .await;
    handle.shutdown().await;
    assert!(handled, "timer message never reached its handler");

    let timer = store
        .get_timer(timer_id)
        .await
        .expect("get timer")
        .expect("timer exists");
    assert_eq!(timer.status, TimerStatus::Processed);
}

#[tokio::test]
async fn a_cancelled_timer_never_fires() {
    let dir = tempfile::tempdir().expect("temp dir");
    let router = single_store_router(dir.path()).await;
    let store = router.single_store().expect("single store");

    let timer_id = store
        .schedule_timer("reminders", b"{}", Utc::now() + ChronoDuration::milliseconds(300))
        .await
        .expect("schedule timer");
    assert!(store.cancel_timer(timer_id).await.expect("cancel"));

    let handle = Dispatcher::new(
        Arc::clone(&router),
        Arc::new(HandlerRegistry::new()),
        fast_config(),
    )
    .spawn();
    tokio::time::sleep(Duration::from_millis(800)).await;
    handle.shutdown().await;

    let timer = store
        .get_timer(timer_id)
        .await
        .expect("get timer")
        .expect("timer exists");
    assert_eq!(timer.status, TimerStatus::Cancelled);
    assert_eq!(
        store
            .count_outbox_with_status(conveyor_state::OutboxStatus::Pending)
            .await
            .expect("count"),
        0
    );
}

#[tokio::test]
async fn an_overdue_job_materializes_exactly_one_run_on_resume() {
    let dir = tempfile::tempdir().expect("temp dir");
    let router = single_store_router(dir.path()).await;
    let store = router.single_store().expect("single store");

    let invocations = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    let counter = Arc::clone(&invocations);
    registry.register_fn("reports", move |_ctx, _payload| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::Success(None)
        }
    });

    // Fell due a while ago, as if the scheduler had been paused.
    let before = Utc::now();
    let job_id = store
        .upsert_job(
            "ledger-sync",
            "reports",
            "30 3 * * *",
            Some(b"{}"),
            before - ChronoDuration::hours(6),
        )
        .await
        .expect("upsert job");

    let handle = Dispatcher::new(Arc::clone(&router), Arc::new(registry), fast_config()).spawn();

    let handled = wait_until(Duration::from_secs(10), || {
        let invocations = Arc::clone(&invocations);
        async move { invocations.load(Ordering::SeqCst) >= 1 }
    })
    .await;
    // Give a second scheduler pass the chance to (incorrectly) double-fire.
    tokio::time::sleep(Duration::from_millis(600)).await;
    handle.shutdown().await;
    assert!(handled, "job run never reached its handler");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let runs = store.list_job_runs(job_id).await.expect("list runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Processed);

    let job = store
        .get_job("ledger-sync")
        .await
        .expect("get job")
        .expect("job exists");
    assert!(job.next_due_time > before);
    assert!(job.last_run_time.is_some());
}
