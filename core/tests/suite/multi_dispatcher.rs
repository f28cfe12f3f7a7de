use crate::common::fast_config;
use crate::common::single_store_router;
use crate::common::wait_until;
use conveyor_core::Dispatcher;
use conveyor_core::HandlerOutcome;
use conveyor_core::HandlerRegistry;
use conveyor_state::EnqueueOutbox;
use conveyor_state::OutboxStatus;
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

const MESSAGES: usize = 100;

fn counting_registry(seen: &Arc<Mutex<HashMap<String, usize>>>) -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    let seen = Arc::clone(seen);
    registry.register_fn("orders", move |ctx, _payload| {
        let seen = Arc::clone(&seen);
        async move {
            *seen
                .lock()
                .expect("lock")
                .entry(ctx.message_id.to_string())
                .or_default() += 1;
            HandlerOutcome::Success(None)
        }
    });
    Arc::new(registry)
}

#[tokio::test]
async fn concurrent_dispatchers_process_every_row_exactly_once() {
    let dir = tempfile::tempdir().expect("temp dir");
    let router = single_store_router(dir.path()).await;
    let store = router.single_store().expect("single store");

    for n in 0..MESSAGES {
        store
            .enqueue(&EnqueueOutbox::new("orders", format!("{{\"n\":{n}}}")))
            .await
            .expect("enqueue");
    }

    let seen: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let first = Dispatcher::new(
        Arc::clone(&router),
        counting_registry(&seen),
        fast_config(),
    )
    .spawn();
    let second = Dispatcher::new(
        Arc::clone(&router),
        counting_registry(&seen),
        fast_config(),
    )
    .spawn();

    let drained = wait_until(Duration::from_secs(60), || {
        let store = store.clone();
        async move {
            store
                .count_outbox_with_status(OutboxStatus::Dispatched)
                .await
                .expect("count dispatched")
                == MESSAGES as i64
        }
    })
    .await;
    first.shutdown().await;
    second.shutdown().await;
    assert!(drained, "not all rows reached dispatched");

    let seen = seen.lock().expect("lock");
    assert_eq!(seen.len(), MESSAGES, "some rows were never handled");
    let double_handled: Vec<_> = seen.iter().filter(|(_, count)| **count > 1).collect();
    assert_eq!(
        double_handled,
        Vec::<(&String, &usize)>::new(),
        "rows were handled more than once"
    );
    assert_eq!(
        store
            .count_outbox_with_status(OutboxStatus::Pending)
            .await
            .expect("count pending"),
        0
    );
}
