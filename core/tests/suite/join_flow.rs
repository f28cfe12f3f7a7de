use crate::common::fast_config;
use crate::common::single_store_router;
use crate::common::wait_until;
use conveyor_core::Dispatcher;
use conveyor_core::HandlerOutcome;
use conveyor_core::HandlerRegistry;
use conveyor_core::JOIN_WAIT_TOPIC;
use conveyor_core::JoinContinuation;
use conveyor_core::JoinWaitHandler;
use conveyor_core::JoinWaitRequest;
use conveyor_core::start_join_wait;
use conveyor_state::EnqueueOutbox;
use conveyor_state::JoinStatus;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

#[tokio::test]
async fn a_mixed_join_fails_the_barrier_and_fires_the_failure_continuation() {
    let dir = tempfile::tempdir().expect("temp dir");
    let router = single_store_router(dir.path()).await;
    let store = router.single_store().expect("single store");

    // Three member messages: two succeed, one fails permanently.
    let join_id = store
        .start_join("tenant-a", 3, None)
        .await
        .expect("start join");
    for n in 0..3 {
        let outcome = store
            .enqueue(&EnqueueOutbox::new("steps", format!("{{\"n\":{n}}}")))
            .await
            .expect("enqueue member");
        store
            .attach_join_message(join_id, outcome.message_id())
            .await
            .expect("attach member");
    }

    let continuations: Arc<Mutex<Vec<JoinContinuation>>> = Arc::new(Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    registry.register_fn("steps", |_ctx, payload| async move {
        if payload == b"{\"n\":2}" {
            HandlerOutcome::Permanent("charge declined".to_string())
        } else {
            HandlerOutcome::Success(None)
        }
    });
    registry.register(
        JOIN_WAIT_TOPIC,
        Arc::new(JoinWaitHandler::new(Arc::clone(&router))),
    );
    let seen = Arc::clone(&continuations);
    registry.register_json::<JoinContinuation, _, _>(
        "steps.failed",
        move |_ctx, continuation| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().expect("lock").push(continuation);
                HandlerOutcome::Success(None)
            }
        },
    );
    registry.register_fn("steps.done", |_ctx, _payload| async move {
        HandlerOutcome::Success(None)
    });

    start_join_wait(
        &store,
        &JoinWaitRequest {
            join_id: join_id.to_string(),
            success_topic: "steps.done".to_string(),
            failure_topic: "steps.failed".to_string(),
            poll_delay_ms: 100,
            continuation: serde_json::json!({"order": 42}),
        },
    )
    .await
    .expect("start join wait");

    let handle = Dispatcher::new(Arc::clone(&router), Arc::new(registry), fast_config()).spawn();

    let settled = wait_until(Duration::from_secs(15), || {
        let continuations = Arc::clone(&continuations);
        async move { !continuations.lock().expect("lock").is_empty() }
    })
    .await;
    handle.shutdown().await;
    assert!(settled, "failure continuation never arrived");

    let join = store
        .get_join(join_id)
        .await
        .expect("get join")
        .expect("join exists");
    assert_eq!(join.status, JoinStatus::Failed);
    assert_eq!(join.completed_steps, 2);
    assert_eq!(join.failed_steps, 1);

    let continuations = continuations.lock().expect("lock");
    assert_eq!(continuations.len(), 1);
    assert!(!continuations[0].satisfied);
    assert_eq!(continuations[0].expected_steps, 3);
    assert_eq!(continuations[0].continuation, serde_json::json!({"order": 42}));
}

#[tokio::test]
async fn a_fully_acked_join_fires_the_success_continuation() {
    let dir = tempfile::tempdir().expect("temp dir");
    let router = single_store_router(dir.path()).await;
    let store = router.single_store().expect("single store");

    let join_id = store
        .start_join("tenant-a", 2, None)
        .await
        .expect("start join");
    for n in 0..2 {
        let outcome = store
            .enqueue(&EnqueueOutbox::new("steps", format!("{{\"n\":{n}}}")))
            .await
            .expect("enqueue member");
        store
            .attach_join_message(join_id, outcome.message_id())
            .await
            .expect("attach member");
    }

    let continuations: Arc<Mutex<Vec<JoinContinuation>>> = Arc::new(Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    registry.register_fn("steps", |_ctx, _payload| async move {
        HandlerOutcome::Success(None)
    });
    registry.register(
        JOIN_WAIT_TOPIC,
        Arc::new(JoinWaitHandler::new(Arc::clone(&router))),
    );
    let seen = Arc::clone(&continuations);
    registry.register_json::<JoinContinuation, _, _>("steps.done", move |_ctx, continuation| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().expect("lock").push(continuation);
            HandlerOutcome::Success(None)
        }
    });
    registry.register_fn("steps.failed", |_ctx, _payload| async move {
        HandlerOutcome::Success(None)
    });

    start_join_wait(
        &store,
        &JoinWaitRequest {
            join_id: join_id.to_string(),
            success_topic: "steps.done".to_string(),
            failure_topic: "steps.failed".to_string(),
            poll_delay_ms: 100,
            continuation: serde_json::Value::Null,
        },
    )
    .await
    .expect("start join wait");

    let handle = Dispatcher::new(Arc::clone(&router), Arc::new(registry), fast_config()).spawn();

    let settled = wait_until(Duration::from_secs(15), || {
        let continuations = Arc::clone(&continuations);
        async move { !continuations.lock().expect("lock").is_empty() }
    })
    .await;
    handle.shutdown().await;
    assert!(settled, "success continuation never arrived");

    let join = store
        .get_join(join_id)
        .await
        .expect("get join")
        .expect("join exists");
    assert_eq!(join.status, JoinStatus::Satisfied);

    let continuations = continuations.lock().expect("lock");
    assert_eq!(continuations.len(), 1);
    assert!(continuations[0].satisfied);
    assert_eq!(continuations[0].completed_steps, 2);
}
