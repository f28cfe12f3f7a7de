use crate::common::fast_config;
use crate::common::single_store_router;
use crate::common::wait_until;
use async_trait::async_trait;
use conveyor_core::Dispatcher;
use conveyor_core::EffectProbe;
use conveyor_core::HandlerOutcome;
use conveyor_core::HandlerRegistry;
use conveyor_protocol::OwnerToken;
use conveyor_state::EnqueueOutbox;
use conveyor_state::OutboxStatus;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn an_enqueued_message_is_handled_exactly_once_and_dispatched() {
    let dir = tempfile::tempdir().expect("temp dir");
    let router = single_store_router(dir.path()).await;
    let store = router.single_store().expect("single store");

    let invocations = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    let counter = Arc::clone(&invocations);
    registry.register_fn("orders", move |_ctx, _payload| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::Success(None)
        }
    });

    let outcome = store
        .enqueue(&EnqueueOutbox::new("orders", "{}"))
        .await
        .expect("enqueue");
    let message_id = outcome.message_id();

    let handle = Dispatcher::new(Arc::clone(&router), Arc::new(registry), fast_config()).spawn();

    let dispatched = wait_until(Duration::from_secs(10), || {
        let store = store.clone();
        async move {
            store
                .get_outbox_message(message_id)
                .await
                .expect("get message")
                .is_some_and(|m| m.status == OutboxStatus::Dispatched)
        }
    })
    .await;
    handle.shutdown().await;
    assert!(dispatched, "message never reached dispatched");

    let message = store
        .get_outbox_message(message_id)
        .await
        .expect("get message")
        .expect("message exists");
    assert!(message.processed_at.is_some());
    assert_eq!(message.retry_count, 0);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transient_failures_back_off_and_eventually_dispatch() {
    let dir = tempfile::tempdir().expect("temp dir");
    let router = single_store_router(dir.path()).await;
    let store = router.single_store().expect("single store");

    // Fails three times, succeeds on the fourth attempt.
    let invocations = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    let counter = Arc::clone(&invocations);
    registry.register_fn("orders", move |_ctx, _payload| {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                HandlerOutcome::Transient("upstream 503".to_string())
            } else {
                HandlerOutcome::Success(None)
            }
        }
    });

    let outcome = store
        .enqueue(&EnqueueOutbox::new("orders", "{}"))
        .await
        .expect("enqueue");
    let message_id = outcome.message_id();

    let handle = Dispatcher::new(Arc::clone(&router), Arc::new(registry), fast_config()).spawn();

    let dispatched = wait_until(Duration::from_secs(15), || {
        let store = store.clone();
        async move {
            store
                .get_outbox_message(message_id)
                .await
                .expect("get message")
                .is_some_and(|m| m.status == OutboxStatus::Dispatched)
        }
    })
    .await;
    handle.shutdown().await;
    assert!(dispatched, "message never recovered from transient failures");

    let message = store
        .get_outbox_message(message_id)
        .await
        .expect("get message")
        .expect("message exists");
    assert_eq!(message.retry_count, 3);
    assert_eq!(invocations.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn a_permanent_failure_is_terminal_on_the_first_attempt() {
    let dir = tempfile::tempdir().expect("temp dir");
    let router = single_store_router(dir.path()).await;
    let store = router.single_store().expect("single store");

    let invocations = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    let counter = Arc::clone(&invocations);
    registry.register_fn("orders", move |_ctx, _payload| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::Permanent("schema mismatch".to_string())
        }
    });

    let outcome = store
        .enqueue(&EnqueueOutbox::new("orders", "{}"))
        .await
        .expect("enqueue");
    let message_id = outcome.message_id();

    let handle = Dispatcher::new(Arc::clone(&router), Arc::new(registry), fast_config()).spawn();

    let failed = wait_until(Duration::from_secs(10), || {
        let store = store.clone();
        async move {
            store
                .get_outbox_message(message_id)
                .await
                .expect("get message")
                .is_some_and(|m| m.status == OutboxStatus::Failed)
        }
    })
    .await;
    handle.shutdown().await;
    assert!(failed, "message never reached failed");

    let message = store
        .get_outbox_message(message_id)
        .await
        .expect("get message")
        .expect("message exists");
    assert_eq!(message.retry_count, 0);
    assert!(
        message
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("schema mismatch"))
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

struct ConfirmingProbe;

#[async_trait]
impl EffectProbe for ConfirmingProbe {
    async fn confirm(&self, _key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(Some(b"already landed".to_vec()))
    }
}

#[tokio::test]
async fn a_probe_settles_an_interrupted_attempt_without_replaying_the_handler() {
    let dir = tempfile::tempdir().expect("temp dir");
    let router = single_store_router(dir.path()).await;
    let store = router.single_store().expect("single store");

    // An earlier dispatcher took the execution lock for this key, ran its
    // side effect, and died before settling; the lock has expired.
    let crashed = OwnerToken::generate();
    store
        .begin_idempotent(
            "charge-9",
            &crashed,
            Duration::from_millis(0),
            chrono::Utc::now(),
        )
        .await
        .expect("crashed begin");
    tokio::time::sleep(Duration::from_millis(5)).await;

    let outcome = store
        .enqueue(&EnqueueOutbox::new("orders", "{}").with_message_key("charge-9"))
        .await
        .expect("enqueue");
    let message_id = outcome.message_id();

    let invocations = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    let counter = Arc::clone(&invocations);
    registry.register_fn("orders", move |_ctx, _payload| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::Success(None)
        }
    });

    let mut config = fast_config();
    config.allow_probe = true;
    let handle = Dispatcher::new(Arc::clone(&router), Arc::new(registry), config)
        .with_effect_probe(Arc::new(ConfirmingProbe))
        .spawn();

    let dispatched = wait_until(Duration::from_secs(10), || {
        let store = store.clone();
        async move {
            store
                .get_outbox_message(message_id)
                .await
                .expect("get message")
                .is_some_and(|m| m.status == OutboxStatus::Dispatched)
        }
    })
    .await;
    handle.shutdown().await;
    assert!(dispatched, "probed message never reached dispatched");

    // The probe confirmed the landed effect; the handler was never rerun.
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    let entry = store
        .get_idempotency_entry("charge-9")
        .await
        .expect("get entry")
        .expect("entry exists");
    assert_eq!(entry.outcome.as_deref(), Some(b"already landed".as_slice()));
}

#[tokio::test]
async fn a_topic_without_a_handler_fails_permanently() {
    let dir = tempfile::tempdir().expect("temp dir");
    let router = single_store_router(dir.path()).await;
    let store = router.single_store().expect("single store");

    let outcome = store
        .enqueue(&EnqueueOutbox::new("nobody-home", "{}"))
        .await
        .expect("enqueue");
    let message_id = outcome.message_id();

    let handle = Dispatcher::new(
        Arc::clone(&router),
        Arc::new(HandlerRegistry::new()),
        fast_config(),
    )
    .spawn();

    let failed = wait_until(Duration::from_secs(10), || {
        let store = store.clone();
        async move {
            store
                .get_outbox_message(message_id)
                .await
                .expect("get message")
                .is_some_and(|m| m.status == OutboxStatus::Failed)
        }
    })
    .await;
    handle.shutdown().await;
    assert!(failed, "unroutable message never failed");
}

#[tokio::test]
async fn inbox_records_flow_through_their_source_handler() {
    let dir = tempfile::tempdir().expect("temp dir");
    let router = single_store_router(dir.path()).await;
    let store = router.single_store().expect("single store");

    let invocations = Arc::new(AtomicUsize::new(0));
    let mut inbox = HandlerRegistry::new();
    let counter = Arc::clone(&invocations);
    inbox.register_fn("billing", move |_ctx, _payload| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::Success(None)
        }
    });

    let accepted = store
        .accept_inbox("billing", "evt-1", b"{}")
        .await
        .expect("accept");
    let record_id = accepted.record_id();

    let handle = Dispatcher::new(
        Arc::clone(&router),
        Arc::new(HandlerRegistry::new()),
        fast_config(),
    )
    .with_inbox_handlers(Arc::new(inbox))
    .spawn();

    let processed = wait_until(Duration::from_secs(10), || {
        let store = store.clone();
        async move {
            store
                .get_inbox_record(record_id)
                .await
                .expect("get record")
                .is_some_and(|r| r.status == conveyor_state::InboxStatus::Processed)
        }
    })
    .await;
    handle.shutdown().await;
    assert!(processed, "inbox record never processed");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}
