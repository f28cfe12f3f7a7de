use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::events::DispatchEvent;
use crate::events::EventEmitter;
use crate::events::TracingEmitter;
use crate::handler::Handler;
use crate::handler::HandlerContext;
use crate::handler::HandlerOutcome;
use crate::router::Router;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use conveyor_protocol::JoinId;
use conveyor_protocol::MessageId;
use conveyor_state::EnqueueOutbox;
use conveyor_state::JoinRecord;
use conveyor_state::StoreRuntime;
use serde::Deserialize;
use serde::Serialize;
use std::sync::Arc;

/// Topic the join wait handler is registered under.
pub const JOIN_WAIT_TOPIC: &str = "join.wait";

fn default_poll_delay_ms() -> u64 {
    1_000
}

/// Payload of a `join.wait` message: which barrier to watch and where the
/// continuation goes once it settles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinWaitRequest {
    pub join_id: String,
    pub success_topic: String,
    pub failure_topic: String,
    #[serde(default = "default_poll_delay_ms")]
    pub poll_delay_ms: u64,
    /// Opaque caller data carried into the continuation message.
    #[serde(default)]
    pub continuation: serde_json::Value,
}

/// Continuation message body enqueued when a barrier settles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinContinuation {
    pub join_id: String,
    pub satisfied: bool,
    pub completed_steps: i64,
    pub failed_steps: i64,
    pub expected_steps: i64,
    #[serde(default)]
    pub continuation: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinVerdict {
    /// Not settled yet; keep polling.
    Wait,
    Satisfied,
    Failed,
}

/// Any failed member fails the barrier, without waiting for the rest.
pub fn default_join_policy(join: &JoinRecord) -> JoinVerdict {
    if join.failed_steps > 0 {
        return JoinVerdict::Failed;
    }
    if join.completed_steps >= join.expected_steps {
        return JoinVerdict::Satisfied;
    }
    JoinVerdict::Wait
}

/// Watches a join through the outbox itself: while the barrier is open the
/// handler re-enqueues its own message with a delay, and once the policy
/// settles it the continuation goes out on the caller's topic.
pub struct JoinWaitHandler {
    router: Arc<Router>,
    policy: Arc<dyn Fn(&JoinRecord) -> JoinVerdict + Send + Sync>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventEmitter>,
}

impl JoinWaitHandler {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            policy: Arc::new(default_join_policy),
            clock: Arc::new(SystemClock::new()),
            events: Arc::new(TracingEmitter),
        }
    }

    /// Override how mixed completion is judged.
    pub fn with_policy(
        mut self,
        policy: impl Fn(&JoinRecord) -> JoinVerdict + Send + Sync + 'static,
    ) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventEmitter>) -> Self {
        self.events = events;
        self
    }

    async fn settle(
        &self,
        store: &StoreRuntime,
        store_key: &str,
        join: &JoinRecord,
        request: &JoinWaitRequest,
        satisfied: bool,
    ) -> HandlerOutcome {
        let continuation = JoinContinuation {
            join_id: request.join_id.clone(),
            satisfied,
            completed_steps: join.completed_steps,
            failed_steps: join.failed_steps,
            expected_steps: join.expected_steps,
            continuation: request.continuation.clone(),
        };
        let payload = match serde_json::to_vec(&continuation) {
            Ok(payload) => payload,
            Err(err) => {
                return HandlerOutcome::Permanent(format!(
                    "continuation did not serialize: {err}"
                ));
            }
        };
        let topic = if satisfied {
            &request.success_topic
        } else {
            &request.failure_topic
        };
        match store
            .enqueue(
                &EnqueueOutbox::new(topic.clone(), payload)
                    .with_correlation_id(request.join_id.clone())
                    .with_message_key(format!("join-continuation:{}", request.join_id)),
            )
            .await
        {
            Ok(_) => {
                self.events.emit(DispatchEvent::JoinSettled {
                    store_key: store_key.to_string(),
                    join_id: join.join_id,
                    satisfied,
                });
                HandlerOutcome::Success(None)
            }
            Err(err) => HandlerOutcome::Transient(format!("continuation enqueue failed: {err}")),
        }
    }
}

#[async_trait]
impl Handler for JoinWaitHandler {
    async fn handle(&self, ctx: HandlerContext, payload: Vec<u8>) -> HandlerOutcome {
        let request: JoinWaitRequest = match serde_json::from_slice(&payload) {
            Ok(request) => request,
            Err(err) => {
                return HandlerOutcome::Permanent(format!("join wait payload did not parse: {err}"));
            }
        };
        let join_id: JoinId = match request.join_id.parse() {
            Ok(join_id) => join_id,
            Err(err) => return HandlerOutcome::Permanent(format!("invalid join id: {err}")),
        };

        let Some(store) = self.router.store(&ctx.store_key) else {
            // The snapshot may be mid-refresh; the row can be retried.
            return HandlerOutcome::Transient(format!("store {} not routable", ctx.store_key));
        };
        let join = match store.get_join(join_id).await {
            Ok(Some(join)) => join,
            Ok(None) => {
                return HandlerOutcome::Permanent(format!("join {join_id} does not exist"));
            }
            Err(err) => return HandlerOutcome::Transient(format!("join lookup failed: {err}")),
        };

        match (self.policy)(&join) {
            JoinVerdict::Satisfied => self.settle(&store, &ctx.store_key, &join, &request, true).await,
            JoinVerdict::Failed => self.settle(&store, &ctx.store_key, &join, &request, false).await,
            JoinVerdict::Wait => {
                let due = self.clock.now()
                    + ChronoDuration::milliseconds(request.poll_delay_ms.min(i64::MAX as u64) as i64);
                match store
                    .enqueue(
                        &EnqueueOutbox::new(JOIN_WAIT_TOPIC, payload)
                            .with_correlation_id(request.join_id.clone())
                            .with_due_time(due),
                    )
                    .await
                {
                    Ok(_) => HandlerOutcome::Success(None),
                    Err(err) => {
                        HandlerOutcome::Transient(format!("re-enqueue of join wait failed: {err}"))
                    }
                }
            }
        }
    }
}

/// Enqueue the first `join.wait` message for a barrier.
pub async fn start_join_wait(
    store: &StoreRuntime,
    request: &JoinWaitRequest,
) -> anyhow::Result<MessageId> {
    let payload = serde_json::to_vec(request)?;
    let outcome = store
        .enqueue(
            &EnqueueOutbox::new(JOIN_WAIT_TOPIC, payload)
                .with_correlation_id(request.join_id.clone()),
        )
        .await?;
    Ok(outcome.message_id())
}
