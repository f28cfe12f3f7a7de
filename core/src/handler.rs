use async_trait::async_trait;
use conveyor_protocol::MessageId;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a handler reports back for one message.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    /// Side effect landed; the optional bytes are recorded as the
    /// idempotent outcome for duplicate suppression.
    Success(Option<Vec<u8>>),
    /// Retry later with backoff.
    Transient(String),
    /// Do not retry; the row moves to its terminal failed state.
    Permanent(String),
}

/// Per-invocation context handed to a handler.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub store_key: String,
    pub message_id: MessageId,
    pub topic: String,
    pub correlation_id: Option<String>,
    /// Zero-based count of earlier attempts for this row.
    pub attempt: i64,
    /// Cancelled when the dispatcher shuts down; handlers must finish or
    /// voluntarily abandon when this fires.
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext, payload: Vec<u8>) -> HandlerOutcome;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(HandlerContext, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerOutcome> + Send,
{
    async fn handle(&self, ctx: HandlerContext, payload: Vec<u8>) -> HandlerOutcome {
        (self.f)(ctx, payload).await
    }
}

/// Topic-indexed handler table owned by the dispatcher.
///
/// Handlers are plain values registered by topic; the outbox never calls
/// back into handler code directly.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, topic: impl Into<String>, handler: Arc<dyn Handler>) -> &mut Self {
        self.handlers.insert(topic.into(), handler);
        self
    }

    pub fn register_fn<F, Fut>(&mut self, topic: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(HandlerContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        self.register(topic, Arc::new(FnHandler { f }))
    }

    /// Typed registration: the payload is parsed as JSON before the handler
    /// runs. A payload that does not parse is a permanent failure.
    pub fn register_json<T, F, Fut>(&mut self, topic: impl Into<String>, f: F) -> &mut Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(HandlerContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register_fn(topic, move |ctx, payload| {
            let f = Arc::clone(&f);
            async move {
                match serde_json::from_slice::<T>(&payload) {
                    Ok(value) => f(ctx, value).await,
                    Err(err) => HandlerOutcome::Permanent(format!("payload did not parse: {err}")),
                }
            }
        })
    }

    pub fn get(&self, topic: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(topic).cloned()
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
