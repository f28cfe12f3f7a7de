use conveyor_protocol::JoinId;
use conveyor_protocol::MessageId;
use tracing::info;
use tracing::warn;

/// Lifecycle notifications surfaced to the host application.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    MessageDispatched {
        store_key: String,
        message_id: MessageId,
        topic: String,
    },
    MessageFailed {
        store_key: String,
        message_id: MessageId,
        topic: String,
        error: String,
    },
    /// A duplicate execution was suppressed by the idempotency layer.
    MessageSuppressed {
        store_key: String,
        message_id: MessageId,
        topic: String,
        key: String,
    },
    LeaseLost {
        store_key: String,
        scope: String,
    },
    JoinSettled {
        store_key: String,
        join_id: JoinId,
        satisfied: bool,
    },
    JobMaterialized {
        store_key: String,
        job_name: String,
    },
}

pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: DispatchEvent);
}

/// Default emitter: structured tracing events, nothing else.
#[derive(Debug, Default, Clone)]
pub struct TracingEmitter;

impl EventEmitter for TracingEmitter {
    fn emit(&self, event: DispatchEvent) {
        match event {
            DispatchEvent::MessageDispatched {
                store_key,
                message_id,
                topic,
            } => info!(%store_key, %message_id, %topic, "message dispatched"),
            DispatchEvent::MessageFailed {
                store_key,
                message_id,
                topic,
                error,
            } => warn!(%store_key, %message_id, %topic, %error, "message failed"),
            DispatchEvent::MessageSuppressed {
                store_key,
                message_id,
                topic,
                key,
            } => info!(%store_key, %message_id, %topic, %key, "duplicate suppressed"),
            DispatchEvent::LeaseLost { store_key, scope } => {
                warn!(%store_key, %scope, "lease lost")
            }
            DispatchEvent::JoinSettled {
                store_key,
                join_id,
                satisfied,
            } => info!(%store_key, %join_id, satisfied, "join settled"),
            DispatchEvent::JobMaterialized {
                store_key,
                job_name,
            } => info!(%store_key, %job_name, "job run materialized"),
        }
    }
}
