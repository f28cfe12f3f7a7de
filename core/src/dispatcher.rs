use crate::METRIC_HANDLER_RESULT;
use crate::METRIC_LEASE_ACQUIRED;
use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::config::DispatchConfig;
use crate::events::DispatchEvent;
use crate::events::EventEmitter;
use crate::events::TracingEmitter;
use crate::executor::EffectProbe;
use crate::executor::ExactlyOnceExecutor;
use crate::executor::ExecutionOutcome;
use crate::handler::HandlerContext;
use crate::handler::HandlerOutcome;
use crate::handler::HandlerRegistry;
use crate::lease::LeaseHandle;
use crate::router::Router;
use crate::router::StoreEntry;
use crate::scheduler::SCHEDULER_SCOPE;
use crate::scheduler::Scheduler;
use crate::sweeper::run_sweep_pass;
use conveyor_otel::MetricsClient;
use conveyor_protocol::DispatchError;
use conveyor_protocol::MessageId;
use conveyor_protocol::OwnerToken;
use conveyor_state::InboxRecord;
use conveyor_state::OutboxMessage;
use conveyor_state::StoreRuntime;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

/// Lease scope serializing outbox passes per store.
pub const OUTBOX_SCOPE: &str = "outbox:dispatch";
/// Lease scope serializing inbox passes per store.
pub const INBOX_SCOPE: &str = "inbox:dispatch";

/// One dispatcher process: a single owner token and the poll/claim/handle
/// loops that fan work out to registered handlers across the store fleet.
pub struct Dispatcher {
    owner: OwnerToken,
    router: Arc<Router>,
    outbox_handlers: Arc<HandlerRegistry>,
    inbox_handlers: Arc<HandlerRegistry>,
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventEmitter>,
    metrics: Option<MetricsClient>,
    probe: Option<Arc<dyn EffectProbe>>,
}

impl Dispatcher {
    pub fn new(
        router: Arc<Router>,
        outbox_handlers: Arc<HandlerRegistry>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            owner: OwnerToken::generate(),
            router,
            outbox_handlers,
            inbox_handlers: Arc::new(HandlerRegistry::new()),
            config,
            clock: Arc::new(SystemClock::new()),
            events: Arc::new(TracingEmitter),
            metrics: None,
            probe: None,
        }
    }

    /// Inbox handlers are keyed by `source` rather than topic.
    pub fn with_inbox_handlers(mut self, handlers: Arc<HandlerRegistry>) -> Self {
        self.inbox_handlers = handlers;
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

    pub fn with_metrics(mut self, metrics: MetricsClient) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Side-effect probe consulted when an interrupted attempt's lock is
    /// taken over. Only used while `allow_probe` is on in the config.
    pub fn with_effect_probe(mut self, probe: Arc<dyn EffectProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn owner(&self) -> &OwnerToken {
        &self.owner
    }

    /// Start the loops. Everything stops (cooperatively) through the
    /// returned handle.
    pub fn spawn(self) -> DispatcherHandle {
        let cancel = CancellationToken::new();
        let this = Arc::new(self);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        if this.config.enable_background_workers {
            tasks.push(tokio::spawn(outbox_loop(
                Arc::clone(&this),
                cancel.child_token(),
            )));
            tasks.push(tokio::spawn(inbox_loop(
                Arc::clone(&this),
                cancel.child_token(),
            )));
            tasks.push(tokio::spawn(scheduler_loop(
                Arc::clone(&this),
                cancel.child_token(),
            )));
            tasks.push(tokio::spawn(sweeper_loop(
                Arc::clone(&this),
                cancel.child_token(),
            )));
            tasks.push(tokio::spawn(discovery_loop(
                Arc::clone(&this),
                cancel.child_token(),
            )));
        }
        DispatcherHandle { cancel, tasks }
    }

    fn emit_result(&self, topic: &str, result: &str) {
        if let Some(metrics) = &self.metrics
            && let Err(err) =
                metrics.counter(METRIC_HANDLER_RESULT, 1, &[("topic", topic), ("result", result)])
        {
            warn!("failed to record metric: {err}");
        }
    }

    fn note_lease_acquired(&self, scope: &str) {
        if let Some(metrics) = &self.metrics
            && let Err(err) = metrics.counter(METRIC_LEASE_ACQUIRED, 1, &[("scope", scope)])
        {
            warn!("failed to record metric: {err}");
        }
    }

    async fn run_outbox_pass(
        self: &Arc<Self>,
        entry: &StoreEntry,
        workers: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<usize> {
        let ttl = Duration::from_secs(self.config.lease_seconds.max(1) as u64);
        let Some(lease) = LeaseHandle::acquire(
            &entry.runtime,
            &entry.key,
            OUTBOX_SCOPE,
            &self.owner,
            ttl,
            Arc::clone(&self.clock),
            Arc::clone(&self.events),
            self.metrics.clone(),
        )
        .await?
        else {
            return Ok(0);
        };
        self.note_lease_acquired(OUTBOX_SCOPE);

        let now = self.clock.now();
        let messages = entry
            .runtime
            .claim_outbox(
                &self.owner,
                self.config.lease_seconds,
                self.config.batch_size,
                now,
            )
            .await?;
        if messages.is_empty() {
            lease.release().await?;
            return Ok(0);
        }

        // Keep row leases alive while handlers run; past the configured
        // ceiling the handlers are signaled to abandon instead.
        let ids: Vec<MessageId> = messages.iter().map(|m| m.id).collect();
        let handler_cancel = cancel.child_token();
        let extender_cancel = CancellationToken::new();
        let extender = tokio::spawn(extend_outbox_row_leases(
            entry.runtime.clone(),
            self.owner.clone(),
            ids,
            self.config.lease_seconds,
            self.config.max_handler_runtime,
            Arc::clone(&self.clock),
            extender_cancel.clone(),
            handler_cancel.clone(),
        ));

        let count = messages.len();
        let fan_out = async {
            let mut handlers = JoinSet::new();
            for message in messages {
                lease.ensure_held()?;
                let permit = Arc::clone(workers).acquire_owned().await?;
                let this = Arc::clone(self);
                let store = entry.runtime.clone();
                let store_key = entry.key.clone();
                let message_cancel = handler_cancel.child_token();
                handlers.spawn(async move {
                    let _permit = permit;
                    this.dispatch_outbox_message(store_key, store, message, message_cancel)
                        .await;
                });
            }
            while handlers.join_next().await.is_some() {}
            anyhow::Ok(())
        }
        .await;
        extender_cancel.cancel();
        let _ = extender.await;
        fan_out?;

        lease.release().await?;
        Ok(count)
    }

    async fn dispatch_outbox_message(
        self: Arc<Self>,
        store_key: String,
        store: StoreRuntime,
        message: OutboxMessage,
        cancel: CancellationToken,
    ) {
        let topic = message.topic.clone();
        let message_id = message.id;
        let attempt = message.retry_count;
        let now = self.clock.now();

        let Some(handler) = self.outbox_handlers.get(&topic) else {
            let error = DispatchError::UnknownTopic {
                topic: topic.clone(),
            }
            .to_string();
            self.settle_failed(&store_key, &store, message_id, &topic, &error, "unknown_topic")
                .await;
            return;
        };

        let dedup_key = message
            .message_key
            .clone()
            .unwrap_or_else(|| format!("outbox:{message_id}"));
        let mut executor = ExactlyOnceExecutor::new(
            store.clone(),
            self.owner.clone(),
            Duration::from_secs(self.config.lease_seconds.max(1) as u64),
            Arc::clone(&self.clock),
        );
        if self.config.allow_probe
            && let Some(probe) = &self.probe
        {
            executor = executor.with_probe(Arc::clone(probe));
        }
        let ctx = HandlerContext {
            store_key: store_key.clone(),
            message_id,
            topic: topic.clone(),
            correlation_id: message.correlation_id.clone(),
            attempt,
            cancel,
        };
        let payload = message.payload.clone();
        let outcome = executor
            .execute(&dedup_key, move || async move {
                match handler.handle(ctx, payload).await {
                    HandlerOutcome::Success(outcome) => Ok(outcome),
                    HandlerOutcome::Transient(message) => Err(DispatchError::transient(message)),
                    HandlerOutcome::Permanent(message) => Err(DispatchError::permanent(message)),
                }
            })
            .await;

        match outcome {
            Err(err) => {
                // Uncategorized errors count as transient, bounded by the
                // same retry ceiling as declared transients.
                warn!(%topic, %message_id, "executor error: {err:#}");
                if attempt + 1 >= self.config.max_attempts {
                    let error =
                        format!("retry ceiling reached after {} attempts: {err:#}", attempt + 1);
                    self.settle_failed(&store_key, &store, message_id, &topic, &error, "exhausted")
                        .await;
                } else {
                    let delay = self.config.retry_delay(attempt as u64 + 1);
                    if let Err(err) = store
                        .abandon_outbox(
                            &self.owner,
                            &[message_id],
                            Some(&err.to_string()),
                            Some(delay),
                            now,
                        )
                        .await
                    {
                        warn!(%message_id, "failed to abandon after executor error: {err:#}");
                    }
                    self.emit_result(&topic, "error");
                }
            }
            Ok(ExecutionOutcome::Completed(_)) => {
                match store.ack_outbox(&self.owner, &[message_id], now).await {
                    Ok(1) => {
                        self.events.emit(DispatchEvent::MessageDispatched {
                            store_key,
                            message_id,
                            topic: topic.clone(),
                        });
                        self.emit_result(&topic, "dispatched");
                    }
                    Ok(_) => {
                        // The lease lapsed mid-handler and the row moved on;
                        // the idempotency record will suppress the rerun.
                        debug!(%message_id, "ack raced a reclaim; relying on suppression");
                        self.emit_result(&topic, "ack_raced");
                    }
                    Err(err) => {
                        warn!(%message_id, "failed to ack: {err:#}");
                        self.emit_result(&topic, "error");
                    }
                }
            }
            Ok(ExecutionOutcome::Suppressed(_)) => {
                match store.ack_outbox(&self.owner, &[message_id], now).await {
                    Ok(_) => {
                        self.events.emit(DispatchEvent::MessageSuppressed {
                            store_key,
                            message_id,
                            topic: topic.clone(),
                            key: dedup_key,
                        });
                        self.emit_result(&topic, "suppressed");
                    }
                    Err(err) => {
                        warn!(%message_id, "failed to ack suppressed row: {err:#}");
                        self.emit_result(&topic, "error");
                    }
                }
            }
            Ok(ExecutionOutcome::Retry { reason }) => {
                if attempt + 1 >= self.config.max_attempts {
                    let error = format!("retry ceiling reached after {} attempts: {reason}", attempt + 1);
                    self.settle_failed(&store_key, &store, message_id, &topic, &error, "exhausted")
                        .await;
                } else {
                    let delay = self.config.retry_delay(attempt as u64 + 1);
                    if let Err(err) = store
                        .abandon_outbox(&self.owner, &[message_id], Some(&reason), Some(delay), now)
                        .await
                    {
                        warn!(%message_id, "failed to abandon: {err:#}");
                    }
                    self.emit_result(&topic, "retry");
                }
            }
            Ok(ExecutionOutcome::PermanentFailure { reason }) => {
                self.settle_failed(&store_key, &store, message_id, &topic, &reason, "failed")
                    .await;
            }
        }
    }

    async fn settle_failed(
        &self,
        store_key: &str,
        store: &StoreRuntime,
        message_id: MessageId,
        topic: &str,
        error: &str,
        result: &str,
    ) {
        match store
            .fail_outbox(&self.owner, &[message_id], error, self.clock.now())
            .await
        {
            Ok(_) => {
                self.events.emit(DispatchEvent::MessageFailed {
                    store_key: store_key.to_string(),
                    message_id,
                    topic: topic.to_string(),
                    error: error.to_string(),
                });
                self.emit_result(topic, result);
            }
            Err(err) => {
                warn!(%message_id, "failed to mark row failed: {err:#}");
                self.emit_result(topic, "error");
            }
        }
    }

    async fn run_inbox_pass(
        self: &Arc<Self>,
        entry: &StoreEntry,
        workers: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<usize> {
        let ttl = Duration::from_secs(self.config.lease_seconds.max(1) as u64);
        let Some(lease) = LeaseHandle::acquire(
            &entry.runtime,
            &entry.key,
            INBOX_SCOPE,
            &self.owner,
            ttl,
            Arc::clone(&self.clock),
            Arc::clone(&self.events),
            self.metrics.clone(),
        )
        .await?
        else {
            return Ok(0);
        };
        self.note_lease_acquired(INBOX_SCOPE);

        let now = self.clock.now();
        let records = entry
            .runtime
            .claim_inbox(
                &self.owner,
                self.config.lease_seconds,
                self.config.batch_size,
                now,
            )
            .await?;
        if records.is_empty() {
            lease.release().await?;
            return Ok(0);
        }

        let ids: Vec<MessageId> = records.iter().map(|r| r.id).collect();
        let handler_cancel = cancel.child_token();
        let extender_cancel = CancellationToken::new();
        let extender = tokio::spawn(extend_inbox_row_leases(
            entry.runtime.clone(),
            self.owner.clone(),
            ids,
            self.config.lease_seconds,
            self.config.max_handler_runtime,
            Arc::clone(&self.clock),
            extender_cancel.clone(),
            handler_cancel.clone(),
        ));

        let count = records.len();
        let fan_out = async {
            let mut handlers = JoinSet::new();
            for record in records {
                lease.ensure_held()?;
                let permit = Arc::clone(workers).acquire_owned().await?;
                let this = Arc::clone(self);
                let store = entry.runtime.clone();
                let store_key = entry.key.clone();
                let record_cancel = handler_cancel.child_token();
                handlers.spawn(async move {
                    let _permit = permit;
                    this.dispatch_inbox_record(store_key, store, record, record_cancel)
                        .await;
                });
            }
            while handlers.join_next().await.is_some() {}
            anyhow::Ok(())
        }
        .await;
        extender_cancel.cancel();
        let _ = extender.await;
        fan_out?;

        lease.release().await?;
        Ok(count)
    }

    async fn dispatch_inbox_record(
        self: Arc<Self>,
        store_key: String,
        store: StoreRuntime,
        record: InboxRecord,
        cancel: CancellationToken,
    ) {
        let source = record.source.clone();
        let record_id = record.id;
        let attempt = record.retry_count;
        let now = self.clock.now();

        let outcome = match self.inbox_handlers.get(&source) {
            None => HandlerOutcome::Permanent(
                DispatchError::UnknownTopic {
                    topic: source.clone(),
                }
                .to_string(),
            ),
            Some(handler) => {
                let ctx = HandlerContext {
                    store_key: store_key.clone(),
                    message_id: record_id,
                    topic: source.clone(),
                    correlation_id: None,
                    attempt,
                    cancel,
                };
                handler.handle(ctx, record.payload.clone()).await
            }
        };

        let result = match outcome {
            HandlerOutcome::Success(_) => {
                match store.ack_inbox(&self.owner, &[record_id], now).await {
                    Ok(_) => "processed",
                    Err(err) => {
                        warn!(%record_id, "failed to ack inbox record: {err:#}");
                        "error"
                    }
                }
            }
            HandlerOutcome::Transient(reason) => {
                if attempt + 1 >= self.config.max_attempts {
                    let error =
                        format!("retry ceiling reached after {} attempts: {reason}", attempt + 1);
                    match store.fail_inbox(&self.owner, &[record_id], &error, now).await {
                        Ok(_) => "exhausted",
                        Err(err) => {
                            warn!(%record_id, "failed to fail inbox record: {err:#}");
                            "error"
                        }
                    }
                } else {
                    match store
                        .abandon_inbox(&self.owner, &[record_id], Some(&reason), now)
                        .await
                    {
                        Ok(_) => "retry",
                        Err(err) => {
                            warn!(%record_id, "failed to abandon inbox record: {err:#}");
                            "error"
                        }
                    }
                }
            }
            HandlerOutcome::Permanent(reason) => {
                match store.fail_inbox(&self.owner, &[record_id], &reason, now).await {
                    Ok(_) => {
                        self.events.emit(DispatchEvent::MessageFailed {
                            store_key,
                            message_id: record_id,
                            topic: source.clone(),
                            error: reason,
                        });
                        "failed"
                    }
                    Err(err) => {
                        warn!(%record_id, "failed to fail inbox record: {err:#}");
                        "error"
                    }
                }
            }
        };
        self.emit_result(&source, result);
    }
}

/// Running dispatcher loops; cancel and drain through [`shutdown`].
///
/// [`shutdown`]: DispatcherHandle::shutdown
pub struct DispatcherHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn outbox_loop(dispatcher: Arc<Dispatcher>, cancel: CancellationToken) {
    let workers = Arc::new(Semaphore::new(dispatcher.config.worker_count.max(1)));
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let mut dispatched = 0;
        for entry in dispatcher.router.rotation() {
            if cancel.is_cancelled() {
                return;
            }
            match dispatcher.run_outbox_pass(&entry, &workers, &cancel).await {
                Ok(count) => dispatched += count,
                Err(err) => warn!(store = %entry.key, "outbox pass failed: {err:#}"),
            }
        }
        if dispatched == 0 {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(dispatcher.config.poll_interval) => {}
            }
        }
    }
}

async fn inbox_loop(dispatcher: Arc<Dispatcher>, cancel: CancellationToken) {
    let workers = Arc::new(Semaphore::new(dispatcher.config.worker_count.max(1)));
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let mut processed = 0;
        for entry in dispatcher.router.rotation() {
            if cancel.is_cancelled() {
                return;
            }
            match dispatcher.run_inbox_pass(&entry, &workers, &cancel).await {
                Ok(count) => processed += count,
                Err(err) => warn!(store = %entry.key, "inbox pass failed: {err:#}"),
            }
        }
        if processed == 0 {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(dispatcher.config.poll_interval) => {}
            }
        }
    }
}

async fn scheduler_loop(dispatcher: Arc<Dispatcher>, cancel: CancellationToken) {
    let scheduler = Scheduler::new(
        dispatcher.owner.clone(),
        dispatcher.config.clone(),
        Arc::clone(&dispatcher.clock),
        Arc::clone(&dispatcher.events),
        dispatcher.metrics.clone(),
    );
    let ttl = Duration::from_secs(dispatcher.config.lease_seconds.max(1) as u64);
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let mut sleep = dispatcher.config.max_polling_interval;
        for entry in dispatcher.router.rotation() {
            if cancel.is_cancelled() {
                return;
            }
            let lease = match LeaseHandle::acquire(
                &entry.runtime,
                &entry.key,
                SCHEDULER_SCOPE,
                &dispatcher.owner,
                ttl,
                Arc::clone(&dispatcher.clock),
                Arc::clone(&dispatcher.events),
                dispatcher.metrics.clone(),
            )
            .await
            {
                Ok(Some(lease)) => lease,
                Ok(None) => continue,
                Err(err) => {
                    warn!(store = %entry.key, "scheduler lease acquire failed: {err:#}");
                    continue;
                }
            };
            dispatcher.note_lease_acquired(SCHEDULER_SCOPE);

            match scheduler.run_pass(&entry.key, &entry.runtime, &lease).await {
                Ok(Some(pass)) => {
                    sleep = sleep.min(pass.sleep_duration(
                        dispatcher.clock.now(),
                        dispatcher.config.max_polling_interval,
                    ));
                }
                Ok(None) => {}
                Err(err) => warn!(store = %entry.key, "scheduler pass failed: {err:#}"),
            }
            if let Err(err) = lease.release().await {
                warn!(store = %entry.key, "scheduler lease release failed: {err:#}");
            }
        }
        if sleep.is_zero() {
            continue;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(sleep.max(Duration::from_millis(10))) => {}
        }
    }
}

async fn sweeper_loop(dispatcher: Arc<Dispatcher>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(dispatcher.config.cleanup_interval) => {}
        }
        for entry in dispatcher.router.snapshot().iter() {
            if cancel.is_cancelled() {
                return;
            }
            if let Err(err) = run_sweep_pass(
                &entry.runtime,
                dispatcher.config.retention_period,
                dispatcher.clock.now(),
            )
            .await
            {
                warn!(store = %entry.key, "sweep pass failed: {err:#}");
            }
        }
    }
}

async fn discovery_loop(dispatcher: Arc<Dispatcher>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(dispatcher.config.discovery_refresh_interval) => {}
        }
        if let Err(err) = dispatcher.router.refresh().await {
            warn!("discovery refresh failed: {err:#}");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn extend_outbox_row_leases(
    store: StoreRuntime,
    owner: OwnerToken,
    ids: Vec<MessageId>,
    lease_seconds: i64,
    max_runtime: Duration,
    clock: Arc<dyn Clock>,
    done: CancellationToken,
    handlers: CancellationToken,
) {
    let cadence = Duration::from_secs(lease_seconds.max(2) as u64) / 2;
    let started = clock.monotonic();
    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = tokio::time::sleep(cadence) => {}
        }
        if clock.monotonic().saturating_sub(started) >= max_runtime {
            warn!("handlers exceeded the runtime ceiling; signaling abandon");
            handlers.cancel();
            return;
        }
        if let Err(err) = store
            .extend_outbox_leases(&owner, &ids, lease_seconds, clock.now())
            .await
        {
            warn!("failed to extend row leases: {err:#}");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn extend_inbox_row_leases(
    store: StoreRuntime,
    owner: OwnerToken,
    ids: Vec<MessageId>,
    lease_seconds: i64,
    max_runtime: Duration,
    clock: Arc<dyn Clock>,
    done: CancellationToken,
    handlers: CancellationToken,
) {
    let cadence = Duration::from_secs(lease_seconds.max(2) as u64) / 2;
    let started = clock.monotonic();
    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = tokio::time::sleep(cadence) => {}
        }
        if clock.monotonic().saturating_sub(started) >= max_runtime {
            warn!("handlers exceeded the runtime ceiling; signaling abandon");
            handlers.cancel();
            return;
        }
        if let Err(err) = store
            .extend_inbox_leases(&owner, &ids, lease_seconds, clock.now())
            .await
        {
            warn!("failed to extend row leases: {err:#}");
        }
    }
}
