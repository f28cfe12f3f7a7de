use crate::clock::Clock;
use async_trait::async_trait;
use conveyor_protocol::DispatchError;
use conveyor_protocol::OwnerToken;
use conveyor_state::BeginOutcome;
use conveyor_state::StoreRuntime;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing::warn;

/// Terminal result of one keyed execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The side effect ran (or a probe confirmed it) and was recorded.
    Completed(Option<Vec<u8>>),
    /// A previous execution already completed; its outcome is returned
    /// without running the side effect again.
    Suppressed(Option<Vec<u8>>),
    /// The key is locked by a live attempt or failed transiently;
    /// re-dispatch later.
    Retry { reason: String },
    PermanentFailure { reason: String },
}

/// Confirms whether an interrupted attempt's side effect actually landed.
///
/// Consulted only when an expired in-progress lock is taken over and the
/// executor was built with a probe. `Ok(Some(outcome))` records the attempt
/// as completed without replaying the side effect.
#[async_trait]
pub trait EffectProbe: Send + Sync {
    async fn confirm(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
}

/// Key-scoped suppression of duplicate side-effects.
///
/// Without a probe, a crash after the side effect but before the terminal
/// update re-invokes the side effect once the in-progress lock expires;
/// callers must design their effects accordingly.
pub struct ExactlyOnceExecutor {
    store: StoreRuntime,
    owner: OwnerToken,
    lock_ttl: Duration,
    clock: Arc<dyn Clock>,
    probe: Option<Arc<dyn EffectProbe>>,
}

impl ExactlyOnceExecutor {
    pub fn new(
        store: StoreRuntime,
        owner: OwnerToken,
        lock_ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            owner,
            lock_ttl,
            clock,
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn EffectProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Run `effect` at most once for `key`.
    ///
    /// The effect returns its recordable outcome bytes on success; a
    /// `DispatchError::Transient` releases the key for retry, anything
    /// else settles it permanently.
    pub async fn execute<F, Fut>(&self, key: &str, effect: F) -> anyhow::Result<ExecutionOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Vec<u8>>, DispatchError>>,
    {
        let now = self.clock.now();
        let begin = self
            .store
            .begin_idempotent(key, &self.owner, self.lock_ttl, now)
            .await?;

        let prior_attempt = match begin {
            BeginOutcome::AlreadyCompleted { outcome } => {
                debug!(%key, "duplicate suppressed");
                return Ok(ExecutionOutcome::Suppressed(outcome));
            }
            BeginOutcome::AlreadyFailed {
                error_code,
                error_message,
            } => {
                let reason = match (error_code, error_message) {
                    (Some(code), Some(message)) => format!("{code}: {message}"),
                    (Some(code), None) => code,
                    (None, Some(message)) => message,
                    (None, None) => "previously failed".to_string(),
                };
                return Ok(ExecutionOutcome::PermanentFailure { reason });
            }
            BeginOutcome::AlreadyInProgress { owner, .. } => {
                return Ok(ExecutionOutcome::Retry {
                    reason: format!(
                        "key locked by {}",
                        owner.as_deref().unwrap_or("another owner")
                    ),
                });
            }
            BeginOutcome::Fresh { prior_attempt } => prior_attempt,
        };

        if prior_attempt && let Some(probe) = &self.probe {
            match probe.confirm(key).await {
                Ok(Some(outcome)) => {
                    self.store
                        .complete_idempotent(key, &self.owner, Some(&outcome), self.clock.now())
                        .await?;
                    debug!(%key, "probe confirmed an interrupted attempt");
                    return Ok(ExecutionOutcome::Completed(Some(outcome)));
                }
                Ok(None) => {}
                Err(err) => {
                    // An unanswerable probe must not block the retry path.
                    warn!(%key, "effect probe failed: {err:#}");
                }
            }
        }

        match effect().await {
            Ok(outcome) => {
                let recorded = self
                    .store
                    .complete_idempotent(key, &self.owner, outcome.as_deref(), self.clock.now())
                    .await?;
                if !recorded {
                    // The lock expired mid-effect and someone else owns the
                    // key now; surface a retry so the row is not acked on
                    // an unrecorded execution.
                    return Ok(ExecutionOutcome::Retry {
                        reason: format!("lost the execution lock for {key}"),
                    });
                }
                Ok(ExecutionOutcome::Completed(outcome))
            }
            Err(DispatchError::Permanent { message }) => {
                self.store
                    .fail_idempotent(
                        key,
                        &self.owner,
                        "permanent",
                        &message,
                        true,
                        self.clock.now(),
                    )
                    .await?;
                Ok(ExecutionOutcome::PermanentFailure { reason: message })
            }
            Err(err) => {
                let message = err.to_string();
                self.store
                    .fail_idempotent(
                        key,
                        &self.owner,
                        "transient",
                        &message,
                        false,
                        self.clock.now(),
                    )
                    .await?;
                Ok(ExecutionOutcome::Retry { reason: message })
            }
        }
    }
}
