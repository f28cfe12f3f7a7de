use crate::METRIC_LEASE_LOST;
use crate::clock::Clock;
use crate::events::DispatchEvent;
use crate::events::EventEmitter;
use chrono::DateTime;
use chrono::Utc;
use conveyor_otel::MetricsClient;
use conveyor_protocol::DispatchError;
use conveyor_protocol::OwnerToken;
use conveyor_state::StoreRuntime;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

struct LeaseState {
    fencing_token: i64,
    lease_until: DateTime<Utc>,
    lost: bool,
}

struct LeaseShared {
    store: StoreRuntime,
    store_key: String,
    scope: String,
    owner: OwnerToken,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventEmitter>,
    metrics: Option<MetricsClient>,
    state: Mutex<LeaseState>,
    lost_callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl LeaseShared {
    fn mark_lost(&self) {
        let already_lost = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::replace(&mut state.lost, true)
        };
        if already_lost {
            return;
        }
        warn!(scope = %self.scope, owner = %self.owner, "lease lost");
        self.events.emit(DispatchEvent::LeaseLost {
            store_key: self.store_key.clone(),
            scope: self.scope.clone(),
        });
        if let Some(metrics) = &self.metrics
            && let Err(err) =
                metrics.counter(METRIC_LEASE_LOST, 1, &[("scope", self.scope.as_str())])
        {
            warn!("failed to record metric: {err}");
        }
        let callbacks = {
            let mut callbacks = self
                .lost_callbacks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *callbacks)
        };
        for callback in callbacks {
            callback();
        }
    }
}

/// A held scope lease with its background renewer.
///
/// The renewer refreshes at a third of the ttl. A renew that updates zero
/// rows means another owner took the scope: the handle flips to lost, the
/// loss is surfaced as an event and a counter, the registered callbacks
/// fire, and `ensure_held` starts failing. Dropping the handle stops the
/// renewer; the row then lapses at its ttl unless [`LeaseHandle::release`]
/// gave it up explicitly.
pub struct LeaseHandle {
    shared: Arc<LeaseShared>,
    renewer: JoinHandle<()>,
}

impl LeaseHandle {
    /// Try to take `scope` on the store behind `store_key`. Returns `None`
    /// when another live owner holds it.
    #[allow(clippy::too_many_arguments)]
    pub async fn acquire(
        store: &StoreRuntime,
        store_key: &str,
        scope: &str,
        owner: &OwnerToken,
        ttl: Duration,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventEmitter>,
        metrics: Option<MetricsClient>,
    ) -> anyhow::Result<Option<LeaseHandle>> {
        let Some(grant) = store.acquire_lease(scope, owner, ttl, clock.now()).await? else {
            return Ok(None);
        };
        debug!(%scope, %owner, token = grant.fencing_token, "lease acquired");

        let shared = Arc::new(LeaseShared {
            store: store.clone(),
            store_key: store_key.to_string(),
            scope: scope.to_string(),
            owner: owner.clone(),
            clock,
            events,
            metrics,
            state: Mutex::new(LeaseState {
                fencing_token: grant.fencing_token,
                lease_until: grant.lease_until,
                lost: false,
            }),
            lost_callbacks: Mutex::new(Vec::new()),
        });
        let renewer = tokio::spawn(renew_loop(Arc::clone(&shared), ttl));
        Ok(Some(LeaseHandle { shared, renewer }))
    }

    /// Monotonically non-decreasing token for fencing downstream writes.
    pub fn fencing_token(&self) -> i64 {
        self.shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .fencing_token
    }

    pub fn is_lost(&self) -> bool {
        self.shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .lost
    }

    /// Fail fast when the scope is no longer held; the caller must abort
    /// its batch without mutating state.
    pub fn ensure_held(&self) -> Result<(), DispatchError> {
        if self.is_lost() {
            return Err(DispatchError::LeaseLost {
                scope: self.shared.scope.clone(),
            });
        }
        Ok(())
    }

    /// Run `callback` once if the lease is ever lost. Fires immediately
    /// when the lease is already gone.
    pub fn on_lost(&self, callback: impl FnOnce() + Send + 'static) {
        if self.is_lost() {
            callback();
            return;
        }
        self.shared
            .lost_callbacks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Box::new(callback));
    }

    /// Stop renewing and give the scope up so another dispatcher can take
    /// it without waiting out the ttl.
    pub async fn release(self) -> anyhow::Result<()> {
        self.renewer.abort();
        if !self.is_lost() {
            self.shared
                .store
                .release_lease(&self.shared.scope, &self.shared.owner)
                .await?;
        }
        Ok(())
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        self.renewer.abort();
    }
}

async fn renew_loop(shared: Arc<LeaseShared>, ttl: Duration) {
    let cadence = ttl / 3;
    loop {
        tokio::time::sleep(cadence).await;
        let (lost, lease_until) = {
            let state = shared
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            (state.lost, state.lease_until)
        };
        if lost {
            return;
        }

        let now = shared.clock.now();
        match shared
            .store
            .renew_lease(&shared.scope, &shared.owner, ttl, now)
            .await
        {
            Ok(Some(grant)) => {
                let mut state = shared
                    .state
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                state.fencing_token = grant.fencing_token;
                state.lease_until = grant.lease_until;
            }
            Ok(None) => {
                shared.mark_lost();
                return;
            }
            Err(err) => {
                // Transient store trouble: the lease may still be held, so
                // keep trying until the grant itself lapses.
                warn!(scope = %shared.scope, "lease renew failed: {err:#}");
                if now >= lease_until {
                    shared.mark_lost();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::events::TracingEmitter;
    use conveyor_otel::MetricsConfig;
    use conveyor_state::TableNames;
    use opentelemetry_sdk::metrics::InMemoryMetricExporter;
    use opentelemetry_sdk::metrics::data::AggregatedMetrics;
    use opentelemetry_sdk::metrics::data::MetricData;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;

    async fn open_store() -> (StoreRuntime, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = StoreRuntime::open(
            &dir.path().join("store.sqlite"),
            TableNames::default(),
            true,
            None,
        )
        .await
        .expect("open store");
        (store, dir)
    }

    #[derive(Default)]
    struct CapturingEmitter(Mutex<Vec<DispatchEvent>>);

    impl EventEmitter for CapturingEmitter {
        fn emit(&self, event: DispatchEvent) {
            self.0
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(event);
        }
    }

    #[tokio::test]
    async fn acquire_renew_release_round_trip() {
        let (store, _dir) = open_store().await;
        let owner = OwnerToken::generate();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

        let handle = LeaseHandle::acquire(
            &store,
            "store-a",
            "scheduler:run",
            &owner,
            Duration::from_millis(300),
            Arc::clone(&clock),
            Arc::new(TracingEmitter),
            None,
        )
        .await
        .expect("acquire")
        .expect("granted");
        let first_token = handle.fencing_token();
        assert!(handle.ensure_held().is_ok());

        // Let the renewer run a few cadences; the lease must survive past
        // its original ttl and the token must advance.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(!handle.is_lost());
        assert!(handle.fencing_token() > first_token);

        handle.release().await.expect("release");
        let row = store
            .get_lease("scheduler:run")
            .await
            .expect("get lease")
            .expect("row exists");
        assert_eq!(row.owner, None);
    }

    #[tokio::test]
    async fn losing_the_row_emits_the_event_and_metric_and_fires_the_callback() {
        let (store, _dir) = open_store().await;
        let owner = OwnerToken::generate();
        let thief = OwnerToken::generate();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let events = Arc::new(CapturingEmitter::default());
        let exporter = InMemoryMetricExporter::default();
        let metrics =
            MetricsClient::new(MetricsConfig::in_memory("test", "conveyor", exporter.clone()))
                .expect("build metrics client");

        let handle = LeaseHandle::acquire(
            &store,
            "store-a",
            "scheduler:run",
            &owner,
            Duration::from_millis(200),
            Arc::clone(&clock),
            Arc::clone(&events) as Arc<dyn EventEmitter>,
            Some(metrics.clone()),
        )
        .await
        .expect("acquire")
        .expect("granted");

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);
        handle.on_lost(move || fired_clone.store(true, Ordering::SeqCst));

        // Steal the row as if the original holder had gone quiet.
        let future = clock.now() + chrono::Duration::seconds(10);
        store
            .acquire_lease("scheduler:run", &thief, Duration::from_secs(30), future)
            .await
            .expect("steal")
            .expect("granted to thief");

        // The next renew observes zero rows updated and marks the loss.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(handle.is_lost());
        assert!(fired.load(Ordering::SeqCst));
        assert!(matches!(
            handle.ensure_held(),
            Err(DispatchError::LeaseLost { .. })
        ));

        let captured = events
            .0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        assert!(
            captured.iter().any(|event| matches!(
                event,
                DispatchEvent::LeaseLost { store_key, scope }
                    if store_key == "store-a" && scope == "scheduler:run"
            )),
            "no lease-lost event was emitted: {captured:?}"
        );

        metrics.force_flush().expect("flush metrics");
        let lost: u64 = exporter
            .get_finished_metrics()
            .expect("finished metrics")
            .iter()
            .flat_map(|resource| resource.scope_metrics())
            .flat_map(|scope| scope.metrics())
            .filter(|metric| metric.name() == METRIC_LEASE_LOST)
            .map(|metric| match metric.data() {
                AggregatedMetrics::U64(MetricData::Sum(sum)) => {
                    sum.data_points().map(|p| p.value()).sum::<u64>()
                }
                _ => 0,
            })
            .sum();
        assert_eq!(lost, 1);
    }
}
