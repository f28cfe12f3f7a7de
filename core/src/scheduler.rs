use crate::METRIC_SCHEDULER_MATERIALIZED;
use crate::clock::Clock;
use crate::config::DispatchConfig;
use crate::cron_spec::CronSpec;
use crate::events::DispatchEvent;
use crate::events::EventEmitter;
use crate::lease::LeaseHandle;
use chrono::DateTime;
use chrono::Utc;
use conveyor_otel::MetricsClient;
use conveyor_protocol::OwnerToken;
use conveyor_state::EnqueueOutbox;
use conveyor_state::RunStatus;
use conveyor_state::StoreRuntime;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing::warn;

/// Lease scope serializing scheduler passes per store.
pub const SCHEDULER_SCOPE: &str = "scheduler:run";

/// Create or update a recurring job, validating the cron expression and
/// seeding `next_due_time` with its first occurrence after `now`.
pub async fn upsert_job(
    store: &StoreRuntime,
    job_name: &str,
    cron_schedule: &str,
    topic: &str,
    payload: Option<&[u8]>,
    now: DateTime<Utc>,
) -> anyhow::Result<conveyor_protocol::JobId> {
    let spec = CronSpec::parse(cron_schedule)?;
    let next_due = spec
        .next_after(now)
        .ok_or_else(|| anyhow::anyhow!("schedule {cron_schedule:?} has no future occurrence"))?;
    store
        .upsert_job(job_name, topic, spec.source(), payload, next_due)
        .await
}

/// What one scheduler pass did, plus the deadline that bounds the next
/// sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerPass {
    pub jobs_materialized: usize,
    pub timers_enqueued: usize,
    pub runs_enqueued: usize,
    pub next_event_time: Option<DateTime<Utc>>,
}

impl SchedulerPass {
    /// How long to sleep after this pass: until the next known deadline,
    /// never longer than `max_polling_interval`, floored at zero.
    pub fn sleep_duration(&self, now: DateTime<Utc>, max_polling_interval: Duration) -> Duration {
        let Some(next) = self.next_event_time else {
            return max_polling_interval;
        };
        match (next - now).to_std() {
            Ok(until_next) => until_next.min(max_polling_interval),
            Err(_) => Duration::ZERO,
        }
    }
}

/// Materializes due work into the outbox for one store at a time.
///
/// A pass runs in a single transaction under the `scheduler:run` lease and
/// is fenced by the lease token: a stale token (or a lease lost mid-pass)
/// rolls the whole transaction back and no state advances.
pub struct Scheduler {
    owner: OwnerToken,
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventEmitter>,
    metrics: Option<MetricsClient>,
}

impl Scheduler {
    pub fn new(
        owner: OwnerToken,
        config: DispatchConfig,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventEmitter>,
        metrics: Option<MetricsClient>,
    ) -> Self {
        Self {
            owner,
            config,
            clock,
            events,
            metrics,
        }
    }

    /// Run one pass against `store`. Returns `None` when the fencing token
    /// is stale and the pass aborted without materializing anything.
    pub async fn run_pass(
        &self,
        store_key: &str,
        store: &StoreRuntime,
        lease: &LeaseHandle,
    ) -> anyhow::Result<Option<SchedulerPass>> {
        let now = self.clock.now();
        let batch = self.config.batch_size;
        let mut tx = store.begin().await?;

        if !store
            .advance_scheduler_state_in_txn(&mut tx, lease.fencing_token(), now)
            .await?
        {
            warn!(%store_key, token = lease.fencing_token(), "stale fencing token, pass aborted");
            return Ok(None);
        }

        // Materialize due jobs: one run each, next_due_time strictly past
        // now so offline spans are never back-filled.
        let mut jobs_materialized = 0;
        for job in store.due_jobs_in_txn(&mut tx, now, batch).await? {
            lease.ensure_held()?;
            let spec = match CronSpec::parse(&job.cron_schedule) {
                Ok(spec) => spec,
                Err(err) => {
                    warn!(job = %job.job_name, "unparseable schedule, disabling: {err:#}");
                    store.disable_job_in_txn(&mut tx, job.id).await?;
                    continue;
                }
            };
            store.insert_job_run_in_txn(&mut tx, job.id, now).await?;
            match spec.next_after(now) {
                Some(next_due) => {
                    store
                        .advance_job_in_txn(
                            &mut tx,
                            job.id,
                            next_due,
                            now,
                            RunStatus::Pending.as_str(),
                        )
                        .await?;
                }
                None => {
                    warn!(job = %job.job_name, "schedule exhausted, disabling after final run");
                    store.disable_job_in_txn(&mut tx, job.id).await?;
                }
            }
            self.events.emit(DispatchEvent::JobMaterialized {
                store_key: store_key.to_string(),
                job_name: job.job_name.clone(),
            });
            jobs_materialized += 1;
        }

        // Due timers become outbox messages in the same transaction as
        // their status transition.
        let mut timers_enqueued = 0;
        let timers = store
            .claim_due_timers_in_txn(&mut tx, &self.owner, self.config.lease_seconds, batch, now)
            .await?;
        for timer in timers {
            lease.ensure_held()?;
            store
                .enqueue_in_txn(
                    &mut tx,
                    &EnqueueOutbox::new(timer.topic.clone(), timer.payload.clone())
                        .with_correlation_id(timer.id.to_string()),
                )
                .await?;
            store
                .complete_timer_in_txn(&mut tx, &self.owner, timer.id, now)
                .await?;
            timers_enqueued += 1;
        }

        // Due job runs, joined with their definitions for topic/payload.
        let mut runs_enqueued = 0;
        let runs = store
            .claim_due_runs_in_txn(&mut tx, &self.owner, self.config.lease_seconds, batch, now)
            .await?;
        for claimed in runs {
            lease.ensure_held()?;
            let outcome = store
                .enqueue_in_txn(
                    &mut tx,
                    &EnqueueOutbox::new(
                        claimed.topic.clone(),
                        claimed.payload.clone().unwrap_or_default(),
                    )
                    .with_correlation_id(claimed.run.id.to_string()),
                )
                .await?;
            store
                .complete_run_in_txn(
                    &mut tx,
                    &self.owner,
                    claimed.run.id,
                    &outcome.message_id().to_string(),
                    now,
                )
                .await?;
            runs_enqueued += 1;
        }

        let next_event_time = [
            store.next_timer_due_in_txn(&mut tx).await?,
            store.next_run_due_in_txn(&mut tx).await?,
            store.next_job_due_in_txn(&mut tx).await?,
        ]
        .into_iter()
        .flatten()
        .min();

        lease.ensure_held()?;
        tx.commit().await?;

        if let Some(metrics) = &self.metrics {
            for (kind, count) in [
                ("job", jobs_materialized),
                ("timer", timers_enqueued),
                ("run", runs_enqueued),
            ] {
                if count > 0
                    && let Err(err) =
                        metrics.counter(METRIC_SCHEDULER_MATERIALIZED, count as i64, &[("kind", kind)])
                {
                    warn!("failed to record metric: {err}");
                }
            }
        }
        debug!(
            %store_key,
            jobs_materialized, timers_enqueued, runs_enqueued, "scheduler pass complete"
        );
        Ok(Some(SchedulerPass {
            jobs_materialized,
            timers_enqueued,
            runs_enqueued,
            next_event_time,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::events::TracingEmitter;
    use chrono::Duration as ChronoDuration;
    use conveyor_state::OutboxStatus;
    use conveyor_state::TableNames;
    use conveyor_state::TimerStatus;
    use pretty_assertions::assert_eq;

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

    fn scheduler() -> Scheduler {
        Scheduler::new(
            OwnerToken::generate(),
            DispatchConfig::default(),
            Arc::new(SystemClock::new()),
            Arc::new(TracingEmitter),
            None,
        )
    }

    async fn acquire_lease(store: &StoreRuntime) -> LeaseHandle {
        LeaseHandle::acquire(
            store,
            "store-a",
            SCHEDULER_SCOPE,
            &OwnerToken::generate(),
            Duration::from_secs(30),
            Arc::new(SystemClock::new()),
            Arc::new(TracingEmitter),
            None,
        )
        .await
        .expect("acquire")
        .expect("granted")
    }

    #[tokio::test]
    async fn due_timers_become_outbox_messages_atomically() {
        let (store, _dir) = open_store().await;
        let clock = SystemClock::new();
        let timer_id = store
            .schedule_timer("orders", b"{}", clock.now() - ChronoDuration::seconds(1))
            .await
            .expect("schedule timer");

        let lease = acquire_lease(&store).await;
        let pass = scheduler()
            .run_pass("store-a", &store, &lease)
            .await
            .expect("run pass")
            .expect("not stale");
        assert_eq!(pass.timers_enqueued, 1);

        let timer = store
            .get_timer(timer_id)
            .await
            .expect("get timer")
            .expect("timer exists");
        assert_eq!(timer.status, TimerStatus::Processed);
        assert_eq!(
            store
                .count_outbox_with_status(OutboxStatus::Pending)
                .await
                .expect("count"),
            1
        );
        lease.release().await.expect("release");
    }

    #[tokio::test]
    async fn a_due_job_materializes_exactly_one_run_and_advances_past_now() {
        let (store, _dir) = open_store().await;
        let clock = SystemClock::new();
        let now = clock.now();

        // The job fell due a while ago, as if the scheduler had been
        // offline; exactly one run materializes on resume.
        let job_id = store
            .upsert_job(
                "sync-ledger",
                "ledger",
                "*/5 * * * *",
                None,
                now - ChronoDuration::minutes(17),
            )
            .await
            .expect("upsert job");

        let lease = acquire_lease(&store).await;
        let pass = scheduler()
            .run_pass("store-a", &store, &lease)
            .await
            .expect("run pass")
            .expect("not stale");
        assert_eq!(pass.jobs_materialized, 1);
        assert_eq!(pass.runs_enqueued, 1);

        let runs = store.list_job_runs(job_id).await.expect("list runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Processed);
        assert!(runs[0].output.is_some());

        let job = store
            .get_job("sync-ledger")
            .await
            .expect("get job")
            .expect("job exists");
        assert!(job.next_due_time > now);
        assert_eq!(job.last_run_status.as_deref(), Some("pending"));

        // A second pass right away materializes nothing further.
        let pass = scheduler()
            .run_pass("store-a", &store, &lease)
            .await
            .expect("second pass")
            .expect("not stale");
        assert_eq!(pass.jobs_materialized, 0);
        assert_eq!(pass.runs_enqueued, 0);
        lease.release().await.expect("release");
    }

    #[tokio::test]
    async fn stale_fencing_tokens_abort_the_pass() {
        let (store, _dir) = open_store().await;
        let clock = SystemClock::new();

        // A newer leaseholder has already recorded a larger token.
        let mut tx = store.begin().await.expect("begin");
        assert!(
            store
                .advance_scheduler_state_in_txn(&mut tx, 1_000_000, clock.now())
                .await
                .expect("advance")
        );
        tx.commit().await.expect("commit");

        store
            .schedule_timer("orders", b"{}", clock.now() - ChronoDuration::seconds(1))
            .await
            .expect("schedule timer");

        let lease = acquire_lease(&store).await;
        let pass = scheduler()
            .run_pass("store-a", &store, &lease)
            .await
            .expect("run pass");
        assert_eq!(pass, None);
        assert_eq!(
            store
                .count_outbox_with_status(OutboxStatus::Pending)
                .await
                .expect("count"),
            0
        );
        lease.release().await.expect("release");
    }

    #[tokio::test]
    async fn upsert_job_seeds_the_first_occurrence_and_rejects_bad_schedules() {
        use chrono::TimeZone;

        let (store, _dir) = open_store().await;
        let at = chrono::Utc
            .with_ymd_and_hms(2026, 3, 1, 12, 3, 0)
            .single()
            .expect("ts");

        super::upsert_job(&store, "sync-ledger", "*/5 * * * *", "ledger", None, at)
            .await
            .expect("upsert");
        let job = store
            .get_job("sync-ledger")
            .await
            .expect("get job")
            .expect("job exists");
        assert_eq!(
            job.next_due_time,
            chrono::Utc
                .with_ymd_and_hms(2026, 3, 1, 12, 5, 0)
                .single()
                .expect("ts")
        );

        let err = super::upsert_job(&store, "bad", "not cron", "ledger", None, at).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn sleep_is_bounded_by_the_next_event_and_the_polling_cap() {
        let now = Utc::now();
        let max = Duration::from_secs(30);

        let idle = SchedulerPass {
            jobs_materialized: 0,
            timers_enqueued: 0,
            runs_enqueued: 0,
            next_event_time: None,
        };
        assert_eq!(idle.sleep_duration(now, max), max);

        let soon = SchedulerPass {
            next_event_time: Some(now + ChronoDuration::seconds(5)),
            ..idle
        };
        let sleep = soon.sleep_duration(now, max);
        assert!(sleep <= Duration::from_secs(5));
        assert!(sleep >= Duration::from_secs(4));

        let overdue = SchedulerPass {
            next_event_time: Some(now - ChronoDuration::seconds(5)),
            ..idle
        };
        assert_eq!(overdue.sleep_duration(now, max), Duration::ZERO);
    }
}
