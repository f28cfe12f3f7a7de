//! Dispatch loops and policy for the conveyor work-dispatch core.
//!
//! `conveyor-state` owns the rows; this crate owns everything that moves
//! them: the lease keeper, the exactly-once executor, the cron scheduler,
//! the multi-store router, and the dispatcher loops that claim batches and
//! run handlers.

mod clock;
mod config;
mod cron_spec;
mod discovery;
mod dispatcher;
mod events;
mod executor;
mod handler;
mod join;
mod lease;
mod router;
mod scheduler;
mod sweeper;
mod util;

pub use clock::Clock;
pub use clock::SystemClock;
pub use config::DispatchConfig;
pub use cron_spec::CronSpec;
pub use discovery::StaticDiscovery;
pub use discovery::StoreDescriptor;
pub use discovery::StoreDiscovery;
pub use dispatcher::Dispatcher;
pub use dispatcher::DispatcherHandle;
pub use dispatcher::INBOX_SCOPE;
pub use dispatcher::OUTBOX_SCOPE;
pub use events::DispatchEvent;
pub use events::EventEmitter;
pub use events::TracingEmitter;
pub use executor::EffectProbe;
pub use executor::ExactlyOnceExecutor;
pub use executor::ExecutionOutcome;
pub use handler::Handler;
pub use handler::HandlerContext;
pub use handler::HandlerOutcome;
pub use handler::HandlerRegistry;
pub use join::JOIN_WAIT_TOPIC;
pub use join::JoinContinuation;
pub use join::JoinVerdict;
pub use join::JoinWaitHandler;
pub use join::JoinWaitRequest;
pub use join::default_join_policy;
pub use join::start_join_wait;
pub use lease::LeaseHandle;
pub use router::Router;
pub use router::StoreEntry;
pub use scheduler::SCHEDULER_SCOPE;
pub use scheduler::Scheduler;
pub use scheduler::SchedulerPass;
pub use scheduler::upsert_job;
pub use util::retry_backoff;

/// Handler invocations by terminal result. Tags: [topic, result]
pub const METRIC_HANDLER_RESULT: &str = "conveyor.dispatch.handler_result";
/// Scope leases granted. Tags: [scope]
pub const METRIC_LEASE_ACQUIRED: &str = "conveyor.lease.acquired";
/// Scope leases lost before release. Tags: [scope]
pub const METRIC_LEASE_LOST: &str = "conveyor.lease.lost";
/// Rows materialized by the scheduler. Tags: [kind]
pub const METRIC_SCHEDULER_MATERIALIZED: &str = "conveyor.scheduler.materialized";
