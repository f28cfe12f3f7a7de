//! Metrics plumbing for the conveyor workspace.
//!
//! A thin client over the OpenTelemetry SDK: cached counters and histograms,
//! a drop-to-record duration timer, and tag validation. Consumers declare
//! their metric names as constants next to the code that emits them.

mod metrics;

pub use metrics::MetricsClient;
pub use metrics::MetricsConfig;
pub use metrics::MetricsError;
pub use metrics::MetricsExporter;
pub use metrics::Result;
pub use metrics::timer::Timer;
