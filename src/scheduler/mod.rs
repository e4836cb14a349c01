pub mod context;
pub(crate) mod executor;
pub mod metrics;

pub use context::SchedulerContext;
pub use metrics::ExecutorMetrics;
