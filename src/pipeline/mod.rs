//! Pipeline execution: single ticks and the long-running scheduler.

mod scheduler;
mod tick;

pub use scheduler::{DaemonSummary, PipelineStatus, PipelineSummary, collect_status, run};
pub use tick::{Pipeline, TickOutcome};
