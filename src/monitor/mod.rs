//! Session monitors: remote log follow, resource telemetry, cost tracking

pub mod cost;
pub mod logs;
pub mod status;

pub use cost::{aggregate_burn, sample_cost, BurnSummary, CostMonitor};
pub use logs::{LogEvent, LogWatcher, WatchStop};
pub use status::{sample, ResourceSnapshot, SampleError, StatusMonitor};
