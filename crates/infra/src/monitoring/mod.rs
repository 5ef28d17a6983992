//! Monitoring: read-only aggregation over jobs, queues, servers and counters.

mod api;
mod dto;

pub use api::{MonitoringApi, RECURRING_JOBS_SET, daily_stats_key, hourly_stats_key};
pub use dto::*;
