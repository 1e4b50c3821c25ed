//! Argus Metrics - per-service tumbling-window aggregation

mod aggregator;

pub use aggregator::{MetricAggregator, WindowState};
