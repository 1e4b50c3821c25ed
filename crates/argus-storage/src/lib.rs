//! Argus Storage - persistence capabilities and the change-notification
//! bridge.
//!
//! The pipeline talks to storage exclusively through the repository traits
//! in [`repository`]. [`postgres`] adapts them onto a `PgPool`; [`memory`]
//! provides map-backed implementations with the same arbitration semantics
//! for tests and embedded runs. [`listener`] turns the `log_inserted`
//! notification channel into per-record callbacks.

pub mod listener;
pub mod memory;
pub mod postgres;
pub mod repository;

pub use listener::{ChangeListener, LogHandler, ProcessedSet};
pub use repository::{
    AlertRepository, ChannelRepository, DedupeOutcome, DedupeResult, LogQuery, LogRepository,
    MetricRepository, ProjectRepository, ServiceEdge, ServiceInfo, SpanRepository,
};
