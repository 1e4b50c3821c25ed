//! Argus Alerts - deduplication, rate limiting, batching and delivery

mod dedupe;
mod dispatcher;
mod sink;

pub use dedupe::AlertDeduper;
pub use dispatcher::AlertDispatcher;
pub use sink::{HttpSinkRouter, SinkRouter};
