//! Argus Processor - wires ingestion, aggregation, detection and dispatch
//! into the running pipeline

mod processor;

pub use processor::{start_postgres_processor, Processor, ProcessorDeps};
