//! Argus Common - shared types and utilities for the Argus observability core

pub mod clock;
pub mod config;
pub mod error;
pub mod retry;
pub mod stats;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
