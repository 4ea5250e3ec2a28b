//! Utilities Module - shared infrastructure
//!
//! - `constants`: Centralized timeouts, defaults and limits
//! - `paths`: Path normalization with `~` expansion and absolutizing

pub mod constants;
pub mod paths;

// Re-export public items
pub use constants::{
    CONNECT_TIMEOUT, DEFAULT_ARRAY_WALLTIME, DEFAULT_POLL_INTERVAL, DEFAULT_SINGLE_WALLTIME,
    DEFAULT_WAIT_TIMEOUT, NOTIFY_TIMEOUT,
};
pub use paths::{abspath, normpath};
