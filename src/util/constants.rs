//! Centralized constants for batchpipe runtime configuration
//!
//! All timeout and limit values in one place for easy tuning.

use std::time::Duration;

// ═══════════════════════════════════════════════════════════════
// Completion Watcher
// ═══════════════════════════════════════════════════════════════

/// Delay between two passes over the pending marker files
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Effectively unbounded wait (about 13.8 billion years)
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(435_400_000_000_000_000);

// ═══════════════════════════════════════════════════════════════
// Batch queue resources
// ═══════════════════════════════════════════════════════════════

/// Walltime requested for a single job
pub const DEFAULT_SINGLE_WALLTIME: &str = "00:05:00";

/// Walltime requested for each element of an array job
pub const DEFAULT_ARRAY_WALLTIME: &str = "01:00:00";

/// Exit status of the executor script when asked for an index it does not know
pub const UNKNOWN_INDEX_EXIT: i32 = 64;

// ═══════════════════════════════════════════════════════════════
// Pipeline tracking service
// ═══════════════════════════════════════════════════════════════

/// Timeout for a single request to the tracking service
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for establishing HTTP connections
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Environment variable overriding `notification_url`
pub const NOTIFICATION_URL_ENV: &str = "BATCHPIPE_NOTIFICATION_URL";

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════
