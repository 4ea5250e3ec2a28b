//! Completion Watcher - marker-file ("semaphore") polling
//!
//! A spawned task signals completion by creating a marker file. The watcher
//! polls for the existence of every expected marker and returns as soon as all
//! of them have been observed, or fails once the timeout has elapsed.
//!
//! Marker content is the wrapped command's exit code as ASCII text, appended
//! by the job script. Only existence matters for completion; the exit code is
//! read afterwards with [`read_exit_code`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::{BatchError, Result};
use crate::util::{DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_TIMEOUT};

/// Polling parameters for [`wait_for_markers`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    /// Give up once this much wall-clock time has elapsed
    pub timeout: Duration,
    /// Sleep between two full passes over the pending markers
    pub poll_interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl WaitOptions {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Marker path for a single task: `{workdir}/{task_id}.done`
pub fn single_marker(workdir: &Path, task_id: &str) -> PathBuf {
    workdir.join(format!("{}.done", task_id))
}

/// Marker path for one element of an array: `{workdir}/{batch_id}_{index}.done`
pub fn array_marker(workdir: &Path, batch_id: &str, index: usize) -> PathBuf {
    workdir.join(format!("{}_{}.done", batch_id, index))
}

/// Wait until every marker exists.
///
/// The caller's slice is copied before polling starts. Markers that already
/// exist are consumed on the first pass without sleeping.
pub async fn wait_for_markers(markers: &[PathBuf], options: &WaitOptions) -> Result<()> {
    let start = Instant::now();
    let mut pending: Vec<PathBuf> = markers.to_vec();

    loop {
        let mut still_pending = Vec::with_capacity(pending.len());
        for marker in pending {
            if tokio::fs::try_exists(&marker).await? {
                debug!(marker = %marker.display(), "marker observed");
            } else {
                still_pending.push(marker);
            }
        }
        pending = still_pending;

        if pending.is_empty() {
            return Ok(());
        }

        let elapsed = start.elapsed();
        if elapsed >= options.timeout {
            return Err(BatchError::Timeout {
                missing: pending,
                waited_secs: elapsed.as_secs(),
            });
        }

        debug!(
            pending = pending.len(),
            elapsed_secs = elapsed.as_secs(),
            "waiting for markers"
        );
        let remaining = options.timeout - elapsed;
        tokio::time::sleep(options.poll_interval.min(remaining)).await;
    }
}

/// Read the exit code recorded in a marker (its last non-empty line)
pub async fn read_exit_code(marker: &Path) -> Result<i32> {
    let content = tokio::fs::read_to_string(marker).await?;
    parse_exit_code(&content).ok_or_else(|| BatchError::InvalidMarker {
        path: marker.to_path_buf(),
        content,
    })
}

fn parse_exit_code(content: &str) -> Option<i32> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()?
        .parse()
        .ok()
}

/// Write (append) an exit code to a marker, the way job scripts do
pub async fn write_exit_code(marker: &Path, code: i32) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(marker)
        .await?;
    file.write_all(format!("{}\n", code).as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
