//! Constants for the execution engine (timeouts, attempt ceiling, backoff).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large blobs).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Default attempt ceiling per command, including the first attempt.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default base delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Default cap on the computed backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Default upper bound on random jitter added to each delay.
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(100);

/// Maximum honored Retry-After value.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(120);

/// Default number of commands allowed to run their attempt loop at once.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Largest error body prefix read for classification.
pub const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Budget for reading an error body when no per-attempt timeout is set.
pub const ERROR_BODY_READ_TIMEOUT: Duration = Duration::from_secs(30);
