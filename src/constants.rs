//! Library level constants

/// Hard capacity of each unique counter's cache. Past this many distinct
/// identities per label tuple the least-recently-seen identity is evicted
/// silently, making the distinct count approximate.
pub const UNIQUE_CACHE_CAPACITY: usize = 1024;

/// Maximum age of an observation that may still influence a summary
/// quantile, in seconds.
pub const SUMMARY_MAX_AGE_SECS: f64 = 600.0;

/// Number of staggered buckets a summary rotates through across
/// `SUMMARY_MAX_AGE_SECS`.
pub const SUMMARY_AGE_BUCKETS: usize = 5;

/// Error bound handed to the CKMS estimator backing summaries. 0.001 is the
/// tightest of the configured objectives (the p99 one).
pub const SUMMARY_ERROR: f64 = 0.001;

/// HTTP port for standard mode.
pub const STANDARD_PORT: u16 = 9802;

/// HTTP port for unique mode.
pub const UNIQUE_PORT: u16 = 9803;

/// HTTP port for the NEL / CSP report collector.
pub const REPORT_PORT: u16 = 10666;

/// Seconds between glob re-evaluations in standard mode.
pub const STANDARD_DISCOVER_INTERVAL_SECS: u64 = 10;

/// Seconds between glob re-evaluations in unique mode.
pub const UNIQUE_DISCOVER_INTERVAL_SECS: u64 = 60;

/// Seconds between purge passes over the unique counters.
pub const PURGE_INTERVAL_SECS: u64 = 10;

/// Seconds an `/inspect/wait` request will block for an alert before giving
/// up and answering anyway.
pub const WAIT_TIMEOUT_SECS: u64 = 30;

/// Largest NEL / CSP report body accepted, in bytes.
pub const MAX_REPORT_BYTES: usize = 100_000;

/// Longest `context` query parameter accepted on a report upload.
pub const MAX_CONTEXT_CHARS: usize = 64;

/// Maximum lines read from one file before the poll loop moves on to the
/// next, keeping busy files from starving quiet ones.
pub const MAX_LINES_READ: usize = 10_000;
