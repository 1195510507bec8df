//! The two metric engines
//!
//! A record flows out of the file source and into every engine the running
//! mode carries. Engines are called concurrently from many tailer threads;
//! their `handle` is total -- a malformed line is skipped in whatever way is
//! local and cheap, and nothing is ever surfaced back to the producer.

use crate::record::Record;

pub mod standard;
pub mod unique;

pub use self::standard::StandardEngine;
pub use self::unique::{DistinctCounter, DistinctCounterMap, RateAlert, UniqueEngine};

/// Anything that consumes parsed log records. The file source is written
/// against this seam so engines and tests can stand on either side of it.
pub trait RecordSink: Send + Sync {
    /// Consume one record. Must not fail and must not block on I/O.
    fn handle(&self, record: &Record);
}
