//! A module for caches
//!
//! The unique engine's whole trick is a map of bounded caches. The cache
//! flavor it needs -- recency ordered, capacity bounded, purgeable by age --
//! lives here, one per label tuple.

pub mod windowed;

pub use self::windowed::{CacheEntry, WindowedLru};
