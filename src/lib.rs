//! Sawmill is a log-tailing telemetry agent. It follows a set of append-only
//! JSON log files -- the kind an HTTP front-end produces -- pulls structured
//! fields out of each line and exposes derived signals over an HTTP scrape
//! endpoint in the Prometheus text format. Sawmill has minimal CPU and memory
//! requirements and is intended to sit next to busy front-ends without
//! getting in their way.
//!
//! Why you might choose to use sawmill:
//!
//!  * You want counters and quantile summaries computed from log fields,
//!    gated by regex predicates, without touching the front-end.
//!  * You want sliding-window approximate distinct counts -- "how many unique
//!    clients in the last minute, per vhost" -- with rate alerting.
//!  * You want NEL / CSP violation reports collected into rotating JSONL
//!    files.
#![allow(unknown_lints)]
#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

#[macro_use]
extern crate log;

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate serde_json;

pub mod cache;
pub mod config;
pub mod constants;
pub mod engine;
pub mod exposition;
pub mod http;
pub mod projector;
pub mod record;
pub mod report;
pub mod source;
pub mod summary;
pub mod time;
