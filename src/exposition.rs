//! Rendering helpers for the HTTP surface
//!
//! The engines own their aggregates; this module turns them into bytes. The
//! text side is the Prometheus exposition format, the JSON side carries the
//! unique engine's introspection snapshot.

use crate::cache::CacheEntry;
use prometheus::{Encoder, Registry, TextEncoder};
use std::collections::BTreeMap;

/// Content type of the Prometheus text exposition.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Content type of the JSON surfaces (`/config`, `/inspect`).
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Encode a registry's families into exposition text. Encoding failures
/// cannot reasonably happen writing to a `Vec` but are logged rather than
/// propagated; a scrape answering short beats a scrape answering 500.
pub fn registry_text(registry: &Registry) -> String {
    let mut buffer = Vec::with_capacity(1024);
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        error!("could not encode registry: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Serialize an introspection snapshot -- label-tuple-key to identity to
/// entry -- as pretty JSON.
pub fn snapshot_json(snapshot: &BTreeMap<String, BTreeMap<String, CacheEntry>>) -> String {
    serde_json::to_string_pretty(snapshot).unwrap_or_else(|_| "{}".to_string())
}
