//! Compiled metric descriptors and record projection
//!
//! Configuration arrives as plain JSON maps. Before any log line flows the
//! maps are compiled into immutable specs: regexes built, label vectors
//! sorted, identity sources split. Both engines then share one admission and
//! projection path -- the `Projector` -- so a record is judged the same way
//! no matter which engine is asking.

use crate::config::{ConfigError, DistinctConfig, MetricConfig};
use crate::record::Record;
use regex::Regex;
use std::collections::BTreeMap;

/// The aggregation a standard metric performs.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum MetricKind {
    /// Monotonic labeled counter; `value_source` is added per record.
    Counter,
    /// Labeled quantile summary; `value_source` is observed per record.
    Summary,
}

/// Applies a spec's `if_match` gate and projects a `Record` onto the spec's
/// label vector. Label names are held sorted so that the label vector handed
/// to the metric registry and the label-tuple-key are built in the same
/// order, always.
#[derive(Debug)]
pub struct Projector {
    if_match: Vec<(String, Regex)>,
    // (output label, input field), sorted by output label
    label_map: Vec<(String, String)>,
}

impl Projector {
    /// Compile a projector from the raw `label_map` / `if_match` sections.
    /// An invalid regex fails the whole configuration.
    pub fn new(
        label_map: &BTreeMap<String, String>,
        if_match: &BTreeMap<String, String>,
    ) -> Result<Projector, ConfigError> {
        let mut gates = Vec::with_capacity(if_match.len());
        for (field, pattern) in if_match {
            gates.push((field.clone(), Regex::new(pattern)?));
        }
        // BTreeMap iteration is already sorted by output label.
        let label_map = label_map
            .iter()
            .map(|(out, src)| (out.clone(), src.clone()))
            .collect();
        Ok(Projector {
            if_match: gates,
            label_map,
        })
    }

    /// True iff every `if_match` regex finds a match in its field. Missing
    /// fields read as empty strings; an empty gate admits everything.
    pub fn admit(&self, record: &Record) -> bool {
        self.if_match
            .iter()
            .all(|&(ref field, ref re)| re.is_match(record.get(field)))
    }

    /// The output label names, sorted. This is the label vector the
    /// underlying aggregate is registered with.
    pub fn label_names(&self) -> Vec<&str> {
        self.label_map.iter().map(|&(ref out, _)| out.as_str()).collect()
    }

    /// Project the record onto the label vector, in `label_names` order.
    /// The unique engine trims label values; the standard engine does not,
    /// preserving exposition fidelity with the raw log.
    pub fn label_values(&self, record: &Record, trim: bool) -> Vec<String> {
        self.label_map
            .iter()
            .map(|&(_, ref src)| {
                let v = record.get(src);
                if trim { v.trim().to_string() } else { v.to_string() }
            })
            .collect()
    }
}

/// Build the canonical string key for a (metric, label values) pair.
///
/// The key is the metric name followed by `#label#value` for each label in
/// sorted label order. Both construction sites -- counter lookup and counter
/// creation -- go through this function, which is what makes the key
/// deterministic under any `label_map` iteration order.
pub fn label_tuple_key(name: &str, label_names: &[&str], label_values: &[String]) -> String {
    let mut key = String::with_capacity(name.len() + 16 * label_names.len());
    key.push_str(name);
    for (label, value) in label_names.iter().zip(label_values) {
        key.push('#');
        key.push_str(label);
        key.push('#');
        key.push_str(value);
    }
    key
}

/// An immutable standard-metric descriptor: one counter or summary fed from
/// a numeric log field.
#[derive(Debug)]
pub struct MetricSpec {
    /// Metric name, usable as a Prometheus metric name.
    pub name: String,
    /// Counter or summary.
    pub kind: MetricKind,
    /// Field whose value is parsed as a double.
    pub value_source: String,
    /// Shared admission / projection state.
    pub projector: Projector,
}

impl MetricSpec {
    /// Compile a `MetricSpec` from its configuration. Unknown `type` values
    /// reject the configuration.
    pub fn new(name: &str, config: &MetricConfig) -> Result<MetricSpec, ConfigError> {
        let kind = match config.kind.as_str() {
            "counter" => MetricKind::Counter,
            "summary" => MetricKind::Summary,
            other => {
                return Err(ConfigError::UnknownKind {
                    metric: name.to_string(),
                    kind: other.to_string(),
                })
            }
        };
        Ok(MetricSpec {
            name: name.to_string(),
            kind,
            value_source: config.value_source.clone(),
            projector: Projector::new(&config.label_map, &config.if_match)?,
        })
    }

    /// Parse the record's value field as a double. Unparseable or missing
    /// values drop the sample with a `None`.
    pub fn project_value(&self, record: &Record) -> Option<f64> {
        record.get(&self.value_source).parse::<f64>().ok()
    }
}

/// An immutable unique-metric descriptor: a sliding-window distinct counter
/// over an identity built from one or more fields.
#[derive(Debug)]
pub struct DistinctSpec {
    /// Metric name, usable as a Prometheus metric name.
    pub name: String,
    /// Fields concatenated into the identity string.
    pub value_sources: Vec<String>,
    /// Sliding window, in seconds.
    pub time_window: f64,
    /// When present, arrival rates at or above this many events per second
    /// fire the engine's notify callback.
    pub notify_rate_threshold: Option<f64>,
    /// Shared admission / projection state.
    pub projector: Projector,
}

impl DistinctSpec {
    /// Compile a `DistinctSpec` from its configuration.
    pub fn new(name: &str, config: &DistinctConfig) -> Result<DistinctSpec, ConfigError> {
        let value_sources = config
            .value_source
            .split(',')
            .map(|s| s.trim().to_string())
            .collect();
        Ok(DistinctSpec {
            name: name.to_string(),
            value_sources,
            time_window: config.time_window as f64,
            notify_rate_threshold: config.notify_rate_threshold,
            projector: Projector::new(&config.label_map, &config.if_match)?,
        })
    }

    /// Build the identity string: `#` followed by the trimmed value of each
    /// source field, in configured order.
    ///
    /// Returns `None` when every component is empty after trimming -- a
    /// record with no identity is not counted. Note the encoding is not
    /// injective across field splits (`["a","b"]` and `["","a#b"]` collide);
    /// it is kept as-is for compatibility with existing dashboards.
    pub fn project_identity(&self, record: &Record) -> Option<String> {
        let mut id = String::with_capacity(32);
        for src in &self.value_sources {
            id.push('#');
            id.push_str(record.get(src).trim());
        }
        if id.len() > self.value_sources.len() {
            Some(id)
        } else {
            None
        }
    }
}
