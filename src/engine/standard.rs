//! Counter and summary aggregation over projected records

use crate::config::{ConfigError, MetricConfig};
use crate::engine::RecordSink;
use crate::exposition;
use crate::projector::{MetricKind, MetricSpec};
use crate::record::Record;
use crate::summary::SummaryVec;
use crate::time;
use prometheus::process_collector::ProcessCollector;
use prometheus::{CounterVec, Opts, Registry};
use std::collections::BTreeMap;

enum Aggregate {
    Counter(CounterVec),
    Summary(SummaryVec),
}

struct StandardMetric {
    spec: MetricSpec,
    aggregate: Aggregate,
}

/// The standard engine: a fixed set of named counter-vec / summary-vec
/// aggregates, each fed by its spec's admission gate and projection.
///
/// Every engine instance owns its registry -- there is no process-wide
/// default -- so several engines can coexist in one test process without
/// cross-contamination.
pub struct StandardEngine {
    registry: Registry,
    metrics: Vec<StandardMetric>,
    config: BTreeMap<String, MetricConfig>,
}

impl StandardEngine {
    /// Build an engine from the `metrics` configuration section. Metrics are
    /// registered in section order; an unknown metric type or invalid regex
    /// rejects the whole configuration.
    pub fn new(config: &BTreeMap<String, MetricConfig>) -> Result<StandardEngine, ConfigError> {
        let registry = Registry::new();
        registry.register(Box::new(ProcessCollector::for_self()))?;
        let mut metrics = Vec::with_capacity(config.len());
        for (name, metric_config) in config {
            let spec = MetricSpec::new(name, metric_config)?;
            let label_names = spec.projector.label_names();
            let aggregate = match spec.kind {
                MetricKind::Counter => {
                    let vec = CounterVec::new(Opts::new(name.clone(), name.clone()), &label_names)?;
                    registry.register(Box::new(vec.clone()))?;
                    Aggregate::Counter(vec)
                }
                MetricKind::Summary => Aggregate::Summary(SummaryVec::new(name, &label_names)),
            };
            metrics.push(StandardMetric { spec, aggregate });
        }
        Ok(StandardEngine {
            registry,
            metrics,
            config: config.clone(),
        })
    }

    /// Feed one record through every metric, stamped `now`. Exposed
    /// separately from [`StandardEngine::handle`] so tests can steer the
    /// clock.
    pub fn handle_at(&self, record: &Record, now: f64) {
        for metric in &self.metrics {
            if !metric.spec.projector.admit(record) {
                continue;
            }
            let value = match metric.spec.project_value(record) {
                Some(v) => v,
                None => continue,
            };
            let label_values = metric.spec.projector.label_values(record, false);
            match metric.aggregate {
                Aggregate::Counter(ref vec) => {
                    // counters are monotonic; the client panics on negative
                    // increments and handle must be total
                    if value < 0.0 {
                        trace!("dropping negative increment for {}", metric.spec.name);
                        continue;
                    }
                    let refs: Vec<&str> = label_values.iter().map(String::as_str).collect();
                    vec.with_label_values(&refs).inc_by(value);
                }
                Aggregate::Summary(ref vec) => {
                    vec.observe(label_values, value, now);
                }
            }
        }
    }

    /// Feed one record through every metric at the current time.
    pub fn handle(&self, record: &Record) {
        self.handle_at(record, time::now());
    }

    /// Render the full Prometheus text exposition: registry families
    /// (counters, process stats) followed by the summary families.
    pub fn exposition(&self) -> String {
        let now = time::now();
        let mut buf = exposition::registry_text(&self.registry);
        for metric in &self.metrics {
            if let Aggregate::Summary(ref vec) = metric.aggregate {
                vec.render(&mut buf, now);
            }
        }
        buf
    }

    /// The configured metrics section as pretty JSON, for `/config`.
    pub fn config_json(&self) -> String {
        serde_json::to_string_pretty(&self.config).unwrap_or_else(|_| "{}".to_string())
    }

    /// Gather the registry's metric families. Mostly useful to tests.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

impl RecordSink for StandardEngine {
    fn handle(&self, record: &Record) {
        StandardEngine::handle(self, record);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::parse_config;
    use crate::record::Record;

    fn engine(config: &str) -> StandardEngine {
        let config = parse_config(config).expect("config should parse");
        StandardEngine::new(&config.metrics).expect("engine should build")
    }

    fn counter_value(
        engine: &StandardEngine,
        name: &str,
        labels: &[(&str, &str)],
    ) -> Option<f64> {
        for family in engine.gather() {
            if family.get_name() != name {
                continue;
            }
            for metric in family.get_metric() {
                let pairs: Vec<(&str, &str)> = metric
                    .get_label()
                    .iter()
                    .map(|l| (l.get_name(), l.get_value()))
                    .collect();
                if pairs == labels {
                    return Some(metric.get_counter().get_value());
                }
            }
        }
        None
    }

    const BYTES_SENT: &str = r#"
{
  "metrics": {
    "bytes_sent": {
      "type": "counter",
      "value_source": "body_bytes_sent",
      "label_map": { "vhost": "vhost", "method": "method" },
      "if_match": { "uri": "^/api/" }
    }
  }
}
"#;

    fn api_record(bytes: &str) -> Record {
        Record::new()
            .insert("uri", "/api/x")
            .insert("vhost", "a")
            .insert("method", "GET")
            .insert("body_bytes_sent", bytes)
    }

    #[test]
    fn counter_with_predicate() {
        let engine = engine(BYTES_SENT);
        for _ in 0..3 {
            engine.handle_at(&api_record("100"), 0.0);
        }
        let web = Record::new()
            .insert("uri", "/web")
            .insert("vhost", "a")
            .insert("method", "GET")
            .insert("body_bytes_sent", "999");
        engine.handle_at(&web, 0.0);

        assert_eq!(
            counter_value(&engine, "bytes_sent", &[("method", "GET"), ("vhost", "a")]),
            Some(300.0)
        );
    }

    #[test]
    fn counter_skips_unparseable_and_negative() {
        let engine = engine(BYTES_SENT);
        engine.handle_at(&api_record("-"), 0.0);
        engine.handle_at(&api_record("12abc"), 0.0);
        engine.handle_at(&api_record("-5"), 0.0);
        // a missing value field is the same as unparseable
        let no_value = Record::new()
            .insert("uri", "/api/x")
            .insert("vhost", "a")
            .insert("method", "GET");
        engine.handle_at(&no_value, 0.0);
        assert_eq!(
            counter_value(&engine, "bytes_sent", &[("method", "GET"), ("vhost", "a")]),
            None
        );
        engine.handle_at(&api_record("7"), 0.0);
        assert_eq!(
            counter_value(&engine, "bytes_sent", &[("method", "GET"), ("vhost", "a")]),
            Some(7.0)
        );
    }

    const REQUEST_TIME: &str = r#"
{
  "metrics": {
    "request_time": {
      "type": "summary",
      "value_source": "request_time",
      "label_map": { "vhost": "vhost" }
    }
  }
}
"#;

    #[test]
    fn summary_quantile_sanity() {
        let engine = engine(REQUEST_TIME);
        for _ in 0..1000 {
            let rec = Record::new()
                .insert("vhost", "a")
                .insert("request_time", "0.1");
            engine.handle_at(&rec, 0.0);
        }
        let exposition = engine.exposition();
        assert!(exposition.contains(r#"request_time_count{vhost="a"} 1000"#));
        assert!(exposition.contains(r#"request_time{vhost="a",quantile="0.5"} 0.1"#));
        assert!(exposition.contains(r#"request_time{vhost="a",quantile="0.9"} 0.1"#));
        assert!(exposition.contains(r#"request_time{vhost="a",quantile="0.99"} 0.1"#));
    }

    #[test]
    fn unknown_kind_is_fatal() {
        let config = parse_config(
            r#"{ "metrics": { "m": { "type": "gauge", "value_source": "x" } } }"#,
        )
        .unwrap();
        assert!(StandardEngine::new(&config.metrics).is_err());
    }

    #[test]
    fn config_json_round_trips() {
        let engine = engine(BYTES_SENT);
        let parsed: serde_json::Value =
            serde_json::from_str(&engine.config_json()).expect("config_json should be JSON");
        assert_eq!(parsed["bytes_sent"]["type"], "counter");
    }

    #[test]
    fn engines_do_not_share_registries() {
        let one = engine(BYTES_SENT);
        let two = engine(BYTES_SENT);
        one.handle_at(&api_record("50"), 0.0);
        assert_eq!(
            counter_value(&two, "bytes_sent", &[("method", "GET"), ("vhost", "a")]),
            None
        );
    }
}
