//! Labeled quantile summaries over rotating CKMS estimators
//!
//! The metrics registry this crate uses has counters and gauges but no
//! summary type, so summaries are built here on the CKMS streaming-quantile
//! estimator. Each labeled child keeps a small ring of estimators rotated on
//! a fixed cadence: observations enter every estimator, queries read the one
//! that has been accumulating the longest, and every rotation resets the
//! stalest estimator. The effect is a quantile view that covers at most the
//! configured max-age and at least max-age minus one rotation step.
//!
//! `_sum` and `_count` are lifetime totals, not windowed, matching the usual
//! client semantics.

use crate::constants;
use quantiles::ckms::CKMS;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// The quantiles a summary answers, with their permitted error.
pub const OBJECTIVES: &[(f64, f64)] = &[(0.5, 0.05), (0.9, 0.01), (0.99, 0.001)];

fn fresh_stream() -> CKMS<f64> {
    CKMS::new(constants::SUMMARY_ERROR)
}

/// One labeled child: the estimator ring plus lifetime totals.
struct AgedStream {
    streams: Vec<CKMS<f64>>,
    // index of the estimator that has accumulated the longest; the next to
    // be reset
    head: usize,
    last_rotate: f64,
    count: u64,
    sum: f64,
}

impl AgedStream {
    fn new(now: f64) -> AgedStream {
        AgedStream {
            streams: (0..constants::SUMMARY_AGE_BUCKETS).map(|_| fresh_stream()).collect(),
            head: 0,
            last_rotate: now,
            count: 0,
            sum: 0.0,
        }
    }

    fn maybe_rotate(&mut self, now: f64) {
        let step = constants::SUMMARY_MAX_AGE_SECS / constants::SUMMARY_AGE_BUCKETS as f64;
        if now - self.last_rotate < step {
            return;
        }
        let due = ((now - self.last_rotate) / step).floor() as usize;
        let n = self.streams.len();
        for _ in 0..due.min(n) {
            self.streams[self.head] = fresh_stream();
            self.head = (self.head + 1) % n;
        }
        self.last_rotate += step * due as f64;
    }

    fn observe(&mut self, value: f64, now: f64) {
        self.maybe_rotate(now);
        for stream in &mut self.streams {
            stream.insert(value);
        }
        self.count += 1;
        self.sum += value;
    }

    fn quantile(&mut self, q: f64, now: f64) -> Option<f64> {
        self.maybe_rotate(now);
        self.streams[self.head].query(q).map(|(_, v)| v)
    }
}

/// A labeled family of summaries, the moral equivalent of a registry
/// `SummaryVec`. Children come into being on first observation and live for
/// the process.
pub struct SummaryVec {
    name: String,
    label_names: Vec<String>,
    children: Mutex<BTreeMap<Vec<String>, AgedStream>>,
}

impl SummaryVec {
    /// Create a summary family named `name` over the given label vector.
    /// Label values handed to `observe` must line up with `label_names`.
    pub fn new(name: &str, label_names: &[&str]) -> SummaryVec {
        SummaryVec {
            name: name.to_string(),
            label_names: label_names.iter().map(|s| s.to_string()).collect(),
            children: Mutex::new(BTreeMap::new()),
        }
    }

    /// Observe `value` at `now` on the child identified by `label_values`.
    pub fn observe(&self, label_values: Vec<String>, value: f64, now: f64) {
        let mut children = self.children.lock().unwrap();
        children
            .entry(label_values)
            .or_insert_with(|| AgedStream::new(now))
            .observe(value, now);
    }

    /// Lifetime observation count for a child, `None` if the child has never
    /// been observed.
    pub fn sample_count(&self, label_values: &[&str]) -> Option<u64> {
        let children = self.children.lock().unwrap();
        let key: Vec<String> = label_values.iter().map(|s| s.to_string()).collect();
        children.get(&key).map(|child| child.count)
    }

    /// Query a quantile on a child. `None` when the child is unknown or its
    /// window holds no observations.
    pub fn quantile(&self, label_values: &[&str], q: f64, now: f64) -> Option<f64> {
        let mut children = self.children.lock().unwrap();
        let key: Vec<String> = label_values.iter().map(|s| s.to_string()).collect();
        children.get_mut(&key).and_then(|child| child.quantile(q, now))
    }

    /// Append this family to `buf` in the Prometheus text format: one
    /// series per (child, objective) plus `_sum` and `_count` per child.
    /// Children with an empty window render `NaN` quantiles, as the
    /// reference clients do.
    pub fn render(&self, buf: &mut String, now: f64) {
        buf.push_str("# HELP ");
        buf.push_str(&self.name);
        buf.push(' ');
        buf.push_str(&self.name);
        buf.push('\n');
        buf.push_str("# TYPE ");
        buf.push_str(&self.name);
        buf.push_str(" summary\n");
        let mut children = self.children.lock().unwrap();
        for (label_values, child) in children.iter_mut() {
            for &(q, _) in OBJECTIVES {
                buf.push_str(&self.name);
                buf.push('{');
                for (label, value) in self.label_names.iter().zip(label_values) {
                    buf.push_str(label);
                    buf.push_str("=\"");
                    push_escaped(buf, value);
                    buf.push_str("\",");
                }
                buf.push_str("quantile=\"");
                buf.push_str(&q.to_string());
                buf.push_str("\"} ");
                match child.quantile(q, now) {
                    Some(v) => buf.push_str(&v.to_string()),
                    None => buf.push_str("NaN"),
                }
                buf.push('\n');
            }
            self.render_series(buf, "_sum", label_values, &child.sum.to_string());
            self.render_series(buf, "_count", label_values, &child.count.to_string());
        }
    }

    fn render_series(&self, buf: &mut String, suffix: &str, label_values: &[String], value: &str) {
        buf.push_str(&self.name);
        buf.push_str(suffix);
        if !self.label_names.is_empty() {
            buf.push('{');
            for (i, (label, lv)) in self.label_names.iter().zip(label_values).enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                buf.push_str(label);
                buf.push_str("=\"");
                push_escaped(buf, lv);
                buf.push('"');
            }
            buf.push('}');
        }
        buf.push(' ');
        buf.push_str(value);
        buf.push('\n');
    }
}

fn push_escaped(buf: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '\\' => buf.push_str("\\\\"),
            '"' => buf.push_str("\\\""),
            '\n' => buf.push_str("\\n"),
            _ => buf.push(c),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn count_and_quantiles_track_observations() {
        let summary = SummaryVec::new("request_time", &["vhost"]);
        for _ in 0..1000 {
            summary.observe(vec!["a".to_string()], 0.1, 0.0);
        }
        assert_eq!(summary.sample_count(&["a"]), Some(1000));
        for &(q, _) in OBJECTIVES {
            let v = summary.quantile(&["a"], q, 1.0).expect("quantile should answer");
            assert!((v - 0.1).abs() < 1e-9, "q{} came back {}", q, v);
        }
        assert_eq!(summary.sample_count(&["b"]), None);
    }

    #[test]
    fn children_are_distinct_per_label_tuple() {
        let summary = SummaryVec::new("request_time", &["vhost"]);
        summary.observe(vec!["a".to_string()], 1.0, 0.0);
        summary.observe(vec!["b".to_string()], 9.0, 0.0);
        let qa = summary.quantile(&["a"], 0.5, 0.0).unwrap();
        let qb = summary.quantile(&["b"], 0.5, 0.0).unwrap();
        assert!((qa - 1.0).abs() < 1e-9);
        assert!((qb - 9.0).abs() < 1e-9);
    }

    #[test]
    fn window_expires_old_observations() {
        let summary = SummaryVec::new("request_time", &["vhost"]);
        summary.observe(vec!["a".to_string()], 0.5, 0.0);
        // well past max-age every estimator has rotated out
        let gone = summary.quantile(&["a"], 0.5, crate::constants::SUMMARY_MAX_AGE_SECS * 2.0);
        assert_eq!(gone, None);
        // lifetime count is unaffected by expiry
        assert_eq!(summary.sample_count(&["a"]), Some(1));
    }

    #[test]
    fn render_emits_prometheus_text() {
        let summary = SummaryVec::new("request_time", &["status", "vhost"]);
        summary.observe(vec!["200".to_string(), "a".to_string()], 0.1, 0.0);
        let mut buf = String::new();
        summary.render(&mut buf, 0.0);
        assert!(buf.contains("# TYPE request_time summary\n"));
        assert!(buf.contains(r#"request_time{status="200",vhost="a",quantile="0.5"} 0.1"#));
        assert!(buf.contains(r#"request_time_sum{status="200",vhost="a"} 0.1"#));
        assert!(buf.contains(r#"request_time_count{status="200",vhost="a"} 1"#));
    }

    #[test]
    fn render_escapes_label_values() {
        let summary = SummaryVec::new("s", &["ua"]);
        summary.observe(vec!["quote\" back\\slash".to_string()], 1.0, 0.0);
        let mut buf = String::new();
        summary.render(&mut buf, 0.0);
        assert!(buf.contains(r#"ua="quote\" back\\slash""#));
    }

    #[test]
    fn unlabeled_summary_renders_bare_series() {
        let summary = SummaryVec::new("s", &[]);
        summary.observe(vec![], 2.0, 0.0);
        let mut buf = String::new();
        summary.render(&mut buf, 0.0);
        assert!(buf.contains("s_sum 2\n"));
        assert!(buf.contains("s_count 1\n"));
    }
}
