//! Sliding-window approximate distinct counting
//!
//! The unique engine keeps, per label tuple, a bounded recency-ordered cache
//! of identity strings. The cache length -- how many distinct identities were
//! seen recently -- is mirrored into a gauge on every touch and every purge.
//! Producers, the purger and the scraper all run concurrently; the locking
//! here is the load-bearing part. Two levels: a readers-writer lock over the
//! counter map, and one mutex per counter. The map lock is never held while
//! a counter lock is taken, so a long purge pass cannot starve producers on
//! unrelated counters.

use crate::cache::{CacheEntry, WindowedLru};
use crate::config::{ConfigError, DistinctConfig};
use crate::constants;
use crate::engine::RecordSink;
use crate::exposition;
use crate::projector::{label_tuple_key, DistinctSpec};
use crate::record::Record;
use crate::time;
use prometheus::process_collector::ProcessCollector;
use prometheus::{GaugeVec, Opts, Registry};
use seahash::SeaHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasherDefault;
use std::sync::{Arc, Mutex, RwLock};

type HashMapSea<K, V> = HashMap<K, V, BuildHasherDefault<SeaHasher>>;

/// The gauge-update capability a counter carries. Injected at creation so
/// the counter never couples to the metric library's handle type and tests
/// can pass an in-memory stub.
pub type SetGauge = Box<dyn Fn(f64) + Send + Sync>;

/// The callback invoked when an identity's arrival rate crosses its spec's
/// threshold. Must return promptly; the engine calls it inline.
pub type NotifyFn = Box<dyn Fn(&RateAlert) + Send + Sync>;

/// Everything a rate alert knows about itself.
#[derive(PartialEq, Debug, Clone)]
pub struct RateAlert {
    /// The unique metric that fired.
    pub metric: String,
    /// The offending identity string.
    pub id: String,
    /// Label name / value pairs of the counter, in sorted label order.
    pub labels: Vec<(String, String)>,
    /// Observed arrival rate in events per second.
    pub rate: f64,
}

/// One distinct counter: a windowed cache plus the gauge that mirrors its
/// length. Counters are created lazily and never destroyed; an emptied
/// counter's gauge simply reads 0.
pub struct DistinctCounter {
    window: f64,
    lru: Mutex<WindowedLru>,
    set_gauge: SetGauge,
}

impl DistinctCounter {
    fn new(window: f64, set_gauge: SetGauge) -> DistinctCounter {
        DistinctCounter {
            window,
            lru: Mutex::new(WindowedLru::new(constants::UNIQUE_CACHE_CAPACITY)),
            set_gauge,
        }
    }

    /// Record an observation and mirror the new distinct count into the
    /// gauge. Returns a copy of the cache entry for rate accounting.
    pub fn observe(&self, id: &str, now: f64) -> CacheEntry {
        let mut lru = self.lru.lock().unwrap();
        let entry = lru.add_or_update(id, now);
        (self.set_gauge)(lru.len() as f64);
        entry
    }

    /// Expire identities older than this counter's window and re-assert the
    /// gauge. Returns how many identities were dropped.
    pub fn purge(&self, now: f64) -> usize {
        let mut lru = self.lru.lock().unwrap();
        let removed = lru.purge(now, self.window);
        (self.set_gauge)(lru.len() as f64);
        removed
    }

    /// Current distinct count.
    pub fn len(&self) -> usize {
        self.lru.lock().unwrap().len()
    }

    fn snapshot(&self) -> BTreeMap<String, CacheEntry> {
        let lru = self.lru.lock().unwrap();
        lru.entries()
            .map(|(id, entry)| (id.clone(), *entry))
            .collect()
    }
}

/// Concurrent mapping from label-tuple-key to its counter.
#[derive(Default)]
pub struct DistinctCounterMap {
    inner: RwLock<HashMapSea<String, Arc<DistinctCounter>>>,
}

impl DistinctCounterMap {
    /// Create an empty map.
    pub fn new() -> DistinctCounterMap {
        Default::default()
    }

    /// Look a counter up by key.
    pub fn get(&self, key: &str) -> Option<Arc<DistinctCounter>> {
        let inner = self.inner.read().unwrap();
        inner.get(key).cloned()
    }

    /// Fetch the counter for `key`, creating it -- and its gauge handle, via
    /// `gauge_factory` -- if this is the first admission for the key.
    /// Exactly one counter ever exists per key, no matter how many producers
    /// race here.
    pub fn get_or_create<F>(&self, key: &str, window: f64, gauge_factory: F) -> Arc<DistinctCounter>
    where
        F: FnOnce() -> SetGauge,
    {
        if let Some(counter) = self.get(key) {
            return counter;
        }
        let mut inner = self.inner.write().unwrap();
        Arc::clone(
            inner
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(DistinctCounter::new(window, gauge_factory()))),
        )
    }

    /// Snapshot of the live keys.
    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner.keys().cloned().collect()
    }

    /// Snapshot of the live (key, counter) pairs.
    pub fn counters(&self) -> Vec<(String, Arc<DistinctCounter>)> {
        let inner = self.inner.read().unwrap();
        inner
            .iter()
            .map(|(key, counter)| (key.clone(), Arc::clone(counter)))
            .collect()
    }

    /// Number of live counters.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    /// True when no counter has been created yet.
    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }

    /// Purge every counter against its own window. The counter list is
    /// snapshotted under the map lock and the lock released before any
    /// counter lock is taken.
    pub fn purge_all(&self, now: f64) {
        let counters = self.counters();
        for (key, counter) in counters {
            let removed = counter.purge(now);
            if removed > 0 {
                debug!("purged {} identities from {}", removed, key);
            }
        }
    }
}

struct UniqueMetric {
    spec: DistinctSpec,
    gauges: GaugeVec,
}

/// The unique engine: orchestrates lazy counter creation, rate alerting,
/// periodic purge and introspection over a `DistinctCounterMap`.
pub struct UniqueEngine {
    registry: Registry,
    metrics: Vec<UniqueMetric>,
    counters: DistinctCounterMap,
    notify: Option<NotifyFn>,
    config: BTreeMap<String, DistinctConfig>,
}

impl UniqueEngine {
    /// Build an engine from the `unique` configuration section, without a
    /// notify callback.
    pub fn new(config: &BTreeMap<String, DistinctConfig>) -> Result<UniqueEngine, ConfigError> {
        UniqueEngine::build(config, None)
    }

    /// Build an engine that invokes `notify` for every rate alert.
    pub fn with_notify(
        config: &BTreeMap<String, DistinctConfig>,
        notify: NotifyFn,
    ) -> Result<UniqueEngine, ConfigError> {
        UniqueEngine::build(config, Some(notify))
    }

    fn build(
        config: &BTreeMap<String, DistinctConfig>,
        notify: Option<NotifyFn>,
    ) -> Result<UniqueEngine, ConfigError> {
        let registry = Registry::new();
        registry.register(Box::new(ProcessCollector::for_self()))?;
        let mut metrics = Vec::with_capacity(config.len());
        for (name, distinct_config) in config {
            let spec = DistinctSpec::new(name, distinct_config)?;
            let label_names = spec.projector.label_names();
            let gauges = GaugeVec::new(Opts::new(name.clone(), name.clone()), &label_names)?;
            registry.register(Box::new(gauges.clone()))?;
            metrics.push(UniqueMetric { spec, gauges });
        }
        Ok(UniqueEngine {
            registry,
            metrics,
            counters: DistinctCounterMap::new(),
            notify,
            config: config.clone(),
        })
    }

    /// Feed one record through every unique metric, stamped `now`. Exposed
    /// separately from [`UniqueEngine::handle`] so tests can steer the
    /// clock.
    pub fn handle_at(&self, record: &Record, now: f64) {
        for metric in &self.metrics {
            if !metric.spec.projector.admit(record) {
                continue;
            }
            let id = match metric.spec.project_identity(record) {
                Some(id) => id,
                None => continue,
            };
            let label_values = metric.spec.projector.label_values(record, true);
            let label_names = metric.spec.projector.label_names();
            let key = label_tuple_key(&metric.spec.name, &label_names, &label_values);
            let counter = self.counters.get_or_create(&key, metric.spec.time_window, || {
                let refs: Vec<&str> = label_values.iter().map(String::as_str).collect();
                let gauge = metric.gauges.with_label_values(&refs);
                Box::new(move |v| gauge.set(v))
            });
            let entry = counter.observe(&id, now);
            if let Some(threshold) = metric.spec.notify_rate_threshold {
                if entry.last > entry.first {
                    let rate = entry.count as f64 / (entry.last - entry.first);
                    debug!(
                        "{}: {} occurrences of {} over {:.3}s ({:.3}/s)",
                        metric.spec.name,
                        entry.count,
                        id,
                        entry.last - entry.first,
                        rate
                    );
                    if rate >= threshold {
                        warn!(
                            "high arrival rate on {}: id {} at {:.1}/s",
                            metric.spec.name, id, rate
                        );
                        if let Some(ref notify) = self.notify {
                            let labels = label_names
                                .iter()
                                .map(|name| name.to_string())
                                .zip(label_values.iter().cloned())
                                .collect();
                            notify(&RateAlert {
                                metric: metric.spec.name.clone(),
                                id: id.clone(),
                                labels,
                                rate,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Feed one record through every unique metric at the current time.
    pub fn handle(&self, record: &Record) {
        self.handle_at(record, time::now());
    }

    /// Expire stale identities from every counter and re-assert every gauge.
    /// Safe to run concurrently with `handle`.
    pub fn purge(&self, now: f64) {
        self.counters.purge_all(now);
    }

    /// Copy the full contents of every live counter, keyed by
    /// label-tuple-key and then identity. This is the introspection payload
    /// behind `/inspect`.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, CacheEntry>> {
        self.counters
            .counters()
            .into_iter()
            .map(|(key, counter)| (key, counter.snapshot()))
            .collect()
    }

    /// Render the Prometheus text exposition of the gauges and process
    /// stats.
    pub fn exposition(&self) -> String {
        exposition::registry_text(&self.registry)
    }

    /// The configured unique section as pretty JSON, for `/config`.
    pub fn config_json(&self) -> String {
        serde_json::to_string_pretty(&self.config).unwrap_or_else(|_| "{}".to_string())
    }

    /// Gather the registry's metric families. Mostly useful to tests.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

impl RecordSink for UniqueEngine {
    fn handle(&self, record: &Record) {
        UniqueEngine::handle(self, record);
    }
}
