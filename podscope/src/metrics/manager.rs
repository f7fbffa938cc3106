//! Collector manager
//!
//! The manager owns a [`prometheus::Registry`] with one registered
//! [`Collector`] covering every metric probe. Probe `update()`s are async,
//! so a scrape runs them first (concurrently, but serialized per probe by a
//! dedicated mutex) and `Collector::collect` then renders that pass as
//! const metrics through per-name cached [`Desc`]s. Two synthetic gauges
//! per probe report scrape duration and success.

use log::{debug, info};
use prometheus::core::{Collector, Desc};
use prometheus::proto;
use prometheus::{Registry, TextEncoder};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinSet;

use crate::domain::Result;
use crate::metrics::{MetricData, MetricType, LABEL_HOST, LABEL_REGION, NAMESPACE};
use crate::probes::{ProbeHandler, ProbeRegistry};

struct CollectorSlot {
    handler: Arc<dyn ProbeHandler>,
    lock: tokio::sync::Mutex<()>,
}

/// Latest completed update pass; what `Collector::collect` renders.
#[derive(Default)]
struct Snapshot {
    points: Vec<(String, MetricData)>,
    durations: Vec<(String, f64)>,
    successes: Vec<(String, f64)>,
}

struct ProbeCollector {
    collectors: Vec<(String, Arc<CollectorSlot>)>,
    hostname: String,
    region: String,
    scrape_duration_desc: Desc,
    scrape_success_desc: Desc,
    /// fq metric name -> Desc, created once per name.
    desc_cache: Mutex<HashMap<String, Desc>>,
    snapshot: Mutex<Snapshot>,
}

/// Registry adapter; the registry owns its collectors as boxed trait
/// objects while the manager keeps driving the shared core.
struct SharedCollector(Arc<ProbeCollector>);

impl Collector for SharedCollector {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.0.scrape_duration_desc, &self.0.scrape_success_desc]
    }

    fn collect(&self) -> Vec<proto::MetricFamily> {
        self.0.collect_families()
    }
}

pub struct MetricManager {
    registry: Registry,
    inner: Arc<ProbeCollector>,
}

impl MetricManager {
    /// Build the manager from every registered probe carrying the metric
    /// flag and register the collector with a fresh registry.
    pub fn new(registry: &ProbeRegistry, hostname: &str, region: &str) -> Result<MetricManager> {
        let collectors = registry
            .metric_probes()
            .into_iter()
            .map(|(name, handler)| {
                (name, Arc::new(CollectorSlot { handler, lock: tokio::sync::Mutex::new(()) }))
            })
            .collect();

        let scrape_labels =
            vec![LABEL_HOST.to_string(), LABEL_REGION.to_string(), "collector".to_string()];
        let scrape_duration_desc = Desc::new(
            format!("{NAMESPACE}_scrape_collector_duration_seconds"),
            format!("{NAMESPACE}: Duration of a collector scrape."),
            scrape_labels.clone(),
            HashMap::new(),
        )?;
        let scrape_success_desc = Desc::new(
            format!("{NAMESPACE}_scrape_collector_success"),
            format!("{NAMESPACE}: Whether a collector succeeded."),
            scrape_labels,
            HashMap::new(),
        )?;

        let inner = Arc::new(ProbeCollector {
            collectors,
            hostname: hostname.to_string(),
            region: region.to_string(),
            scrape_duration_desc,
            scrape_success_desc,
            desc_cache: Mutex::new(HashMap::new()),
            snapshot: Mutex::new(Snapshot::default()),
        });

        let prom_registry = Registry::new();
        prom_registry.register(Box::new(SharedCollector(Arc::clone(&inner))))?;

        Ok(MetricManager { registry: prom_registry, inner })
    }

    /// Run every collector and store the pass for the next registry gather.
    pub async fn update_all(&self) {
        self.inner.update_all().await;
    }

    /// Refresh every collector, then gather through the registry.
    pub async fn gather(&self) -> Vec<proto::MetricFamily> {
        self.update_all().await;
        self.registry.gather()
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Scrape and render in the Prometheus text exposition format.
    pub async fn encode_text(&self) -> Result<String> {
        let families = self.gather().await;
        Ok(TextEncoder::new().encode_to_string(&families)?)
    }
}

impl ProbeCollector {
    async fn update_all(&self) {
        let mut set = JoinSet::new();
        for (name, slot) in &self.collectors {
            let name = name.clone();
            let slot = Arc::clone(slot);
            set.spawn(async move {
                // one update per collector at a time
                let _serialize = slot.lock.lock().await;
                let begin = Instant::now();
                let result = slot.handler.update().await;
                (name, begin.elapsed().as_secs_f64(), result)
            });
        }

        let mut pass = Snapshot::default();
        while let Some(joined) = set.join_next().await {
            let Ok((collector, duration, result)) = joined else {
                continue;
            };
            let success = match result {
                Ok(points) => {
                    pass.points.extend(points.into_iter().map(|p| (collector.clone(), p)));
                    debug!("collector {collector} succeeded, duration_seconds {duration}");
                    1.0
                }
                Err(e) if e.is_no_data() => {
                    debug!("collector {collector} returned no data: {e}");
                    0.0
                }
                Err(e) => {
                    info!("collector {collector} failed, duration_seconds {duration}: {e}");
                    0.0
                }
            };
            pass.durations.push((collector.clone(), duration));
            pass.successes.push((collector, success));
        }

        *self.snapshot.lock().unwrap() = pass;
    }

    fn collect_families(&self) -> Vec<proto::MetricFamily> {
        let snapshot = self.snapshot.lock().unwrap();

        let mut families: BTreeMap<String, proto::MetricFamily> = BTreeMap::new();
        for (collector, point) in &snapshot.points {
            self.merge_point(&mut families, collector, point);
        }

        let mut out: Vec<proto::MetricFamily> = families.into_values().collect();
        out.push(scrape_family(&self.scrape_duration_desc, self, &snapshot.durations));
        out.push(scrape_family(&self.scrape_success_desc, self, &snapshot.successes));
        out
    }

    /// Look up or create the Desc for one fq metric name.
    fn desc_for(&self, fq_name: &str, point: &MetricData) -> Option<Desc> {
        let mut cache = self.desc_cache.lock().unwrap();
        if let Some(desc) = cache.get(fq_name) {
            return Some(desc.clone());
        }

        let mut label_keys = vec![LABEL_REGION.to_string(), LABEL_HOST.to_string()];
        label_keys.extend(point.labels().keys().cloned());
        match Desc::new(fq_name.to_string(), point.help.clone(), label_keys, HashMap::new()) {
            Ok(desc) => {
                cache.insert(fq_name.to_string(), desc.clone());
                Some(desc)
            }
            Err(e) => {
                info!("bad metric desc {fq_name}: {e}");
                None
            }
        }
    }

    fn merge_point(
        &self,
        families: &mut BTreeMap<String, proto::MetricFamily>,
        collector: &str,
        point: &MetricData,
    ) {
        let fq_name = format!("{NAMESPACE}_{collector}_{}", point.name);
        let Some(desc) = self.desc_for(&fq_name, point) else {
            return;
        };

        let mut label_values: Vec<&str> = vec![&self.region, &self.hostname];
        label_values.extend(point.labels().values().map(String::as_str));
        if label_values.len() != desc.variable_labels.len() {
            info!("metric {fq_name}: label arity changed, dropping point");
            return;
        }

        let proto_type = match point.metric_type {
            MetricType::Gauge => proto::MetricType::GAUGE,
            MetricType::Counter => proto::MetricType::COUNTER,
        };
        let metric = const_metric(&desc, proto_type, point.value, &label_values);

        let family = families
            .entry(fq_name)
            .or_insert_with(|| family_for(&desc, proto_type));
        family.mut_metric().push(metric);
    }
}

/// The const-metric builder: one sample bound to a Desc's label set, the
/// way the registry would get it from a vec-type instrument.
fn const_metric(
    desc: &Desc,
    metric_type: proto::MetricType,
    value: f64,
    label_values: &[&str],
) -> proto::Metric {
    let mut metric = proto::Metric::default();
    for pair in &desc.const_label_pairs {
        metric.mut_label().push(pair.clone());
    }
    for (key, label_value) in desc.variable_labels.iter().zip(label_values) {
        let mut pair = proto::LabelPair::default();
        pair.set_name(key.clone());
        pair.set_value((*label_value).to_string());
        metric.mut_label().push(pair);
    }

    match metric_type {
        proto::MetricType::COUNTER => {
            let mut counter = proto::Counter::default();
            counter.set_value(value);
            metric.set_counter(counter);
        }
        _ => {
            let mut gauge = proto::Gauge::default();
            gauge.set_value(value);
            metric.set_gauge(gauge);
        }
    }
    metric
}

fn family_for(desc: &Desc, metric_type: proto::MetricType) -> proto::MetricFamily {
    let mut family = proto::MetricFamily::default();
    family.set_name(desc.fq_name.clone());
    family.set_help(desc.help.clone());
    family.set_field_type(metric_type);
    family
}

fn scrape_family(
    desc: &Desc,
    collector: &ProbeCollector,
    points: &[(String, f64)],
) -> proto::MetricFamily {
    let mut family = family_for(desc, proto::MetricType::GAUGE);
    for (name, value) in points {
        let label_values = [collector.hostname.as_str(), collector.region.as_str(), name.as_str()];
        family.mut_metric().push(const_metric(
            desc,
            proto::MetricType::GAUGE,
            *value,
            &label_values,
        ));
    }
    family
}
