//! Metric data points and the collector manager
//!
//! Probes return plain [`MetricData`] points from `update()`; the manager
//! turns them into Prometheus families on scrape. Host and region labels
//! are always present; container-scoped points carry the container label
//! block as well.

pub mod manager;

pub use manager::MetricManager;

use std::collections::BTreeMap;

use crate::inventory::Container;

pub const LABEL_HOST: &str = "Host";
pub const LABEL_REGION: &str = "Region";
pub const LABEL_CONTAINER_HOST: &str = "ContainerHost";
pub const LABEL_CONTAINER_NAME: &str = "ContainerName";
pub const LABEL_CONTAINER_TYPE: &str = "ContainerType";
pub const LABEL_CONTAINER_QOS: &str = "ContainerQos";
pub const LABEL_CONTAINER_HOST_NAMESPACE: &str = "ContainerHostNamespace";

/// Metric name prefix of everything this agent exports.
pub const NAMESPACE: &str = "podscope";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Gauge,
    Counter,
}

/// One metric data point as produced by a probe's `update()`.
///
/// Labels are kept sorted so families come out stable between scrapes.
#[derive(Debug, Clone)]
pub struct MetricData {
    pub name: String,
    pub metric_type: MetricType,
    pub value: f64,
    pub help: String,
    labels: BTreeMap<String, String>,
}

impl MetricData {
    /// A gauge point. Host and region are attached by the manager.
    #[must_use]
    pub fn gauge(name: &str, value: f64, help: &str) -> MetricData {
        MetricData {
            name: name.to_string(),
            metric_type: MetricType::Gauge,
            value,
            help: help.to_string(),
            labels: BTreeMap::new(),
        }
    }

    /// A gauge point scoped to one container, prefixed `container_` and
    /// carrying the container label block.
    #[must_use]
    pub fn container_gauge(
        container: &Container,
        name: &str,
        value: f64,
        help: &str,
    ) -> MetricData {
        let mut data = MetricData::gauge(&format!("container_{name}"), value, help);
        data.labels.insert(LABEL_CONTAINER_HOST.into(), container.hostname.clone());
        data.labels.insert(LABEL_CONTAINER_NAME.into(), container.name.clone());
        data.labels.insert(LABEL_CONTAINER_TYPE.into(), container.container_type.to_string());
        data.labels.insert(LABEL_CONTAINER_QOS.into(), container.qos.to_string());
        data.labels
            .insert(LABEL_CONTAINER_HOST_NAMESPACE.into(), container.host_namespace.clone());
        data
    }

    /// Add one custom label.
    #[must_use]
    pub fn with_label(mut self, key: &str, value: &str) -> MetricData {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ContainerQos, ContainerType};
    use chrono::Utc;
    use std::collections::HashMap;

    fn container() -> Container {
        Container::new(
            "abcdef123456abcdef".into(),
            "web".into(),
            "web-0".into(),
            ContainerType::NORMAL,
            ContainerQos::Guaranteed,
            "10.1.2.3".into(),
            0,
            1,
            "/kubepods/podx/abc".into(),
            HashMap::new(),
            Utc::now(),
            "prod".into(),
        )
    }

    #[test]
    fn test_container_gauge_labels() {
        let data = MetricData::container_gauge(&container(), "wait_rate", 12.5, "wait rate");
        assert_eq!(data.name, "container_wait_rate");
        assert_eq!(data.value, 12.5);
        assert_eq!(data.labels().get(LABEL_CONTAINER_NAME).unwrap(), "web");
        assert_eq!(data.labels().get(LABEL_CONTAINER_TYPE).unwrap(), "Normal");
        assert_eq!(data.labels().get(LABEL_CONTAINER_QOS).unwrap(), "Guaranteed");
        assert_eq!(data.labels().get(LABEL_CONTAINER_HOST_NAMESPACE).unwrap(), "prod");
    }

    #[test]
    fn test_custom_labels_sorted() {
        let data = MetricData::gauge("x", 1.0, "x").with_label("zebra", "1").with_label("alpha", "2");
        let keys: Vec<&String> = data.labels().keys().collect();
        assert_eq!(keys, ["alpha", "zebra"]);
    }
}
