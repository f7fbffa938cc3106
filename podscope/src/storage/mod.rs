//! Storage dispatch
//!
//! One document per emitted event. The dispatcher enriches the document
//! with container metadata through the inventory, then hands it to every
//! configured backend in order. Backend failures are logged and swallowed;
//! they never propagate to the event-generating probe.

pub mod index;
pub mod local_file;
pub mod rotator;

pub use index::IndexBackend;
pub use local_file::LocalFileBackend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use std::sync::Arc;

use crate::domain::Result;
use crate::inventory::ContainerInventory;

const RUN_TYPE_AUTO: &str = "auto";
const RUN_TYPE_TASK: &str = "task";

/// Timestamp format shared by the document body and file titles.
const TRACER_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f %z";

/// The unit delivered to storage.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub hostname: String,
    pub region: String,
    pub uploaded_time: DateTime<Utc>,
    /// Equal to `tracer_time`; retained for older consumers of the index.
    pub time: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub container_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub container_hostname: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub container_host_namespace: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub container_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub container_qos: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub tracer_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tracer_id: String,
    pub tracer_time: String,
    #[serde(rename = "tracer_type")]
    pub tracer_run_type: String,
    pub tracer_data: serde_json::Value,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn write(&self, doc: &Document) -> Result<()>;
}

pub struct StorageDispatch {
    backends: Vec<Box<dyn StorageBackend>>,
    inventory: Arc<ContainerInventory>,
    hostname: String,
    region: String,
}

impl StorageDispatch {
    #[must_use]
    pub fn new(
        backends: Vec<Box<dyn StorageBackend>>,
        inventory: Arc<ContainerInventory>,
        hostname: &str,
        region: &str,
    ) -> StorageDispatch {
        StorageDispatch {
            backends,
            inventory,
            hostname: hostname.to_string(),
            region: region.to_string(),
        }
    }

    /// Persist one auto-run tracer event. Failures are swallowed.
    pub async fn save(
        &self,
        tracer_name: &str,
        container_id: &str,
        tracer_time: DateTime<Utc>,
        tracer_data: serde_json::Value,
    ) {
        let Some(doc) = self
            .base_document(tracer_name, container_id, tracer_time, tracer_data, RUN_TYPE_AUTO)
            .await
        else {
            return;
        };
        self.dispatch(&doc).await;
    }

    /// Persist the output of an on-demand tracer task.
    pub async fn save_task_output(
        &self,
        tracer_name: &str,
        tracer_id: &str,
        container_id: &str,
        tracer_time: DateTime<Utc>,
        output: String,
    ) {
        let data = serde_json::json!({ "output": output });
        let Some(mut doc) = self
            .base_document(tracer_name, container_id, tracer_time, data, RUN_TYPE_TASK)
            .await
        else {
            return;
        };
        doc.tracer_id = tracer_id.to_string();
        self.dispatch(&doc).await;
    }

    async fn dispatch(&self, doc: &Document) {
        for backend in &self.backends {
            if let Err(e) = backend.write(doc).await {
                info!("failed to save {} into {}: {e}", doc.tracer_name, backend.name());
            }
        }
    }

    async fn base_document(
        &self,
        tracer_name: &str,
        container_id: &str,
        tracer_time: DateTime<Utc>,
        tracer_data: serde_json::Value,
        run_type: &str,
    ) -> Option<Document> {
        let time = tracer_time.format(TRACER_TIME_FORMAT).to_string();
        let mut doc = Document {
            hostname: self.hostname.clone(),
            region: self.region.clone(),
            uploaded_time: Utc::now(),
            time: time.clone(),
            container_id: String::new(),
            container_hostname: String::new(),
            container_host_namespace: String::new(),
            container_type: String::new(),
            container_qos: String::new(),
            tracer_name: tracer_name.to_string(),
            tracer_id: String::new(),
            tracer_time: time,
            tracer_run_type: run_type.to_string(),
            tracer_data,
        };

        if !container_id.is_empty() {
            let container = match self.inventory.get_by_id(container_id).await {
                Ok(Some(container)) => container,
                Ok(None) => {
                    info!("the container {container_id} is not found");
                    return None;
                }
                Err(e) => {
                    info!("get container by {container_id}: {e}");
                    return None;
                }
            };
            doc.container_id = container.id.chars().take(12).collect();
            doc.container_hostname = container.hostname.clone();
            doc.container_host_namespace = container.host_namespace.clone();
            doc.container_type = container.container_type.to_string();
            doc.container_qos = container.qos.to_string();
        }

        Some(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Backend that records documents into a shared buffer, optionally
    /// failing every write.
    struct RecordingBackend {
        docs: Arc<Mutex<Vec<Document>>>,
        fail: bool,
    }

    #[async_trait]
    impl StorageBackend for RecordingBackend {
        fn name(&self) -> &str {
            "recording"
        }

        async fn write(&self, doc: &Document) -> Result<()> {
            if self.fail {
                return Err(crate::domain::AgentError::InvalidArgs("backend down".into()));
            }
            self.docs.lock().unwrap().push(doc.clone());
            Ok(())
        }
    }

    fn dispatch_with(backends: Vec<Box<dyn StorageBackend>>) -> StorageDispatch {
        let inventory = Arc::new(crate::inventory::tests_support::offline_inventory());
        StorageDispatch::new(backends, inventory, "node-1", "dc-1")
    }

    #[tokio::test]
    async fn test_save_fans_out_and_survives_failures() {
        let docs = Arc::new(Mutex::new(Vec::new()));
        let failing = Box::new(RecordingBackend { docs: Arc::new(Mutex::new(Vec::new())), fail: true });
        let ok = Box::new(RecordingBackend { docs: Arc::clone(&docs), fail: false });
        let dispatch = dispatch_with(vec![failing, ok]);

        dispatch
            .save("dload", "", Utc::now(), serde_json::json!({"load_avg": 42.0}))
            .await;

        let docs = docs.lock().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].tracer_name, "dload");
        assert_eq!(docs[0].tracer_run_type, "auto");
        assert_eq!(docs[0].hostname, "node-1");
        assert!(docs[0].container_id.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_container_drops_the_document() {
        let docs = Arc::new(Mutex::new(Vec::new()));
        let ok = Box::new(RecordingBackend { docs: Arc::clone(&docs), fail: false });
        let dispatch = dispatch_with(vec![ok]);

        dispatch
            .save("softlockup", "no-such-container", Utc::now(), serde_json::json!({}))
            .await;
        assert!(docs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_task_output_carries_id_and_run_type() {
        let docs = Arc::new(Mutex::new(Vec::new()));
        let ok = Box::new(RecordingBackend { docs: Arc::clone(&docs), fail: false });
        let dispatch = dispatch_with(vec![ok]);

        dispatch
            .save_task_output("perf", "task-7", "", Utc::now(), "flamedata".to_string())
            .await;

        let docs = docs.lock().unwrap();
        assert_eq!(docs[0].tracer_id, "task-7");
        assert_eq!(docs[0].tracer_run_type, "task");
        assert_eq!(docs[0].tracer_data["output"], "flamedata");
    }
}
