//! Rotated local-file backend
//!
//! One logical file per tracer name under the base directory, line
//! oriented: a one-line title followed by the indented JSON document.
//! Writers are size-rotated and cached per tracer.

use async_trait::async_trait;
use chrono::Local;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::domain::Result;
use crate::storage::rotator::SizeRotator;
use crate::storage::{Document, StorageBackend};

pub struct LocalFileBackend {
    base_dir: PathBuf,
    max_size_mb: u64,
    max_backups: usize,
    writers: Mutex<HashMap<String, SizeRotator>>,
}

impl LocalFileBackend {
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>, max_size_mb: u64, max_backups: usize) -> LocalFileBackend {
        LocalFileBackend {
            base_dir: base_dir.into(),
            max_size_mb,
            max_backups,
            writers: Mutex::new(HashMap::new()),
        }
    }

    fn title(doc: &Document) -> String {
        let mut title = format!(
            "{} Host={} Region={} ",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            doc.hostname,
            doc.region
        );
        if !doc.container_id.is_empty() {
            title.push_str(&format!(
                "ContainerHost={} ContainerID={} ContainerType={} ContainerLevel={} ",
                doc.container_hostname, doc.container_id, doc.container_type, doc.container_qos
            ));
        }
        title.push('\n');
        title
    }
}

#[async_trait]
impl StorageBackend for LocalFileBackend {
    fn name(&self) -> &str {
        "local-file"
    }

    async fn write(&self, doc: &Document) -> Result<()> {
        let mut body = serde_json::to_string_pretty(doc)?;
        body.push('\n');
        let title = Self::title(doc);

        let mut writers = self.writers.lock().unwrap();
        let writer = writers.entry(doc.tracer_name.clone()).or_insert_with(|| {
            SizeRotator::new(
                self.base_dir.join(&doc.tracer_name),
                self.max_size_mb,
                self.max_backups,
            )
        });
        writer.write_all(title.as_bytes())?;
        writer.write_all(body.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn doc(tracer: &str) -> Document {
        Document {
            hostname: "node-1".into(),
            region: "dc-1".into(),
            uploaded_time: Utc::now(),
            time: "2026-01-02 03:04:05.000 +0000".into(),
            container_id: "abcdef123456".into(),
            container_hostname: "web-0".into(),
            container_host_namespace: "prod".into(),
            container_type: "Normal".into(),
            container_qos: "Burstable".into(),
            tracer_name: tracer.into(),
            tracer_id: String::new(),
            tracer_time: "2026-01-02 03:04:05.000 +0000".into(),
            tracer_run_type: "auto".into(),
            tracer_data: serde_json::json!({"cpu": 1}),
        }
    }

    #[tokio::test]
    async fn test_write_title_and_document() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFileBackend::new(dir.path(), 10, 2);

        backend.write(&doc("softlockup")).await.unwrap();
        let content = std::fs::read_to_string(dir.path().join("softlockup")).unwrap();

        let mut lines = content.lines();
        let title = lines.next().unwrap();
        assert!(title.contains("Host=node-1"));
        assert!(title.contains("Region=dc-1"));
        assert!(title.contains("ContainerID=abcdef123456"));
        assert!(title.contains("ContainerLevel=Burstable"));
        // the rest is the indented document
        assert!(content.contains("\"tracer_name\": \"softlockup\""));
    }

    #[tokio::test]
    async fn test_one_file_per_tracer() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFileBackend::new(dir.path(), 10, 2);

        backend.write(&doc("softlockup")).await.unwrap();
        backend.write(&doc("dload")).await.unwrap();
        backend.write(&doc("softlockup")).await.unwrap();

        assert!(dir.path().join("softlockup").exists());
        assert!(dir.path().join("dload").exists());
        let softlockup = std::fs::read_to_string(dir.path().join("softlockup")).unwrap();
        assert_eq!(softlockup.matches("Host=node-1").count(), 2);
    }
}
