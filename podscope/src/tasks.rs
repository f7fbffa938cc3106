//! On-demand tracer tasks
//!
//! A task runs one tracing probe for a bounded time on request from the
//! control plane. Tasks are capped in number and duration; the run's
//! outcome is retrievable by id and its output document is stored with run
//! type `task`.

use chrono::Utc;
use log::info;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::domain::{AgentError, ProbeFlags, Result};
use crate::probes::ProbeRegistry;
use crate::storage::StorageDispatch;

/// Hard ceiling on a task's timeout.
const MAX_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Stopped,
    NotExist,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct TaskEntry {
    status: TaskStatus,
    token: CancellationToken,
    output: Option<String>,
    error: Option<String>,
}

pub struct TaskManager {
    registry: Arc<ProbeRegistry>,
    storage: Arc<StorageDispatch>,
    tasks: Mutex<HashMap<String, Arc<Mutex<TaskEntry>>>>,
    max_running: usize,
    next_id: AtomicU64,
}

impl TaskManager {
    #[must_use]
    pub fn new(
        registry: Arc<ProbeRegistry>,
        storage: Arc<StorageDispatch>,
        max_running: usize,
    ) -> TaskManager {
        TaskManager {
            registry,
            storage,
            tasks: Mutex::new(HashMap::new()),
            max_running,
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap()
            .values()
            .filter(|entry| entry.lock().unwrap().status == TaskStatus::Running)
            .count()
    }

    /// Launch a bounded run of `tracer_name`; returns the task id.
    pub fn start(self: &Arc<Self>, tracer_name: &str, timeout: Duration) -> Result<String> {
        if timeout.is_zero() || timeout >= MAX_TIMEOUT {
            return Err(AgentError::InvalidArgs(format!(
                "task timeout must be within (0, {}s)",
                MAX_TIMEOUT.as_secs()
            )));
        }
        if self.running_count() >= self.max_running {
            return Err(AgentError::InvalidArgs("too many running tasks".into()));
        }

        let attr = self
            .registry
            .get(tracer_name)
            .ok_or_else(|| AgentError::NotFound { kind: "tracer", name: tracer_name.to_string() })?
            .clone();
        if !attr.flags.contains(ProbeFlags::TRACING) {
            return Err(AgentError::InvalidArgs(format!("{tracer_name} is not a tracing probe")));
        }

        let id = format!("{tracer_name}-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let token = CancellationToken::new();
        let entry = Arc::new(Mutex::new(TaskEntry {
            status: TaskStatus::Running,
            token: token.clone(),
            output: None,
            error: None,
        }));
        self.tasks.lock().unwrap().insert(id.clone(), Arc::clone(&entry));

        let manager = Arc::clone(self);
        let tracer = tracer_name.to_string();
        let task_id = id.clone();
        tokio::spawn(async move {
            let started = Utc::now();
            let run = async {
                tokio::select! {
                    result = attr.handler.start(&token) => result,
                    () = tokio::time::sleep(timeout) => Ok(()),
                    () = token.cancelled() => Err(AgentError::Canceled),
                }
            };
            let result = run.await;
            token.cancel();

            let (status, output, error) = match result {
                Ok(()) => (
                    TaskStatus::Completed,
                    Some(format!("{tracer} ran from {started} for up to {}s", timeout.as_secs())),
                    None,
                ),
                Err(e) if e.is_canceled() => (TaskStatus::Stopped, None, None),
                Err(e) => (TaskStatus::Failed, None, Some(e.to_string())),
            };

            if let Some(output) = &output {
                manager
                    .storage
                    .save_task_output(&tracer, &task_id, "", Utc::now(), output.clone())
                    .await;
            }

            let mut entry = entry.lock().unwrap();
            entry.status = status;
            entry.output = output;
            entry.error = error;
            info!("task {task_id} finished: {:?}", entry.status);
        });

        Ok(id)
    }

    #[must_use]
    pub fn result(&self, id: &str) -> TaskResult {
        let tasks = self.tasks.lock().unwrap();
        let Some(entry) = tasks.get(id) else {
            return TaskResult {
                status: TaskStatus::NotExist,
                data: None,
                error: Some(format!("task {id} not found")),
            };
        };
        let entry = entry.lock().unwrap();
        TaskResult { status: entry.status, data: entry.output.clone(), error: entry.error.clone() }
    }

    pub fn stop(&self, id: &str) -> Result<()> {
        let tasks = self.tasks.lock().unwrap();
        let entry = tasks
            .get(id)
            .ok_or_else(|| AgentError::NotFound { kind: "task", name: id.to_string() })?;
        entry.lock().unwrap().token.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::{ProbeAttr, ProbeHandler};
    use async_trait::async_trait;

    struct SleepyTracer;

    #[async_trait]
    impl ProbeHandler for SleepyTracer {
        async fn start(&self, token: &CancellationToken) -> Result<()> {
            token.cancelled().await;
            Err(AgentError::Canceled)
        }
    }

    fn manager(max: usize) -> Arc<TaskManager> {
        let mut registry = ProbeRegistry::new(&[]);
        registry.insert("sleepy", ProbeAttr::new(Arc::new(SleepyTracer), 10, ProbeFlags::TRACING));
        registry.insert("metric_only", ProbeAttr::new(Arc::new(SleepyTracer), 0, ProbeFlags::METRIC));
        let storage = Arc::new(StorageDispatch::new(
            Vec::new(),
            Arc::new(crate::inventory::tests_support::offline_inventory()),
            "n",
            "r",
        ));
        Arc::new(TaskManager::new(Arc::new(registry), storage, max))
    }

    #[tokio::test]
    async fn test_task_timeout_completes() {
        let manager = manager(4);
        let id = manager.start("sleepy", Duration::from_millis(30)).unwrap();
        assert_eq!(manager.result(&id).status, TaskStatus::Running);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.result(&id).status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_task_stop() {
        let manager = manager(4);
        let id = manager.start("sleepy", Duration::from_secs(30)).unwrap();
        manager.stop(&id).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.result(&id).status, TaskStatus::Stopped);
    }

    #[tokio::test]
    async fn test_task_caps() {
        let manager = manager(1);
        let _id = manager.start("sleepy", Duration::from_secs(30)).unwrap();
        assert!(manager.start("sleepy", Duration::from_secs(30)).is_err());
        // timeout ceiling
        assert!(manager.start("sleepy", Duration::from_secs(3600)).is_err());
        // unknown and non-tracing tracers are rejected
        assert!(manager.start("nope", Duration::from_secs(1)).is_err());
        assert!(manager.start("metric_only", Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_unknown_task_result() {
        let manager = manager(1);
        assert_eq!(manager.result("ghost").status, TaskStatus::NotExist);
        assert!(manager.stop("ghost").is_err());
    }
}
