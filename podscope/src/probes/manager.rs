//! Tracing probe scheduler
//!
//! One long-lived driver task per running probe. Each run gets a fresh
//! child token; cancellation is cooperative and the probe counts as stopped
//! only once its driver task has exited and cleared the running flag.
//!
//! Run outcomes: quiet errors (cancelled, disconnected) end the run
//! silently; `NotSupported` parks the probe permanently; anything else is
//! logged and the probe restarts after its interval.

use log::{debug, error, info};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::domain::{AgentError, ProbeFlags, Result};
use crate::probes::{ProbeAttr, ProbeRegistry};

#[derive(Debug, Clone, Serialize)]
pub struct ProbeInfo {
    pub name: String,
    pub running: bool,
    pub hit: u64,
    pub restart_interval: u64,
    pub flag: u32,
}

struct DriverState {
    running: bool,
    hit_count: u64,
    stop: Option<CancellationToken>,
}

struct ProbeDriver {
    name: String,
    attr: ProbeAttr,
    state: Mutex<DriverState>,
}

pub struct ProbeManager {
    probes: HashMap<String, Arc<ProbeDriver>>,
    /// Serializes every start/stop mutation.
    mutate: tokio::sync::Mutex<()>,
}

impl ProbeManager {
    /// Build drivers for every tracing-flagged probe in the registry.
    #[must_use]
    pub fn new(registry: &ProbeRegistry) -> ProbeManager {
        let probes = registry
            .tracing_probes()
            .into_iter()
            .map(|(name, attr)| {
                let driver = Arc::new(ProbeDriver {
                    name: name.clone(),
                    attr,
                    state: Mutex::new(DriverState { running: false, hit_count: 0, stop: None }),
                });
                (name, driver)
            })
            .collect();
        ProbeManager { probes, mutate: tokio::sync::Mutex::new(()) }
    }

    pub async fn start_all(&self) -> Result<()> {
        for name in self.probes.keys() {
            self.start(name).await?;
        }
        Ok(())
    }

    /// Spawn the driver task for one probe. Errors when the probe is
    /// unknown or already running.
    pub async fn start(&self, name: &str) -> Result<()> {
        let _mutation = self.mutate.lock().await;
        let driver = self.driver(name)?;

        {
            let mut state = driver.state.lock().unwrap();
            if state.running {
                return Err(AgentError::InvalidArgs(format!("{name} already running")));
            }
            state.running = true;
            let stop = CancellationToken::new();
            state.stop = Some(stop.clone());
            drop(state);

            let driver = Arc::clone(&driver);
            tokio::spawn(async move {
                driver.run(&stop).await;
            });
        }

        info!("start tracing {name}");
        Ok(())
    }

    pub async fn stop_all(&self) -> Result<()> {
        for name in self.probes.keys() {
            self.stop(name).await?;
        }
        Ok(())
    }

    /// Cancel a probe's driver. A no-op when the probe is already stopped.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let _mutation = self.mutate.lock().await;
        let driver = self.driver(name)?;

        let state = driver.state.lock().unwrap();
        if !state.running {
            debug!("{name} not running");
            return Ok(());
        }
        if let Some(stop) = &state.stop {
            stop.cancel();
        }
        Ok(())
    }

    /// Snapshot of every probe's lifecycle state.
    #[must_use]
    pub fn info_dump(&self) -> Vec<ProbeInfo> {
        let mut infos: Vec<ProbeInfo> = self
            .probes
            .values()
            .map(|driver| {
                let state = driver.state.lock().unwrap();
                ProbeInfo {
                    name: driver.name.clone(),
                    running: state.running,
                    hit: state.hit_count,
                    restart_interval: driver.attr.interval_secs,
                    flag: driver.attr.flags.0,
                }
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    #[must_use]
    pub fn is_running(&self, name: &str) -> bool {
        self.probes
            .get(name)
            .map(|d| d.state.lock().unwrap().running)
            .unwrap_or(false)
    }

    #[must_use]
    pub fn hit_count(&self, name: &str) -> u64 {
        self.probes
            .get(name)
            .map(|d| d.state.lock().unwrap().hit_count)
            .unwrap_or(0)
    }

    fn driver(&self, name: &str) -> Result<Arc<ProbeDriver>> {
        self.probes
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::NotFound { kind: "probe", name: name.to_string() })
    }
}

impl ProbeDriver {
    async fn run(self: &Arc<Self>, stop: &CancellationToken) {
        loop {
            // fresh cancellable context per run
            let run_token = stop.child_token();
            let result = self.attr.handler.start(&run_token).await;
            run_token.cancel();

            let mut parked = false;
            match result {
                Ok(()) => {}
                Err(AgentError::NotSupported) => {
                    info!("{}: not supported, parking", self.name);
                    parked = true;
                }
                Err(e) if e.is_quiet_exit() => {}
                Err(e) => error!("start tracing {}: {e}", self.name),
            }

            self.state.lock().unwrap().hit_count += 1;

            if parked || stop.is_cancelled() {
                break;
            }

            tokio::select! {
                () = stop.cancelled() => break,
                () = tokio::time::sleep(Duration::from_secs(self.attr.interval_secs)) => {}
            }
        }

        self.state.lock().unwrap().running = false;
        info!("{}: tracing task exited", self.name);
    }
}

/// Probes with the metric flag only never get a driver; assert the manager
/// ignores them.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Result;
    use crate::probes::{ProbeHandler, ProbeRegistry};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Runs until cancelled, or fails fast, depending on `fail_after`.
    struct FakeTracer {
        runs: AtomicU64,
        fail_runs: bool,
    }

    #[async_trait]
    impl ProbeHandler for FakeTracer {
        async fn start(&self, token: &CancellationToken) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail_runs {
                tokio::time::sleep(Duration::from_millis(10)).await;
                return Err(AgentError::InvalidArgs("transient".into()));
            }
            token.cancelled().await;
            Err(AgentError::Canceled)
        }
    }

    struct Unsupported;

    #[async_trait]
    impl ProbeHandler for Unsupported {
        async fn start(&self, _token: &CancellationToken) -> Result<()> {
            Err(AgentError::NotSupported)
        }
    }

    fn manager_with(name: &str, handler: Arc<dyn ProbeHandler>, interval: u64) -> ProbeManager {
        let mut registry = ProbeRegistry::new(&[]);
        registry.insert(name, ProbeAttr::new(handler, interval, ProbeFlags::TRACING));
        ProbeManager::new(&registry)
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let manager = manager_with(
            "fake",
            Arc::new(FakeTracer { runs: AtomicU64::new(0), fail_runs: false }),
            10,
        );

        manager.start("fake").await.unwrap();
        assert!(manager.is_running("fake"));

        // double start is a precondition error
        assert!(manager.start("fake").await.is_err());

        manager.stop("fake").await.unwrap();
        // driver observes the cancel and exits promptly
        tokio::time::timeout(Duration::from_millis(150), async {
            while manager.is_running("fake") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("driver should exit within 150ms of cancel");

        assert_eq!(manager.hit_count("fake"), 1);
        // stopping again is a no-op
        manager.stop("fake").await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_probe_restarts_after_interval() {
        let tracer = Arc::new(FakeTracer { runs: AtomicU64::new(0), fail_runs: true });
        let manager = manager_with("flaky", Arc::clone(&tracer) as Arc<dyn ProbeHandler>, 0);

        manager.start("flaky").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // with a zero interval the failing probe has restarted several times
        // and stayed running throughout
        assert!(tracer.runs.load(Ordering::SeqCst) >= 2);
        assert!(manager.is_running("flaky"));

        manager.stop("flaky").await.unwrap();
    }

    #[tokio::test]
    async fn test_not_supported_parks_probe() {
        let manager = manager_with("unsupported", Arc::new(Unsupported), 0);
        manager.start("unsupported").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!manager.is_running("unsupported"));
        assert_eq!(manager.hit_count("unsupported"), 1);
    }

    #[tokio::test]
    async fn test_unknown_probe() {
        let manager = manager_with("x", Arc::new(Unsupported), 0);
        assert!(manager.start("missing").await.is_err());
        assert!(manager.stop("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_info_dump() {
        let manager = manager_with(
            "fake",
            Arc::new(FakeTracer { runs: AtomicU64::new(0), fail_runs: false }),
            30,
        );
        let infos = manager.info_dump();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "fake");
        assert_eq!(infos[0].restart_interval, 30);
        assert!(!infos[0].running);
    }
}
