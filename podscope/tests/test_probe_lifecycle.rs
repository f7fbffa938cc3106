use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use podscope::domain::{AgentError, ProbeFlags, Result};
use podscope::probes::{ProbeAttr, ProbeHandler, ProbeManager, ProbeRegistry};

/// Simulates a probe whose run fails with a transient error shortly after
/// starting.
struct TransientTracer {
    runs: AtomicU64,
    run_duration: Duration,
}

#[async_trait]
impl ProbeHandler for TransientTracer {
    async fn start(&self, token: &CancellationToken) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            () = token.cancelled() => Err(AgentError::Canceled),
            () = tokio::time::sleep(self.run_duration) => {
                Err(AgentError::InvalidArgs("transient failure".into()))
            }
        }
    }
}

fn manager_for(
    name: &str,
    handler: Arc<dyn ProbeHandler>,
    interval_secs: u64,
) -> ProbeManager {
    let mut registry = ProbeRegistry::new(&[]);
    registry.insert(name, ProbeAttr::new(handler, interval_secs, ProbeFlags::TRACING));
    ProbeManager::new(&registry)
}

/// A probe that fails transiently restarts after its interval; the probe
/// stays running across restarts and its hit count grows.
#[tokio::test]
async fn test_transient_error_restarts_probe() {
    let tracer = Arc::new(TransientTracer {
        runs: AtomicU64::new(0),
        run_duration: Duration::from_millis(20),
    });
    let manager = manager_for("flaky", Arc::clone(&tracer) as Arc<dyn ProbeHandler>, 0);

    manager.start("flaky").await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(manager.is_running("flaky"));
    assert!(manager.hit_count("flaky") >= 2, "hit count {}", manager.hit_count("flaky"));
    assert!(tracer.runs.load(Ordering::SeqCst) >= 2);

    manager.stop("flaky").await.unwrap();
}

/// Cancellation is observed promptly: the driver task exits well within the
/// perf reader's poll-deadline budget.
#[tokio::test]
async fn test_cancel_exits_quickly_and_clears_running() {
    let tracer = Arc::new(TransientTracer {
        runs: AtomicU64::new(0),
        run_duration: Duration::from_secs(600),
    });
    let manager = manager_for("slow", tracer as Arc<dyn ProbeHandler>, 60);

    manager.start("slow").await.unwrap();
    assert!(manager.is_running("slow"));

    manager.stop("slow").await.unwrap();
    tokio::time::timeout(Duration::from_millis(150), async {
        while manager.is_running("slow") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("probe did not stop within 150ms");

    // once stopped, starting again is allowed
    manager.start("slow").await.unwrap();
    assert!(manager.is_running("slow"));
    manager.stop("slow").await.unwrap();
}

/// While a probe runs, a second start is rejected; the first driver is
/// unaffected.
#[tokio::test]
async fn test_double_start_rejected() {
    let tracer = Arc::new(TransientTracer {
        runs: AtomicU64::new(0),
        run_duration: Duration::from_secs(600),
    });
    let manager = manager_for("single", tracer as Arc<dyn ProbeHandler>, 60);

    manager.start("single").await.unwrap();
    assert!(manager.start("single").await.is_err());
    assert!(manager.is_running("single"));
    manager.stop("single").await.unwrap();
}

/// The blacklist removes probes before the manager ever sees them.
#[tokio::test]
async fn test_blacklisted_probe_absent() {
    let registry = ProbeRegistry::new(&["banned".to_string()]);
    let manager = ProbeManager::new(&registry);
    assert!(manager.start("banned").await.is_err());
    assert!(manager.info_dump().is_empty());
}
