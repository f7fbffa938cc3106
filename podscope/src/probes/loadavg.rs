//! Host load averages from /proc/loadavg.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use crate::domain::{AgentError, ProbeFlags, Result};
use crate::metrics::MetricData;
use crate::probes::{ProbeAttr, ProbeContext, ProbeHandler};

pub fn probe(_ctx: &ProbeContext) -> Result<ProbeAttr> {
    Ok(ProbeAttr::new(Arc::new(LoadavgCollector::new("/proc/loadavg")), 0, ProbeFlags::METRIC))
}

struct LoadavgCollector {
    path: PathBuf,
}

impl LoadavgCollector {
    fn new(path: impl Into<PathBuf>) -> LoadavgCollector {
        LoadavgCollector { path: path.into() }
    }
}

/// `/proc/loadavg`: `0.12 0.34 0.56 2/345 6789`.
fn parse_loadavg(content: &str) -> Result<[f64; 3]> {
    let mut fields = content.split_whitespace();
    let mut loads = [0f64; 3];
    for load in &mut loads {
        *load = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| AgentError::InvalidArgs(format!("malformed loadavg: {content:?}")))?;
    }
    Ok(loads)
}

#[async_trait]
impl ProbeHandler for LoadavgCollector {
    async fn update(&self) -> Result<Vec<MetricData>> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| AgentError::file(self.path.display().to_string(), e))?;
        let loads = parse_loadavg(&content)?;

        Ok(vec![
            MetricData::gauge("load1", loads[0], "1m load average"),
            MetricData::gauge("load5", loads[1], "5m load average"),
            MetricData::gauge("load15", loads[2], "15m load average"),
        ])
    }
}
