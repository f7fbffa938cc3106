//! Small parsers for cgroup and procfs control files.

use std::collections::HashMap;
use std::path::Path;

use crate::domain::{AgentError, Result};

/// Parse `key value` lines into a map, ignoring malformed lines.
#[must_use]
pub fn parse_kv(content: &str) -> HashMap<String, u64> {
    let mut kv = HashMap::new();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
            continue;
        };
        if let Ok(value) = value.parse::<u64>() {
            kv.insert(key.to_string(), value);
        }
    }
    kv
}

pub fn read_kv(path: &Path) -> Result<HashMap<String, u64>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| AgentError::file(path.display().to_string(), e))?;
    Ok(parse_kv(&content))
}

pub fn read_u64(path: &Path) -> Result<u64> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| AgentError::file(path.display().to_string(), e))?;
    content
        .trim()
        .parse()
        .map_err(|_| AgentError::InvalidArgs(format!("{}: not a u64", path.display())))
}

pub fn read_i64(path: &Path) -> Result<i64> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| AgentError::file(path.display().to_string(), e))?;
    content
        .trim()
        .parse()
        .map_err(|_| AgentError::InvalidArgs(format!("{}: not an i64", path.display())))
}

/// Whitespace-separated pid list (`tasks`, `cgroup.threads`).
pub fn read_pids(path: &Path) -> Result<Vec<i32>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| AgentError::file(path.display().to_string(), e))?;
    Ok(content.split_whitespace().filter_map(|f| f.parse().ok()).collect())
}
