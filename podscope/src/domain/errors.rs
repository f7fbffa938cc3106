//! Structured error types for podscope
//!
//! The probe scheduler dispatches on variants, never on messages. Four kinds
//! matter to it: `Canceled` ends a run quietly, `NotSupported` parks a probe
//! permanently, `Disconnected` is a quiet shutdown signal, and everything
//! else either restarts the probe after its interval or is swallowed by the
//! caller.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    /// A cancellation token fired while the operation was waiting.
    #[error("exit by canceled context")]
    Canceled,

    /// The kernel or platform lacks a required feature; the probe is parked.
    #[error("not supported")]
    NotSupported,

    /// The agent is shutting down; treated like cancellation by the scheduler.
    #[error("disconnected from agent")]
    Disconnected,

    #[error("invalid argument: {0}")]
    InvalidArgs(String),

    /// A metric collector ran fine but found nothing to report.
    #[error("collector returned no data")]
    NoData,

    #[error("bpf object {name}: {reason}")]
    Bpf { name: String, reason: String },

    #[error("duplicate attach key {key} in {program}")]
    DuplicateAttach { program: String, key: String },

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("malformed record from {source_name}: {reason}")]
    MalformedRecord { source_name: String, reason: String },

    #[error("container {id}: {reason}")]
    Container { id: String, reason: String },

    #[error("kubelet: {0}")]
    Kubelet(String),

    #[error("{path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ebpf(#[from] aya::EbpfError),

    #[error(transparent)]
    Program(#[from] aya::programs::ProgramError),

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),

    #[error(transparent)]
    PerfBuf(#[from] aya::maps::perf::PerfBufferError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
}

impl AgentError {
    /// Open a file-flavored error carrying the offending path.
    pub fn file(path: impl Into<String>, source: std::io::Error) -> Self {
        AgentError::File { path: path.into(), source }
    }

    /// True for the error kinds the scheduler treats as a quiet exit.
    #[must_use]
    pub fn is_quiet_exit(&self) -> bool {
        matches!(self, AgentError::Canceled | AgentError::Disconnected | AgentError::NotSupported)
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, AgentError::Canceled)
    }

    #[must_use]
    pub fn is_no_data(&self) -> bool {
        matches!(self, AgentError::NoData)
    }

    /// True when the underlying cause is a refused connection; kubelet
    /// unavailability is tolerated by the inventory.
    #[must_use]
    pub fn is_connection_refused(&self) -> bool {
        match self {
            AgentError::Io(e) => e.kind() == std::io::ErrorKind::ConnectionRefused,
            AgentError::Http(e) => {
                use std::error::Error as _;
                let mut cause: Option<&(dyn std::error::Error + 'static)> = e.source();
                while let Some(err) = cause {
                    if let Some(io) = err.downcast_ref::<std::io::Error>() {
                        if io.kind() == std::io::ErrorKind::ConnectionRefused {
                            return true;
                        }
                    }
                    cause = err.source();
                }
                false
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_exit_kinds() {
        assert!(AgentError::Canceled.is_quiet_exit());
        assert!(AgentError::NotSupported.is_quiet_exit());
        assert!(AgentError::Disconnected.is_quiet_exit());
        assert!(!AgentError::NoData.is_quiet_exit());
        assert!(!AgentError::InvalidArgs("x".into()).is_quiet_exit());
    }

    #[test]
    fn test_file_error_display() {
        let err = AgentError::file(
            "/sys/fs/cgroup/cpu.stat",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(err.to_string().contains("/sys/fs/cgroup/cpu.stat"));
    }

    #[test]
    fn test_connection_refused_detection() {
        let err = AgentError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(err.is_connection_refused());
        let err = AgentError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(!err.is_connection_refused());
    }
}
