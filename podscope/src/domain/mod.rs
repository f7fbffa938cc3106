//! Domain model for podscope
//!
//! Core types and errors shared by every subsystem:
//! - The agent-wide error enum the probe scheduler matches on
//! - Bitmask types for probe flags and container classification

pub mod errors;
pub mod types;

pub use errors::AgentError;
pub use types::{ContainerQos, ContainerType, ProbeFlags};

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, AgentError>;
