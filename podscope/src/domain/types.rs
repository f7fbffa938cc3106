//! Bitmask and classification types shared across subsystems.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What a probe produces: metrics on poll, tracing documents from a
/// long-running event pump, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeFlags(pub u32);

impl ProbeFlags {
    pub const METRIC: ProbeFlags = ProbeFlags(1);
    pub const TRACING: ProbeFlags = ProbeFlags(2);

    #[must_use]
    pub fn contains(self, other: ProbeFlags) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub fn union(self, other: ProbeFlags) -> ProbeFlags {
        ProbeFlags(self.0 | other.0)
    }

    /// A probe must be at least one of metric or tracing.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 & (Self::METRIC.0 | Self::TRACING.0) != 0
    }
}

/// Container classification derived from the owning pod.
///
/// A bitmask so inventory lookups can select several kinds at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContainerType(pub u32);

impl ContainerType {
    pub const SIDECAR: ContainerType = ContainerType(1);
    pub const DAEMON_SET: ContainerType = ContainerType(1 << 1);
    pub const NORMAL: ContainerType = ContainerType(1 << 2);
    pub const UNKNOWN: ContainerType = ContainerType(1 << 3);
    pub const ALL: ContainerType = ContainerType((1 << 4) - 1);

    #[must_use]
    pub fn matches(self, mask: ContainerType) -> bool {
        self.0 & mask.0 != 0
    }

    #[must_use]
    pub fn union(self, other: ContainerType) -> ContainerType {
        ContainerType(self.0 | other.0)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerType::SIDECAR => "Sidecar",
            ContainerType::DAEMON_SET => "DaemonSet",
            ContainerType::NORMAL => "Normal",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ContainerType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ContainerType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "Sidecar" => ContainerType::SIDECAR,
            "DaemonSet" => ContainerType::DAEMON_SET,
            "Normal" => ContainerType::NORMAL,
            _ => ContainerType::UNKNOWN,
        })
    }
}

/// Kubernetes QoS class of the owning pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContainerQos {
    Unknown,
    Guaranteed,
    Burstable,
    BestEffort,
}

impl ContainerQos {
    #[must_use]
    pub fn from_class(class: &str) -> ContainerQos {
        match class {
            "Guaranteed" => ContainerQos::Guaranteed,
            "Burstable" => ContainerQos::Burstable,
            "BestEffort" => ContainerQos::BestEffort,
            _ => ContainerQos::Unknown,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerQos::Guaranteed => "Guaranteed",
            ContainerQos::Burstable => "Burstable",
            ContainerQos::BestEffort => "BestEffort",
            ContainerQos::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ContainerQos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ContainerQos {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ContainerQos {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ContainerQos::from_class(&s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_flags() {
        let both = ProbeFlags::METRIC.union(ProbeFlags::TRACING);
        assert!(both.contains(ProbeFlags::METRIC));
        assert!(both.contains(ProbeFlags::TRACING));
        assert!(both.is_valid());
        assert!(!ProbeFlags(0).is_valid());
        assert!(!ProbeFlags(4).is_valid());
    }

    #[test]
    fn test_container_type_mask() {
        let mask = ContainerType::NORMAL.union(ContainerType::SIDECAR);
        assert!(ContainerType::NORMAL.matches(mask));
        assert!(ContainerType::SIDECAR.matches(mask));
        assert!(!ContainerType::DAEMON_SET.matches(mask));
        assert!(ContainerType::DAEMON_SET.matches(ContainerType::ALL));
    }

    #[test]
    fn test_qos_round_trip() {
        for class in ["Guaranteed", "Burstable", "BestEffort"] {
            assert_eq!(ContainerQos::from_class(class).as_str(), class);
        }
        assert_eq!(ContainerQos::from_class("anything"), ContainerQos::Unknown);
    }
}
