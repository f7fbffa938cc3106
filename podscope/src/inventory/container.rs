//! The container record and per-container probe state
//!
//! A [`Container`] is immutable between syncs. Probes that need mutable
//! per-container state register a life-resource prototype up front; every
//! new container gets a fresh instance cloned in, retrievable through one
//! typed downcast at the boundary.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{ContainerQos, ContainerType};

/// Constructor for one probe's per-container state.
pub type LifeResourceFactory = Arc<dyn Fn() -> Arc<dyn Any + Send + Sync> + Send + Sync>;

#[derive(Clone, Serialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub hostname: String,
    #[serde(rename = "type")]
    pub container_type: ContainerType,
    pub qos: ContainerQos,
    pub ip_address: String,
    pub net_namespace_inode: u64,
    /// The pid-1 of the container.
    pub init_pid: i32,
    pub cgroup_suffix: String,
    /// Subsystem name -> kernel address of this container's
    /// `cgroup_subsys_state`.
    pub css: HashMap<String, u64>,
    pub started_at: DateTime<Utc>,
    pub synced_at: DateTime<Utc>,
    /// Namespace of the owning pod.
    pub host_namespace: String,
    #[serde(skip)]
    life_resources: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Container {
    /// Clone a fresh instance of every registered prototype into the
    /// container. Called once at creation.
    pub(crate) fn populate_life_resources(
        &mut self,
        prototypes: &HashMap<String, LifeResourceFactory>,
    ) {
        for (key, factory) in prototypes {
            self.life_resources.insert(key.clone(), factory());
        }
    }

    /// Typed access to a probe's per-container state. One downcast at the
    /// boundary; `None` when the key was never registered or the type does
    /// not match.
    #[must_use]
    pub fn life_resource<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.life_resources.get(key).and_then(|any| Arc::clone(any).downcast::<T>().ok())
    }

    /// Builder used by the sync path; life resources start empty.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        name: String,
        hostname: String,
        container_type: ContainerType,
        qos: ContainerQos,
        ip_address: String,
        net_namespace_inode: u64,
        init_pid: i32,
        cgroup_suffix: String,
        css: HashMap<String, u64>,
        started_at: DateTime<Utc>,
        host_namespace: String,
    ) -> Container {
        Container {
            id,
            name,
            hostname,
            container_type,
            qos,
            ip_address,
            net_namespace_inode,
            init_pid,
            cgroup_suffix,
            css,
            started_at,
            synced_at: Utc::now(),
            host_namespace,
            life_resources: HashMap::new(),
        }
    }
}

impl std::fmt::Display for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}/{}/{}:{}/{}",
            self.id, self.hostname, self.name, self.container_type, self.qos, self.ip_address
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn minimal_container() -> Container {
        Container::new(
            "abc".into(),
            "app".into(),
            "host-1".into(),
            ContainerType::NORMAL,
            ContainerQos::Burstable,
            "10.0.0.1".into(),
            12345,
            100,
            "/kubepods/burstable/podx/abc".into(),
            HashMap::new(),
            Utc::now(),
            "default".into(),
        )
    }

    #[derive(Default)]
    struct CounterState {
        hits: Mutex<u64>,
    }

    #[test]
    fn test_life_resource_typed_access() {
        let mut prototypes: HashMap<String, LifeResourceFactory> = HashMap::new();
        prototypes.insert(
            "counter".into(),
            Arc::new(|| Arc::new(CounterState::default()) as Arc<dyn Any + Send + Sync>),
        );

        let mut c = minimal_container();
        c.populate_life_resources(&prototypes);

        let state = c.life_resource::<CounterState>("counter").unwrap();
        *state.hits.lock().unwrap() += 1;

        // a second lookup sees the same instance
        let again = c.life_resource::<CounterState>("counter").unwrap();
        assert_eq!(*again.hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_life_resource_wrong_type_or_key() {
        let mut prototypes: HashMap<String, LifeResourceFactory> = HashMap::new();
        prototypes.insert(
            "counter".into(),
            Arc::new(|| Arc::new(CounterState::default()) as Arc<dyn Any + Send + Sync>),
        );

        let mut c = minimal_container();
        c.populate_life_resources(&prototypes);

        assert!(c.life_resource::<String>("counter").is_none());
        assert!(c.life_resource::<CounterState>("missing").is_none());
    }

    #[test]
    fn test_display_format() {
        let c = minimal_container();
        assert_eq!(c.to_string(), "abc:host-1/app/Normal:Burstable/10.0.0.1");
    }
}
