//! Tracking of the resources a provider spawned.
//!
//! Every provider records what it created for a node (pod, container or
//! process), the state it believes the resource is in and the local port
//! mappings it established, so later calls for the same node are cheap and
//! port forwarding stays idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{OrchestratorError, Result};
use crate::topology::NodeRole;

/// Handle to a spawned resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceHandle {
    /// Node name.
    pub name: String,

    /// Backend identifier: pod name, container id or process id.
    pub resource_id: String,

    /// Node role.
    pub role: NodeRole,

    /// Current state of the resource.
    pub state: ResourceState,

    /// IP address of the resource, once known.
    pub ip_address: Option<String>,

    /// Mapped ports (node port -> local port).
    pub port_mappings: HashMap<u16, u16>,

    /// Creation timestamp (Unix milliseconds).
    pub created_at: i64,
}

impl ResourceHandle {
    /// Creates a new handle in the `Created` state.
    pub fn new(name: impl Into<String>, resource_id: impl Into<String>, role: NodeRole) -> Self {
        Self {
            name: name.into(),
            resource_id: resource_id.into(),
            role,
            state: ResourceState::Created,
            ip_address: None,
            port_mappings: HashMap::new(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Returns true if the resource is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state, ResourceState::Running)
    }

    /// Returns the local port mapped to `port`.
    pub fn local_port(&self, port: u16) -> Option<u16> {
        self.port_mappings.get(&port).copied()
    }
}

/// Resource state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    /// Created but not confirmed ready.
    Created,

    /// Ready and running.
    Running,

    /// Paused by the orchestrator.
    Paused,

    /// The process exited.
    Exited {
        /// Exit code.
        exit_code: i32,
    },

    /// Removed with the namespace.
    Removed,
}

impl ResourceState {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited { .. } | Self::Removed)
    }
}

/// Resources of one namespace, indexed by node name.
#[derive(Debug, Default, Clone)]
pub struct ResourceTracker {
    resources: Arc<RwLock<HashMap<String, ResourceHandle>>>,
}

impl ResourceTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource, replacing a previous one with the same name.
    pub async fn register(&self, handle: ResourceHandle) {
        let mut resources = self.resources.write().await;
        resources.insert(handle.name.clone(), handle);
    }

    /// Gets a resource handle.
    pub async fn get(&self, name: &str) -> Option<ResourceHandle> {
        let resources = self.resources.read().await;
        resources.get(name).cloned()
    }

    /// Gets a resource handle or fails with `NodeNotFound`.
    pub async fn require(&self, name: &str) -> Result<ResourceHandle> {
        self.get(name)
            .await
            .ok_or_else(|| OrchestratorError::node_not_found(name))
    }

    /// Gets all resource handles.
    pub async fn all(&self) -> Vec<ResourceHandle> {
        let resources = self.resources.read().await;
        resources.values().cloned().collect()
    }

    /// Updates a resource's state.
    pub async fn update_state(&self, name: &str, state: ResourceState) -> Result<()> {
        let mut resources = self.resources.write().await;
        match resources.get_mut(name) {
            Some(handle) => {
                handle.state = state;
                Ok(())
            }
            None => Err(OrchestratorError::node_not_found(name)),
        }
    }

    /// Records the IP address of a resource.
    pub async fn set_ip(&self, name: &str, ip: impl Into<String>) -> Result<()> {
        let mut resources = self.resources.write().await;
        let handle = resources
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::node_not_found(name))?;
        handle.ip_address = Some(ip.into());
        Ok(())
    }

    /// Records a port mapping, returning the mapping already known if any.
    pub async fn map_port(&self, name: &str, port: u16, local: u16) -> Result<u16> {
        let mut resources = self.resources.write().await;
        let handle = resources
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::node_not_found(name))?;
        Ok(*handle.port_mappings.entry(port).or_insert(local))
    }

    /// Marks every resource removed and forgets them.
    pub async fn clear(&self) -> Vec<ResourceHandle> {
        let mut resources = self.resources.write().await;
        resources
            .drain()
            .map(|(_, mut handle)| {
                handle.state = ResourceState::Removed;
                handle
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_state() {
        assert!(!ResourceState::Created.is_terminal());
        assert!(!ResourceState::Paused.is_terminal());
        assert!(ResourceState::Exited { exit_code: 1 }.is_terminal());
        assert!(ResourceState::Removed.is_terminal());
    }

    #[tokio::test]
    async fn test_tracker_lifecycle() {
        let tracker = ResourceTracker::new();
        tracker.register(ResourceHandle::new("alice", "pod/alice", NodeRole::Node)).await;

        assert!(!tracker.require("alice").await.unwrap().is_running());
        tracker.update_state("alice", ResourceState::Running).await.unwrap();
        assert!(tracker.get("alice").await.unwrap().is_running());

        let err = tracker.update_state("bob", ResourceState::Running).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_port_mappings_are_stable() {
        let tracker = ResourceTracker::new();
        tracker.register(ResourceHandle::new("alice", "1234", NodeRole::Node)).await;

        assert_eq!(tracker.map_port("alice", 9944, 41000).await.unwrap(), 41000);
        assert_eq!(tracker.map_port("alice", 9944, 42000).await.unwrap(), 41000);
        assert_eq!(tracker.get("alice").await.unwrap().local_port(9944), Some(41000));

        let removed = tracker.clear().await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].state, ResourceState::Removed);
        assert!(tracker.all().await.is_empty());
    }
}
