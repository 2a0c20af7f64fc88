//! Kubernetes control-plane capability used by the upgrade orchestrator.

pub mod client;
pub mod drain;
pub mod node;

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

/// Cluster node identity and labels.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// A pod scheduled on a node, reduced to what drain filtering needs.
#[derive(Debug, Clone)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
    /// Kinds of the pod's owner references. Empty for static/mirror pods.
    pub owner_kinds: Vec<String>,
}

/// Control-plane operations used during a node upgrade.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Read a node by name. `None` when no such node exists.
    async fn get_node(&self, name: &str) -> Result<Option<NodeInfo>>;

    /// Mark the node unschedulable.
    async fn cordon_node(&self, name: &str) -> Result<()>;

    /// List the pods currently scheduled on the node.
    async fn pods_on_node(&self, name: &str) -> Result<Vec<PodRef>>;

    /// Request a graceful eviction of a pod.
    async fn evict_pod(&self, namespace: &str, name: &str, grace_period_seconds: u32)
    -> Result<()>;

    /// Remove the node object from the cluster.
    async fn delete_node(&self, name: &str) -> Result<()>;

    /// Watch node events until `name` reports `Ready=True` or the timeout
    /// elapses. `Ok(false)` means the deadline passed without such an event.
    async fn wait_node_ready(&self, name: &str, timeout: Duration) -> Result<bool>;
}
