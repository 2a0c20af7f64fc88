//! `ClusterApi` implementation over the Kubernetes API.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::Api;
use kube::api::{DeleteParams, EvictParams, ListParams, Patch, PatchParams, WatchEvent, WatchParams};
use tracing::debug;

use crate::error::BvrError;
use crate::k8s::{ClusterApi, NodeInfo, PodRef};

/// The API server rejects watch timeouts of 295 seconds and above, so longer
/// readiness deadlines are covered by re-issuing the watch.
const WATCH_REQUEST_TIMEOUT_SECS: u32 = 290;

/// Kubernetes control-plane client.
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_node(&self, name: &str) -> Result<Option<NodeInfo>> {
        let node = self.nodes().get_opt(name).await.map_err(|e| {
            BvrError::ControlPlane(format!("failed to read node '{}': {}", name, e))
        })?;

        Ok(node.map(|n| NodeInfo {
            name: n.metadata.name.unwrap_or_else(|| name.to_string()),
            labels: n.metadata.labels.unwrap_or_default(),
        }))
    }

    async fn cordon_node(&self, name: &str) -> Result<()> {
        let patch = serde_json::json!({
            "spec": {
                "unschedulable": true,
            },
        });

        self.nodes()
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| {
                BvrError::ControlPlane(format!("failed to cordon node '{}': {}", name, e))
            })?;

        Ok(())
    }

    async fn pods_on_node(&self, name: &str) -> Result<Vec<PodRef>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", name));
        let pods = api.list(&params).await.map_err(|e| {
            BvrError::ControlPlane(format!("failed to list pods on node '{}': {}", name, e))
        })?;

        Ok(pods
            .items
            .into_iter()
            .map(|pod| PodRef {
                name: pod.metadata.name.unwrap_or_default(),
                namespace: pod.metadata.namespace.unwrap_or_default(),
                owner_kinds: pod
                    .metadata
                    .owner_references
                    .unwrap_or_default()
                    .into_iter()
                    .map(|owner| owner.kind)
                    .collect(),
            })
            .collect())
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: u32,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: Some(grace_period_seconds),
                ..Default::default()
            }),
            ..Default::default()
        };

        api.evict(name, &params).await.map_err(|e| {
            BvrError::ControlPlane(format!("failed to evict pod {}/{}: {}", namespace, name, e))
        })?;

        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        self.nodes()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| {
                BvrError::ControlPlane(format!("failed to delete node '{}': {}", name, e))
            })?;

        Ok(())
    }

    async fn wait_node_ready(&self, name: &str, timeout: Duration) -> Result<bool> {
        let api = self.nodes();

        let watch = tokio::time::timeout(timeout, async {
            loop {
                let params = WatchParams::default().timeout(WATCH_REQUEST_TIMEOUT_SECS);
                let mut stream = api
                    .watch(&params, "0")
                    .await
                    .map_err(|e| BvrError::ControlPlane(format!("node watch failed: {}", e)))?
                    .boxed();

                while let Some(event) = stream.try_next().await.map_err(|e| {
                    BvrError::ControlPlane(format!("node watch stream error: {}", e))
                })? {
                    match event {
                        WatchEvent::Added(node) | WatchEvent::Modified(node) => {
                            if node.metadata.name.as_deref() == Some(name) && node_is_ready(&node) {
                                return Ok::<_, anyhow::Error>(());
                            }
                        }
                        WatchEvent::Error(e) => {
                            return Err(BvrError::ControlPlane(format!(
                                "node watch error: {}",
                                e.message
                            ))
                            .into());
                        }
                        _ => {}
                    }
                }

                // The server closed the watch before our deadline; reopen it.
                debug!("Node watch for '{}' expired, re-watching", name);
            }
        })
        .await;

        match watch {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => Ok(false),
        }
    }
}

/// Whether the node reports a `Ready=True` condition.
fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};

    fn node_with_conditions(conditions: Vec<NodeCondition>) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(conditions),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_node_is_ready() {
        let node = node_with_conditions(vec![NodeCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]);
        assert!(node_is_ready(&node));
    }

    #[test]
    fn test_node_not_ready() {
        let node = node_with_conditions(vec![NodeCondition {
            type_: "Ready".to_string(),
            status: "False".to_string(),
            ..Default::default()
        }]);
        assert!(!node_is_ready(&node));
    }

    #[test]
    fn test_node_other_condition_only() {
        let node = node_with_conditions(vec![NodeCondition {
            type_: "MemoryPressure".to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]);
        assert!(!node_is_ready(&node));
    }

    #[test]
    fn test_node_without_status() {
        assert!(!node_is_ready(&Node::default()));
    }
}
