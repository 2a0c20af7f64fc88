//! Drain coordinator: cordon a node and evict its evictable workloads.

use anyhow::Result;
use tracing::{debug, info};

use crate::error::BvrError;
use crate::k8s::{ClusterApi, PodRef};

/// Grace period passed to every eviction.
const EVICTION_GRACE_PERIOD_SECONDS: u32 = 60;

/// Whether a pod should be evicted during a drain.
///
/// Static/mirror pods have no owner references and are left alone; DaemonSet
/// pods would be recreated on the node immediately, so they are skipped too.
pub fn should_evict(pod: &PodRef) -> bool {
    !pod.owner_kinds.is_empty() && !pod.owner_kinds.iter().any(|kind| kind == "DaemonSet")
}

/// Cordon the node and evict its non-DaemonSet, non-static pods.
///
/// Any eviction failure is fatal: the caller must not proceed to delete the
/// node or replace its boot volume.
pub async fn cordon_and_drain(api: &dyn ClusterApi, node: &str) -> Result<()> {
    api.cordon_node(node).await?;
    info!("Cordoned node '{}'", node);

    info!("Starting to drain node '{}'", node);
    let pods = api.pods_on_node(node).await?;
    for pod in &pods {
        if !should_evict(pod) {
            debug!(
                "Skipping pod {}/{} (static or DaemonSet-owned)",
                pod.namespace, pod.name
            );
            continue;
        }

        info!(
            "Evicting pod {}/{} with a grace period of {} seconds",
            pod.namespace, pod.name, EVICTION_GRACE_PERIOD_SECONDS
        );
        api.evict_pod(&pod.namespace, &pod.name, EVICTION_GRACE_PERIOD_SECONDS)
            .await
            .map_err(|e| {
                BvrError::ControlPlane(format!(
                    "failed to evict pod {}/{} from node '{}': {:#}",
                    pod.namespace, pod.name, node, e
                ))
            })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::NodeInfo;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    fn pod(name: &str, owner_kinds: &[&str]) -> PodRef {
        PodRef {
            name: name.to_string(),
            namespace: "default".to_string(),
            owner_kinds: owner_kinds.iter().map(|k| k.to_string()).collect(),
        }
    }

    struct FakeCluster {
        pods: Vec<PodRef>,
        fail_evictions: bool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeCluster {
        fn new(pods: Vec<PodRef>) -> Self {
            Self {
                pods,
                fail_evictions: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl ClusterApi for FakeCluster {
        async fn get_node(&self, _name: &str) -> Result<Option<NodeInfo>> {
            unimplemented!("not used by drain")
        }

        async fn cordon_node(&self, name: &str) -> Result<()> {
            self.log(format!("cordon {}", name));
            Ok(())
        }

        async fn pods_on_node(&self, _name: &str) -> Result<Vec<PodRef>> {
            Ok(self.pods.clone())
        }

        async fn evict_pod(
            &self,
            namespace: &str,
            name: &str,
            grace_period_seconds: u32,
        ) -> Result<()> {
            self.log(format!("evict {}/{} grace={}", namespace, name, grace_period_seconds));
            if self.fail_evictions {
                return Err(BvrError::ControlPlane("eviction blocked".to_string()).into());
            }
            Ok(())
        }

        async fn delete_node(&self, name: &str) -> Result<()> {
            self.log(format!("delete {}", name));
            Ok(())
        }

        async fn wait_node_ready(&self, _name: &str, _timeout: Duration) -> Result<bool> {
            unimplemented!("not used by drain")
        }
    }

    #[test]
    fn test_should_evict_daemonset_pod() {
        assert!(!should_evict(&pod("fluentd-x", &["DaemonSet"])));
    }

    #[test]
    fn test_should_evict_static_pod() {
        assert!(!should_evict(&pod("kube-proxy-node-1", &[])));
    }

    #[test]
    fn test_should_evict_replicaset_pod() {
        assert!(should_evict(&pod("web-abc123", &["ReplicaSet"])));
    }

    #[test]
    fn test_should_evict_mixed_owners_with_daemonset() {
        assert!(!should_evict(&pod("odd-pod", &["ReplicaSet", "DaemonSet"])));
    }

    #[tokio::test]
    async fn test_drain_evicts_each_evictable_pod_once() {
        let cluster = FakeCluster::new(vec![
            pod("web-1", &["ReplicaSet"]),
            pod("logger-1", &["DaemonSet"]),
            pod("etcd-node-1", &[]),
            pod("job-1", &["Job"]),
        ]);

        cordon_and_drain(&cluster, "node-1").await.unwrap();

        let calls = cluster.calls();
        assert_eq!(calls[0], "cordon node-1");
        let evictions: Vec<_> = calls.iter().filter(|c| c.starts_with("evict")).collect();
        assert_eq!(
            evictions,
            vec!["evict default/web-1 grace=60", "evict default/job-1 grace=60"]
        );
    }

    #[tokio::test]
    async fn test_drain_eviction_failure_is_fatal() {
        let mut cluster = FakeCluster::new(vec![pod("web-1", &["ReplicaSet"])]);
        cluster.fail_evictions = true;

        let err = cordon_and_drain(&cluster, "node-1").await.unwrap_err();
        assert!(err.to_string().contains("failed to evict pod default/web-1"));
    }

    #[tokio::test]
    async fn test_drain_without_evictable_pods() {
        let cluster = FakeCluster::new(vec![pod("logger-1", &["DaemonSet"])]);
        cordon_and_drain(&cluster, "node-1").await.unwrap();
        assert_eq!(cluster.calls(), vec!["cordon node-1"]);
    }
}
