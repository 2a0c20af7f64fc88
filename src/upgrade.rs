//! Node upgrade orchestration.
//!
//! Drives one node at a time through the fixed state sequence:
//! resolve, image compatibility check, cloud-init build, then for
//! cluster-managed nodes drain and delete, then the boot volume replacement
//! and the wait for the node to rejoin. The fleet runner fans the per-node
//! state machine out with bounded concurrency and aggregates outcomes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dialoguer::{Confirm, theme::ColorfulTheme};
use futures::stream::{self, StreamExt};
use tracing::{debug, error, info};

use crate::cloudinit::{self, EditStep};
use crate::error::BvrError;
use crate::k8s::{ClusterApi, drain};
use crate::oci::{ComputeApi, Instance, ReplaceRequest, effective_boot_volume_size};

/// Per-run, immutable upgrade parameters shared by all nodes.
#[derive(Debug, Clone)]
pub struct UpgradeSpec {
    pub compartment_id: String,
    /// Replacement image; `None` keeps the instance's current image.
    pub image_ocid: Option<String>,
    /// Replacement boot volume size; `None` keeps the current size.
    pub bv_size_gbs: Option<i64>,
    /// Literal replacement cloud-init, already read from file.
    pub cloud_init: Option<String>,
    pub edit_steps: Vec<EditStep>,
    pub node_metadata: HashMap<String, String>,
    pub ssh_authorized_keys: Option<String>,
    pub remove_previous_boot_volume: bool,
    pub timeout_seconds: u64,
    pub interactive: bool,
}

/// How a node identifier resolved against the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Backed by a Kubernetes node object; drained and deleted before the
    /// replacement, awaited afterwards.
    ClusterManaged,
    /// A bare instance OCID with no cluster node; only the replacement runs.
    Unmanaged,
}

/// A resolved upgrade target. Classification is computed exactly once here
/// and never re-derived.
#[derive(Debug, Clone)]
pub struct NodeTarget {
    pub classification: Classification,
    pub instance: Instance,
}

enum Resolution {
    Target(NodeTarget),
    /// The operator declined the interactive confirmation.
    Declined,
}

/// Terminal status of one node's run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStatus {
    Succeeded,
    Failed,
    /// Declined interactively; not a failure.
    Skipped,
    /// The worker task itself died (panic), not a state-machine error.
    Aborted,
}

/// Per-node result reported to the fleet runner.
#[derive(Debug)]
pub struct NodeOutcome {
    pub node: String,
    pub status: UpgradeStatus,
    /// Whether the final cloud-init differs from the instance's original.
    pub cloud_init_changed: bool,
    pub detail: Option<String>,
}

impl NodeOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, UpgradeStatus::Failed | UpgradeStatus::Aborted)
    }
}

enum StepOutcome {
    Done { cloud_init_changed: bool },
    Declined,
}

/// Per-node go/no-go decision in interactive mode.
pub trait ConfirmNode: Send + Sync {
    fn confirm(&self, node: &str) -> Result<bool>;
}

/// Terminal confirmation prompt.
pub struct TerminalConfirm;

impl ConfirmNode for TerminalConfirm {
    fn confirm(&self, node: &str) -> Result<bool> {
        let proceed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "Continue boot volume replacement for node '{}'?",
                node
            ))
            .default(false)
            .interact()?;
        Ok(proceed)
    }
}

/// Orchestrates boot volume replacement for single nodes.
pub struct Upgrader {
    cluster: Arc<dyn ClusterApi>,
    compute: Arc<dyn ComputeApi>,
    confirm: Arc<dyn ConfirmNode>,
    spec: UpgradeSpec,
}

impl Upgrader {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        compute: Arc<dyn ComputeApi>,
        spec: UpgradeSpec,
    ) -> Self {
        Self {
            cluster,
            compute,
            confirm: Arc::new(TerminalConfirm),
            spec,
        }
    }

    /// Run the full state machine for one node and report its outcome.
    ///
    /// Never returns an error: every fatal condition is folded into the
    /// outcome so one node cannot take down the fleet run.
    pub async fn upgrade_node(&self, node: &str) -> NodeOutcome {
        info!("Starting boot volume replacement for node '{}'", node);

        match self.try_upgrade(node).await {
            Ok(StepOutcome::Done { cloud_init_changed }) => {
                info!(
                    "Successfully executed boot volume replacement for node '{}'",
                    node
                );
                NodeOutcome {
                    node: node.to_string(),
                    status: UpgradeStatus::Succeeded,
                    cloud_init_changed,
                    detail: None,
                }
            }
            Ok(StepOutcome::Declined) => {
                info!("Skipping node '{}'", node);
                NodeOutcome {
                    node: node.to_string(),
                    status: UpgradeStatus::Skipped,
                    cloud_init_changed: false,
                    detail: None,
                }
            }
            Err(e) => {
                error!(
                    "Boot volume replacement for node '{}' failed: {:#}",
                    node, e
                );
                NodeOutcome {
                    node: node.to_string(),
                    status: UpgradeStatus::Failed,
                    cloud_init_changed: false,
                    detail: Some(format!("{:#}", e)),
                }
            }
        }
    }

    async fn try_upgrade(&self, node: &str) -> Result<StepOutcome> {
        let target = match self.resolve(node).await? {
            Resolution::Target(target) => target,
            Resolution::Declined => return Ok(StepOutcome::Declined),
        };
        let instance = &target.instance;

        // Incompatibility must surface before any destructive step.
        if let Some(image) = &self.spec.image_ocid {
            let shapes = self.compute.compatible_shapes(image).await?;
            if !shapes.contains(&instance.shape) {
                return Err(BvrError::ImageIncompatible {
                    image: image.clone(),
                    shape: instance.shape.clone(),
                }
                .into());
            }
        }

        let original_user_data = instance.metadata.get("user_data").cloned();
        let new_user_data = self.build_cloud_init(node, original_user_data.as_deref())?;

        let mut metadata = instance.metadata.clone();
        metadata.extend(self.spec.node_metadata.clone());
        if let Some(user_data) = &new_user_data {
            metadata.insert("user_data".to_string(), user_data.clone());
        }
        if let Some(keys) = &self.spec.ssh_authorized_keys {
            metadata.insert("ssh_authorized_keys".to_string(), keys.clone());
        }

        if target.classification == Classification::ClusterManaged {
            drain::cordon_and_drain(self.cluster.as_ref(), node).await?;
            info!("Successfully drained node '{}'", node);

            // An undeleted stale node object would collide with the replaced
            // instance's rejoin, so a delete failure stops this node here.
            self.cluster.delete_node(node).await?;
            info!("Deleted node '{}' from the cluster", node);
        }

        let size_gbs = match self.spec.bv_size_gbs {
            Some(size) => size,
            None => {
                self.compute
                    .boot_volume_size_gbs(
                        &self.spec.compartment_id,
                        &instance.availability_domain,
                        &instance.id,
                    )
                    .await?
            }
        };
        let image_id = match &self.spec.image_ocid {
            Some(image) => image.clone(),
            None => instance.image_id().ok_or_else(|| {
                BvrError::Cloud(format!("instance {} has no source image", instance.id))
            })?,
        };

        let request = ReplaceRequest {
            image_id,
            metadata,
            size_gbs: effective_boot_volume_size(size_gbs),
            preserve_boot_volume: !self.spec.remove_previous_boot_volume,
        };
        self.compute.update_instance(&instance.id, &request).await?;
        self.compute
            .wait_for_lifecycle_state(&instance.id, "STOPPING")
            .await?;
        info!(
            "Boot volume replacement accepted for instance {}",
            instance.id
        );

        let cloud_init_changed = new_user_data != original_user_data;

        if target.classification == Classification::ClusterManaged {
            info!(
                "Waiting up to {} seconds for node '{}' to become Ready",
                self.spec.timeout_seconds, node
            );
            let ready = self
                .cluster
                .wait_node_ready(node, Duration::from_secs(self.spec.timeout_seconds))
                .await?;
            if !ready {
                return Err(BvrError::ReadyTimeout {
                    node: node.to_string(),
                    seconds: self.spec.timeout_seconds,
                }
                .into());
            }
            info!("Node '{}' is Ready", node);
        }

        Ok(StepOutcome::Done { cloud_init_changed })
    }

    /// Map a node identifier to a concrete instance and classify it.
    async fn resolve(&self, node: &str) -> Result<Resolution> {
        if let Some(node_info) = self.cluster.get_node(node).await? {
            let display_name = node_info
                .labels
                .get("displayName")
                .or_else(|| node_info.labels.get("hostname"))
                .cloned()
                .ok_or_else(|| {
                    BvrError::NodeResolution(format!(
                        "node '{}' has neither a displayName nor a hostname label",
                        node
                    ))
                })?;

            let mut instances = self
                .compute
                .list_running_instances(&self.spec.compartment_id, &display_name)
                .await?;
            let instance = match instances.len() {
                0 => {
                    return Err(BvrError::NodeResolution(format!(
                        "no RUNNING instance named '{}' in compartment {} for node '{}'",
                        display_name, self.spec.compartment_id, node
                    ))
                    .into());
                }
                1 => instances.remove(0),
                n => {
                    return Err(BvrError::NodeResolution(format!(
                        "ambiguous: {} RUNNING instances named '{}' in compartment {}",
                        n, display_name, self.spec.compartment_id
                    ))
                    .into());
                }
            };

            info!("Identified instance {} for node '{}'", instance.id, node);

            if self.spec.interactive && !self.confirm.confirm(node)? {
                return Ok(Resolution::Declined);
            }

            return Ok(Resolution::Target(NodeTarget {
                classification: Classification::ClusterManaged,
                instance,
            }));
        }

        if node.starts_with("ocid1.instance") {
            let instance = self.compute.get_instance(node).await?;
            return Ok(Resolution::Target(NodeTarget {
                classification: Classification::Unmanaged,
                instance,
            }));
        }

        Err(BvrError::NodeResolution(format!(
            "'{}' matches no cluster node and is not an instance OCID",
            node
        ))
        .into())
    }

    /// Choose the cloud-init for the replacement, in priority order:
    /// literal replacement, edit pipeline over the existing blob, unchanged.
    fn build_cloud_init(&self, node: &str, original: Option<&str>) -> Result<Option<String>> {
        if let Some(text) = &self.spec.cloud_init {
            return Ok(Some(cloudinit::encode(text)?));
        }

        if !self.spec.edit_steps.is_empty() {
            let original = original.ok_or_else(|| {
                BvrError::CloudInit(format!(
                    "instance for node '{}' has no user_data to edit",
                    node
                ))
            })?;
            let plaintext = cloudinit::decode(original)?;
            debug!("Cloud-init for node '{}' before changes:\n{}", node, plaintext);
            let edited = cloudinit::apply_steps(&plaintext, &self.spec.edit_steps);
            debug!("Cloud-init for node '{}' after changes:\n{}", node, edited);
            return Ok(Some(cloudinit::encode(&edited)?));
        }

        debug!("Cloud-init for node '{}' left unchanged", node);
        Ok(original.map(str::to_owned))
    }
}

/// Run the upgrade for every node with bounded concurrency.
///
/// Each node runs on its own task; a panicked task surfaces as an `Aborted`
/// outcome after all in-flight nodes have finished, never as a process exit
/// from inside a worker.
pub async fn run_fleet(
    upgrader: Arc<Upgrader>,
    nodes: &[String],
    parallelism: usize,
) -> Vec<NodeOutcome> {
    let tasks = nodes.iter().cloned().map(|node| {
        let upgrader = Arc::clone(&upgrader);
        async move {
            let handle = tokio::spawn({
                let upgrader = Arc::clone(&upgrader);
                let node = node.clone();
                async move { upgrader.upgrade_node(&node).await }
            });

            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => NodeOutcome {
                    node,
                    status: UpgradeStatus::Aborted,
                    cloud_init_changed: false,
                    detail: Some(format!("worker task failed: {}", e)),
                },
            }
        }
    });

    stream::iter(tasks)
        .buffer_unordered(parallelism.max(1))
        .collect()
        .await
}
