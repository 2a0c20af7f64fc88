//! OCI compute capability: instance lookup, image compatibility, boot
//! volume sizing, and the destructive boot volume replacement call.

pub mod cli;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use clap::ValueEnum;
use serde::Deserialize;

/// Floor required by the boot volume service.
pub const MIN_BOOT_VOLUME_SIZE_GBS: i64 = 50;

/// OCI authentication mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AuthMode {
    /// API key from the OCI config file.
    ConfigFile,
    /// Ambient instance principal identity.
    InstancePrincipal,
}

/// A compute instance as returned by the OCI API.
#[derive(Debug, Clone, Deserialize)]
pub struct Instance {
    pub id: String,
    #[serde(rename = "display-name")]
    pub display_name: String,
    pub shape: String,
    #[serde(rename = "availability-domain")]
    pub availability_domain: String,
    #[serde(rename = "lifecycle-state")]
    pub lifecycle_state: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(rename = "source-details", default)]
    pub source_details: Option<SourceDetails>,
}

/// Source the instance was launched from.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceDetails {
    #[serde(rename = "source-type")]
    pub source_type: String,
    #[serde(rename = "image-id", default)]
    pub image_id: Option<String>,
}

impl Instance {
    /// OCID of the image this instance was launched from, if image-sourced.
    pub fn image_id(&self) -> Option<String> {
        self.source_details
            .as_ref()
            .and_then(|source| source.image_id.clone())
    }
}

/// Parameters for the boot volume replacement call.
#[derive(Debug, Clone)]
pub struct ReplaceRequest {
    pub image_id: String,
    pub metadata: HashMap<String, String>,
    pub size_gbs: i64,
    pub preserve_boot_volume: bool,
}

/// Apply the service-side size floor to a requested boot volume size.
pub fn effective_boot_volume_size(requested_gbs: i64) -> i64 {
    requested_gbs.max(MIN_BOOT_VOLUME_SIZE_GBS)
}

/// OCI infrastructure operations used by the upgrade orchestrator.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// List RUNNING instances in the compartment with the given display name.
    async fn list_running_instances(
        &self,
        compartment_id: &str,
        display_name: &str,
    ) -> Result<Vec<Instance>>;

    /// Fetch a single instance by OCID.
    async fn get_instance(&self, instance_id: &str) -> Result<Instance>;

    /// Shapes the given image can boot on.
    async fn compatible_shapes(&self, image_id: &str) -> Result<Vec<String>>;

    /// Current boot volume size of the instance, in GBs.
    async fn boot_volume_size_gbs(
        &self,
        compartment_id: &str,
        availability_domain: &str,
        instance_id: &str,
    ) -> Result<i64>;

    /// Issue the boot volume replacement. Destructive; any non-success
    /// response is fatal.
    async fn update_instance(&self, instance_id: &str, request: &ReplaceRequest) -> Result<()>;

    /// Block until the instance reports the given lifecycle state.
    async fn wait_for_lifecycle_state(&self, instance_id: &str, state: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_floor_below_minimum() {
        assert_eq!(effective_boot_volume_size(0), 50);
        assert_eq!(effective_boot_volume_size(20), 50);
        assert_eq!(effective_boot_volume_size(49), 50);
    }

    #[test]
    fn test_size_floor_at_or_above_minimum() {
        assert_eq!(effective_boot_volume_size(50), 50);
        assert_eq!(effective_boot_volume_size(51), 51);
        assert_eq!(effective_boot_volume_size(2048), 2048);
    }

    #[test]
    fn test_instance_deserialization() {
        let json = serde_json::json!({
            "id": "ocid1.instance.oc1..aaa",
            "display-name": "oke-worker-1",
            "shape": "VM.Standard.E4.Flex",
            "availability-domain": "Uocm:PHX-AD-1",
            "lifecycle-state": "RUNNING",
            "metadata": {
                "user_data": "H4sIAAAA",
                "ssh_authorized_keys": "ssh-rsa AAAA"
            },
            "source-details": {
                "source-type": "image",
                "image-id": "ocid1.image.oc1..bbb"
            },
            "region": "phx"
        });

        let instance: Instance = serde_json::from_value(json).unwrap();
        assert_eq!(instance.id, "ocid1.instance.oc1..aaa");
        assert_eq!(instance.display_name, "oke-worker-1");
        assert_eq!(instance.lifecycle_state, "RUNNING");
        assert_eq!(instance.metadata.get("user_data").unwrap(), "H4sIAAAA");
        assert_eq!(instance.image_id().unwrap(), "ocid1.image.oc1..bbb");
    }

    #[test]
    fn test_instance_without_source_details() {
        let json = serde_json::json!({
            "id": "ocid1.instance.oc1..aaa",
            "display-name": "oke-worker-1",
            "shape": "VM.Standard.E4.Flex",
            "availability-domain": "Uocm:PHX-AD-1",
            "lifecycle-state": "RUNNING"
        });

        let instance: Instance = serde_json::from_value(json).unwrap();
        assert!(instance.metadata.is_empty());
        assert!(instance.image_id().is_none());
    }
}
