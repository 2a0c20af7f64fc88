//! `ComputeApi` implementation over the official `oci` CLI.
//!
//! Every operation shells out to `oci ... --output json` and parses the
//! `data` payload, so authentication (config file profile or instance
//! principal) is handled by the CLI itself.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::BvrError;
use crate::oci::{AuthMode, ComputeApi, Instance, ReplaceRequest};

/// Interval between lifecycle state polls.
const LIFECYCLE_POLL_SECS: u64 = 10;
/// Upper bound on the lifecycle state wait.
const LIFECYCLE_WAIT_MAX_SECS: u64 = 600;

/// OCI client backed by the `oci` CLI.
pub struct OciCli {
    auth: AuthMode,
    region: Option<String>,
    config_file: Option<String>,
    profile: String,
}

#[derive(Debug, Deserialize)]
struct CompatibilityEntry {
    shape: String,
}

#[derive(Debug, Deserialize)]
struct BootVolumeAttachment {
    #[serde(rename = "boot-volume-id")]
    boot_volume_id: String,
}

#[derive(Debug, Deserialize)]
struct BootVolume {
    #[serde(rename = "size-in-gbs")]
    size_in_gbs: i64,
}

impl OciCli {
    pub fn new(
        auth: AuthMode,
        region: Option<String>,
        config_file: Option<String>,
        profile: String,
    ) -> Self {
        Self {
            auth,
            region,
            config_file,
            profile,
        }
    }

    /// Global flags appended to every invocation.
    fn base_args(&self) -> Vec<String> {
        let mut args = vec!["--output".to_string(), "json".to_string()];

        match self.auth {
            AuthMode::InstancePrincipal => {
                args.push("--auth".to_string());
                args.push("instance_principal".to_string());
            }
            AuthMode::ConfigFile => {
                if let Some(config_file) = &self.config_file {
                    args.push("--config-file".to_string());
                    args.push(config_file.clone());
                }
                args.push("--profile".to_string());
                args.push(self.profile.clone());
            }
        }

        if let Some(region) = &self.region {
            args.push("--region".to_string());
            args.push(region.clone());
        }

        args
    }

    /// Run `oci` with the given subcommand arguments and parse stdout as JSON.
    ///
    /// An empty stdout (the CLI prints nothing for empty list results) is
    /// returned as `Value::Null`.
    async fn invoke(&self, args: &[&str]) -> Result<Value> {
        let mut cmd = tokio::process::Command::new("oci");
        cmd.args(args).args(self.base_args());

        debug!("Running: oci {}", args.join(" "));

        let output = cmd
            .output()
            .await
            .context("Failed to execute 'oci'. Is the OCI CLI installed?")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BvrError::OciCli(format!(
                "oci {} failed: {}",
                args.join(" "),
                stderr.trim()
            ))
            .into());
        }

        if output.stdout.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Value::Null);
        }

        serde_json::from_slice(&output.stdout).context("Failed to parse oci CLI JSON output")
    }

    /// Extract the `data` payload from a CLI response.
    fn data(value: Value) -> Result<Value> {
        match value {
            Value::Null => Ok(Value::Null),
            mut other => match other.get_mut("data") {
                Some(data) => Ok(data.take()),
                None => Err(BvrError::OciCli("missing 'data' in oci CLI output".to_string()).into()),
            },
        }
    }
}

#[async_trait]
impl ComputeApi for OciCli {
    async fn list_running_instances(
        &self,
        compartment_id: &str,
        display_name: &str,
    ) -> Result<Vec<Instance>> {
        let value = self
            .invoke(&[
                "compute",
                "instance",
                "list",
                "--compartment-id",
                compartment_id,
                "--display-name",
                display_name,
                "--lifecycle-state",
                "RUNNING",
                "--all",
            ])
            .await?;

        match Self::data(value)? {
            Value::Null => Ok(Vec::new()),
            data => serde_json::from_value(data).context("Failed to parse instance list"),
        }
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Instance> {
        let value = self
            .invoke(&["compute", "instance", "get", "--instance-id", instance_id])
            .await?;
        serde_json::from_value(Self::data(value)?).context("Failed to parse instance")
    }

    async fn compatible_shapes(&self, image_id: &str) -> Result<Vec<String>> {
        let value = self
            .invoke(&[
                "compute",
                "image-shape-compatibility-entry",
                "list",
                "--image-id",
                image_id,
                "--all",
            ])
            .await?;

        let entries: Vec<CompatibilityEntry> = match Self::data(value)? {
            Value::Null => Vec::new(),
            data => serde_json::from_value(data)
                .context("Failed to parse image shape compatibility entries")?,
        };
        Ok(entries.into_iter().map(|entry| entry.shape).collect())
    }

    async fn boot_volume_size_gbs(
        &self,
        compartment_id: &str,
        availability_domain: &str,
        instance_id: &str,
    ) -> Result<i64> {
        let value = self
            .invoke(&[
                "compute",
                "boot-volume-attachment",
                "list",
                "--availability-domain",
                availability_domain,
                "--compartment-id",
                compartment_id,
                "--instance-id",
                instance_id,
            ])
            .await?;

        let attachments: Vec<BootVolumeAttachment> = match Self::data(value)? {
            Value::Null => Vec::new(),
            data => serde_json::from_value(data).context("Failed to parse boot volume attachments")?,
        };
        let attachment = attachments.into_iter().next().ok_or_else(|| {
            BvrError::Cloud(format!(
                "no boot volume attachment found for instance {}",
                instance_id
            ))
        })?;

        let value = self
            .invoke(&[
                "bv",
                "boot-volume",
                "get",
                "--boot-volume-id",
                &attachment.boot_volume_id,
            ])
            .await?;
        let volume: BootVolume =
            serde_json::from_value(Self::data(value)?).context("Failed to parse boot volume")?;

        debug!(
            "Current boot volume size for instance {} is {} GBs",
            instance_id, volume.size_in_gbs
        );
        Ok(volume.size_in_gbs)
    }

    async fn update_instance(&self, instance_id: &str, request: &ReplaceRequest) -> Result<()> {
        let source_details = serde_json::json!({
            "sourceType": "image",
            "imageId": request.image_id,
            "isPreserveBootVolumeEnabled": request.preserve_boot_volume,
            "bootVolumeSizeInGBs": request.size_gbs,
        })
        .to_string();
        let metadata = serde_json::to_string(&request.metadata)
            .context("Failed to serialize instance metadata")?;

        self.invoke(&[
            "compute",
            "instance",
            "update",
            "--instance-id",
            instance_id,
            "--source-details",
            &source_details,
            "--metadata",
            &metadata,
            "--force",
        ])
        .await
        .map_err(|e| BvrError::Cloud(format!("boot volume replacement rejected: {:#}", e)))?;

        Ok(())
    }

    async fn wait_for_lifecycle_state(&self, instance_id: &str, state: &str) -> Result<()> {
        let mut waited = 0;
        loop {
            let instance = self.get_instance(instance_id).await.map_err(|e| {
                BvrError::Cloud(format!(
                    "instance {} disappeared while waiting for {}: {:#}",
                    instance_id, state, e
                ))
            })?;
            if instance.lifecycle_state == state {
                return Ok(());
            }

            if waited >= LIFECYCLE_WAIT_MAX_SECS {
                return Err(BvrError::Cloud(format!(
                    "instance {} did not reach {} within {} seconds (last state: {})",
                    instance_id, state, LIFECYCLE_WAIT_MAX_SECS, instance.lifecycle_state
                ))
                .into());
            }

            debug!(
                "Instance {} is {}, waiting for {}",
                instance_id, instance.lifecycle_state, state
            );
            tokio::time::sleep(Duration::from_secs(LIFECYCLE_POLL_SECS)).await;
            waited += LIFECYCLE_POLL_SECS;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_args_config_file() {
        let client = OciCli::new(AuthMode::ConfigFile, None, None, "DEFAULT".to_string());
        let args = client.base_args();
        assert_eq!(args, vec!["--output", "json", "--profile", "DEFAULT"]);
    }

    #[test]
    fn test_base_args_config_file_with_overrides() {
        let client = OciCli::new(
            AuthMode::ConfigFile,
            Some("us-phoenix-1".to_string()),
            Some("/tmp/oci-config".to_string()),
            "PROD".to_string(),
        );
        let args = client.base_args();
        assert_eq!(
            args,
            vec![
                "--output",
                "json",
                "--config-file",
                "/tmp/oci-config",
                "--profile",
                "PROD",
                "--region",
                "us-phoenix-1"
            ]
        );
    }

    #[test]
    fn test_base_args_instance_principal() {
        let client = OciCli::new(
            AuthMode::InstancePrincipal,
            Some("us-ashburn-1".to_string()),
            None,
            "DEFAULT".to_string(),
        );
        let args = client.base_args();
        assert_eq!(
            args,
            vec![
                "--output",
                "json",
                "--auth",
                "instance_principal",
                "--region",
                "us-ashburn-1"
            ]
        );
    }

    #[test]
    fn test_data_extracts_payload() {
        let value = serde_json::json!({"data": [{"shape": "VM.Standard.E4.Flex"}]});
        let data = OciCli::data(value).unwrap();
        assert!(data.is_array());
    }

    #[test]
    fn test_data_missing_payload() {
        let value = serde_json::json!({"status": "ok"});
        assert!(OciCli::data(value).is_err());
    }

    #[test]
    fn test_data_null_passthrough() {
        assert!(OciCli::data(Value::Null).unwrap().is_null());
    }
}
