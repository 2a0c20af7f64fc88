//! CLI configuration and argument parsing.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use crate::cloudinit::EditStep;
use crate::error::BvrError;
use crate::oci::AuthMode;
use crate::upgrade::UpgradeSpec;

/// Boot volume replacement for OKE self-managed nodes.
///
/// Replaces the boot volume image and cloud-init of the instances backing the
/// given nodes, draining and re-joining cluster-managed nodes along the way.
#[derive(Parser, Debug, Clone)]
#[command(name = "bvr")]
#[command(about = "Boot volume replacement for OKE self-managed nodes")]
#[command(version)]
pub struct Args {
    /// Kubernetes node name(s) or instance OCID(s) to replace
    #[arg(required = true)]
    pub nodes: Vec<String>,

    /// Compartment OCID of the cluster
    #[arg(short = 'c', long)]
    pub compartment_id: String,

    /// New image OCID for the boot volume (defaults to the current image)
    #[arg(long)]
    pub image_ocid: Option<String>,

    /// File with replacement cloud-init (defaults to the existing cloud-init)
    #[arg(long)]
    pub cloud_init_file: Option<PathBuf>,

    /// New SSH public key(s) to configure on the node
    #[arg(long)]
    pub ssh_authorized_keys: Option<String>,

    /// Metadata entries to add to the new node (JSON object)
    #[arg(long, default_value = "{}")]
    pub node_metadata: String,

    /// Desired Kubernetes version, for nodes created by the OCI OKE Terraform
    /// modules (e.g. v1.33.1)
    #[arg(long)]
    pub desired_k8s_version: Option<String>,

    /// Size of the new boot volume in GBs (defaults to the existing size)
    #[arg(long)]
    pub bv_size: Option<i64>,

    /// Remove the previous boot volume instead of preserving it
    #[arg(long, default_value = "false")]
    pub remove_previous_boot_volume: bool,

    /// How many nodes to upgrade in parallel (not recommended with --interactive)
    #[arg(short, long, default_value_t = 1)]
    pub parallelism: usize,

    /// Timeout in seconds for a node to rejoin the cluster after replacement
    #[arg(long, default_value_t = 900)]
    pub timeout_seconds: u64,

    /// Confirm each node before replacing its boot volume
    #[arg(long, default_value = "false")]
    pub interactive: bool,

    /// OCI authentication mode
    #[arg(long, value_enum, default_value_t = AuthMode::ConfigFile)]
    pub auth: AuthMode,

    /// OCI region (required with --auth instance-principal)
    #[arg(long)]
    pub region: Option<String>,

    /// Path to the OCI config file (defaults to ~/.oci/config)
    #[arg(long)]
    pub oci_config_file: Option<String>,

    /// OCI config profile to use
    #[arg(long, default_value = "DEFAULT")]
    pub oci_profile: String,

    /// Path to the kubeconfig file (defaults to ~/.kube/config)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use (defaults to the current context)
    #[arg(long)]
    pub context: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "BVR_LOG_LEVEL")]
    pub log_level: String,
}

/// Application configuration derived from CLI args.
#[derive(Debug, Clone)]
pub struct Config {
    pub nodes: Vec<String>,
    pub parallelism: usize,
    pub auth: AuthMode,
    pub region: Option<String>,
    pub oci_config_file: Option<String>,
    pub oci_profile: String,
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    pub log_level: String,
    pub spec: UpgradeSpec,
}

impl Config {
    /// Create config from CLI arguments.
    ///
    /// Parses the metadata JSON, reads the replacement cloud-init file, and
    /// derives the canned edit pipeline from `--desired-k8s-version`.
    pub fn from_args(args: Args) -> Result<Self> {
        let mut node_metadata: HashMap<String, String> =
            serde_json::from_str(&args.node_metadata)
                .context("--node-metadata must be a JSON object of string values")?;

        let mut edit_steps = Vec::new();
        if let Some(version) = &args.desired_k8s_version {
            if !version.to_lowercase().starts_with("v1") {
                return Err(BvrError::InvalidVersion(version.clone()).into());
            }
            edit_steps.push(EditStep::VersionSubstitution {
                version: version.clone(),
            });
            node_metadata.insert("oke-k8s-version".to_string(), version.clone());
        }

        let cloud_init = match &args.cloud_init_file {
            Some(path) => Some(std::fs::read_to_string(path).with_context(|| {
                format!("Failed to read cloud-init file {}", path.display())
            })?),
            None => None,
        };

        if args.auth == AuthMode::InstancePrincipal && args.region.is_none() {
            return Err(anyhow::anyhow!(
                "--region is required with --auth instance-principal"
            ));
        }

        Ok(Self {
            nodes: args.nodes,
            parallelism: args.parallelism.max(1),
            auth: args.auth,
            region: args.region,
            oci_config_file: args.oci_config_file,
            oci_profile: args.oci_profile,
            kubeconfig: args.kubeconfig,
            context: args.context,
            log_level: args.log_level,
            spec: UpgradeSpec {
                compartment_id: args.compartment_id,
                image_ocid: args.image_ocid,
                bv_size_gbs: args.bv_size,
                cloud_init,
                edit_steps,
                node_metadata,
                ssh_authorized_keys: args.ssh_authorized_keys,
                remove_previous_boot_volume: args.remove_previous_boot_volume,
                timeout_seconds: args.timeout_seconds,
                interactive: args.interactive,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_args() -> Args {
        Args {
            nodes: vec!["worker-1".to_string()],
            compartment_id: "ocid1.compartment.oc1..aaa".to_string(),
            image_ocid: None,
            cloud_init_file: None,
            ssh_authorized_keys: None,
            node_metadata: "{}".to_string(),
            desired_k8s_version: None,
            bv_size: None,
            remove_previous_boot_volume: false,
            parallelism: 1,
            timeout_seconds: 900,
            interactive: false,
            auth: AuthMode::ConfigFile,
            region: None,
            oci_config_file: None,
            oci_profile: "DEFAULT".to_string(),
            kubeconfig: None,
            context: None,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_node_metadata_parsing() {
        let mut args = create_test_args();
        args.node_metadata = r#"{"team": "hpc", "tier": "gpu"}"#.to_string();

        let config = Config::from_args(args).unwrap();
        assert_eq!(config.spec.node_metadata.get("team").unwrap(), "hpc");
        assert_eq!(config.spec.node_metadata.get("tier").unwrap(), "gpu");
    }

    #[test]
    fn test_node_metadata_invalid_json() {
        let mut args = create_test_args();
        args.node_metadata = "not-json".to_string();
        assert!(Config::from_args(args).is_err());
    }

    #[test]
    fn test_desired_version_derives_edit_pipeline() {
        let mut args = create_test_args();
        args.desired_k8s_version = Some("v1.33.1".to_string());

        let config = Config::from_args(args).unwrap();
        assert_eq!(config.spec.edit_steps.len(), 1);
        assert_eq!(
            config.spec.node_metadata.get("oke-k8s-version").unwrap(),
            "v1.33.1"
        );
    }

    #[test]
    fn test_desired_version_invalid_format() {
        let mut args = create_test_args();
        args.desired_k8s_version = Some("1.33.1".to_string());

        let err = Config::from_args(args).unwrap_err();
        assert!(err.to_string().contains("Invalid Kubernetes version"));
    }

    #[test]
    fn test_instance_principal_requires_region() {
        let mut args = create_test_args();
        args.auth = AuthMode::InstancePrincipal;
        assert!(Config::from_args(args).is_err());

        let mut args = create_test_args();
        args.auth = AuthMode::InstancePrincipal;
        args.region = Some("us-phoenix-1".to_string());
        assert!(Config::from_args(args).is_ok());
    }

    #[test]
    fn test_kubeconfig_passthrough() {
        let mut args = create_test_args();
        args.kubeconfig = Some(PathBuf::from("/tmp/kubeconfig"));
        args.context = Some("staging".to_string());

        let config = Config::from_args(args).unwrap();
        assert_eq!(config.kubeconfig.unwrap(), PathBuf::from("/tmp/kubeconfig"));
        assert_eq!(config.context.unwrap(), "staging");
    }

    #[test]
    fn test_parallelism_floor() {
        let mut args = create_test_args();
        args.parallelism = 0;
        let config = Config::from_args(args).unwrap();
        assert_eq!(config.parallelism, 1);
    }
}
