//! Custom error types for bvr.

use thiserror::Error;

/// Errors that can occur during boot volume replacement.
#[derive(Error, Debug)]
pub enum BvrError {
    #[error("Node resolution failed: {0}")]
    NodeResolution(String),

    #[error("Image {image} is not compatible with shape {shape}")]
    ImageIncompatible { image: String, shape: String },

    #[error("Cloud-init error: {0}")]
    CloudInit(String),

    #[error("Kubernetes API error: {0}")]
    ControlPlane(String),

    #[error("OCI API error: {0}")]
    Cloud(String),

    #[error("Timed out waiting for node {node} to become Ready after {seconds} seconds")]
    ReadyTimeout { node: String, seconds: u64 },

    #[error("Kubeconfig error: {0}")]
    Kubeconfig(String),

    #[error("oci CLI error: {0}")]
    OciCli(String),

    #[error("Invalid Kubernetes version format: {0} (expected a version starting with 'v1')")]
    InvalidVersion(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_node_resolution() {
        let err = BvrError::NodeResolution("no cluster node named worker-1".to_string());
        assert_eq!(
            err.to_string(),
            "Node resolution failed: no cluster node named worker-1"
        );
    }

    #[test]
    fn test_error_display_image_incompatible() {
        let err = BvrError::ImageIncompatible {
            image: "ocid1.image.oc1..aaa".to_string(),
            shape: "VM.Standard.E4.Flex".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Image ocid1.image.oc1..aaa is not compatible with shape VM.Standard.E4.Flex"
        );
    }

    #[test]
    fn test_error_display_ready_timeout() {
        let err = BvrError::ReadyTimeout {
            node: "worker-1".to_string(),
            seconds: 900,
        };
        assert_eq!(
            err.to_string(),
            "Timed out waiting for node worker-1 to become Ready after 900 seconds"
        );
    }

    #[test]
    fn test_error_display_invalid_version() {
        let err = BvrError::InvalidVersion("1.33.1".to_string());
        assert!(err.to_string().contains("starting with 'v1'"));
    }
}
