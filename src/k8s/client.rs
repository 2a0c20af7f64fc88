//! Kubernetes client construction.

use std::path::Path;

use anyhow::Result;
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::debug;

use crate::error::BvrError;

/// Build the client used for node resolution, drain, and readiness watches.
///
/// With neither a kubeconfig path nor a context, in-cluster configuration or
/// the default kubeconfig applies. An explicit path selects that file's
/// current-context unless a context is also given.
pub async fn build_client(
    kubeconfig: Option<&Path>,
    context: Option<&str>,
) -> Result<kube::Client> {
    if kubeconfig.is_none() && context.is_none() {
        debug!("Using default kubeconfig");
        return kube::Client::try_default()
            .await
            .map_err(|e| BvrError::Kubeconfig(e.to_string()).into());
    }

    let file = match kubeconfig {
        Some(path) => {
            debug!("Reading kubeconfig from {}", path.display());
            Kubeconfig::read_from(path)
                .map_err(|e| BvrError::Kubeconfig(format!("{}: {}", path.display(), e)))?
        }
        None => Kubeconfig::read().map_err(|e| BvrError::Kubeconfig(e.to_string()))?,
    };

    if let Some(ctx) = context {
        debug!("Using kubeconfig context: {}", ctx);
    }
    let options = KubeConfigOptions {
        context: context.map(String::from),
        ..Default::default()
    };
    let config = kube::Config::from_custom_kubeconfig(file, &options)
        .await
        .map_err(|e| BvrError::Kubeconfig(e.to_string()))?;

    let client =
        kube::Client::try_from(config).map_err(|e| BvrError::Kubeconfig(e.to_string()))?;
    Ok(client)
}
