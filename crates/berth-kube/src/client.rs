//! Kube client construction

use std::path::Path;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use berth_common::Error;

/// Create a kube client from an optional kubeconfig path.
///
/// With `None`, client inference applies: `$KUBECONFIG`, then
/// `~/.kube/config`, then the in-cluster service account.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "kube",
                    format!("failed to read kubeconfig {}: {e}", path.display()),
                )
            })?;
            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context("kube", format!("failed to load kubeconfig: {e}"))
                })?;
            Client::try_from(config).map_err(Error::from)
        }
        None => Client::try_default().await.map_err(Error::from),
    }
}
