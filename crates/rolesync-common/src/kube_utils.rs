//! Kubernetes client helpers

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
///
/// Watch requests use a server-side timeout below this value so idle
/// watches are closed by the API server first.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Server-side watch timeout in seconds, below [`DEFAULT_READ_TIMEOUT`]
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Create a kube client from an optional kubeconfig path
///
/// Without a path the configuration is inferred (in-cluster service account,
/// then `KUBECONFIG`, then `~/.kube/config`).
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to infer config: {}", e),
            )
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Ok(Client::try_from(config)?)
}
