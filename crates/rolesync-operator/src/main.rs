//! rolesync - keeps Istio authorization objects in sync with PolicyDomains

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use kube::CustomResourceExt;
use tokio_util::sync::CancellationToken;

use rolesync_common::crd::{ClusterRbacConfig, PolicyDomain, ServiceRole, ServiceRoleBinding};
use rolesync_common::kube_utils::create_client;
use rolesync_common::telemetry::{init_telemetry, TelemetryConfig};
use rolesync_common::{Error, DEFAULT_DNS_SUFFIX};
use rolesync_controller::{Controller, ControllerConfig};

/// rolesync - reconciles signed policy domains into cluster authorization objects
#[derive(Parser, Debug)]
#[command(name = "rolesync", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Cluster DNS suffix used in service hostnames
    #[arg(long, env = "ROLESYNC_DNS_SUFFIX", default_value = DEFAULT_DNS_SUFFIX)]
    dns_suffix: String,

    /// Interval between full PolicyDomain resyncs
    #[arg(
        long,
        env = "ROLESYNC_RESYNC_INTERVAL",
        default_value = "1h",
        value_parser = humantime::parse_duration
    )]
    resync_interval: Duration,

    /// Interval between ClusterRbacConfig syncs
    #[arg(
        long,
        env = "ROLESYNC_CRC_RESYNC_INTERVAL",
        default_value = "1m",
        value_parser = humantime::parse_duration
    )]
    crc_resync_interval: Duration,

    /// Number of concurrent reconciliation workers
    #[arg(
        long,
        env = "ROLESYNC_WORKERS",
        default_value_t = 1,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    workers: u16,

    /// Bound on the initial cache sync
    #[arg(
        long,
        env = "ROLESYNC_CACHE_SYNC_TIMEOUT",
        default_value = "5m",
        value_parser = humantime::parse_duration
    )]
    cache_sync_timeout: Duration,

    /// Path to a single kubeconfig file; inferred when omitted
    ///
    /// `KUBECONFIG` itself is left to config inference, which understands
    /// its colon-separated list form.
    #[arg(long, env = "ROLESYNC_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            dns_suffix: self.dns_suffix.clone(),
            resync_interval: self.resync_interval,
            crc_resync_interval: self.crc_resync_interval,
            workers: usize::from(self.workers),
            cache_sync_timeout: self.cache_sync_timeout,
        }
    }
}

fn print_crds() -> anyhow::Result<()> {
    let crds = [
        PolicyDomain::crd(),
        ServiceRole::crd(),
        ServiceRoleBinding::crd(),
        ClusterRbacConfig::crd(),
    ];
    for crd in crds {
        let yaml = serde_yaml::to_string(&crd).map_err(|e| {
            Error::serialization_for_kind(crd.spec.names.kind.clone(), e.to_string())
        })?;
        println!("---\n{yaml}");
    }
    Ok(())
}

/// Cancel `token` on Ctrl-C or SIGTERM
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("Shutdown signal received");
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        return print_crds();
    }

    init_telemetry(TelemetryConfig::default())?;

    let client = create_client(cli.kubeconfig.as_deref()).await?;
    let controller = Controller::new(client, cli.controller_config());

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());

    match controller.run(cancel).await {
        Ok(()) => Ok(()),
        Err(e @ Error::CacheSync { .. }) => {
            tracing::error!(error = %e, "Controller failed to start");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}
