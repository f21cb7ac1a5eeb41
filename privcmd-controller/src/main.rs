//! privcmd-controller: runs privileged commands requested through pod
//! annotations.
//!
//! This daemon runs once per cluster and:
//! - Watches all pods for the privileged command annotations
//! - Starts a privileged pod next to the target pod
//! - Runs the requested command inside the target container's namespaces
//! - Reports progress back through the status annotation

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use privcmd_controller::{ContainerRuntime, Controller, ControllerConfig, KubePodClient};

/// Privileged command controller
#[derive(Parser, Debug)]
#[command(name = "privcmd-controller", version, about)]
struct Args {
    /// Path to a kubeconfig file (in-cluster configuration if omitted)
    #[arg(short = 'c', long)]
    kubeconfig: Option<PathBuf>,

    /// Image of the privileged container
    #[arg(short = 'i', long)]
    privileged_pod_image: String,

    /// Namespace to create privileged pods in
    #[arg(short = 'n', long, default_value = ControllerConfig::DEFAULT_NAMESPACE)]
    namespace: String,

    /// Service account for privileged pods
    #[arg(short = 's', long, default_value = ControllerConfig::DEFAULT_SERVICE_ACCOUNT)]
    service_account: String,

    /// Seconds to wait for a privileged pod to be running
    #[arg(short = 't', long, default_value = "300")]
    priv_pod_timeout: u64,

    /// Seconds a remote command may run
    #[arg(long, default_value = "600")]
    exec_timeout: u64,

    /// Seconds to keep the done status visible before cleaning up
    #[arg(long, default_value = "1")]
    done_grace_period: u64,

    /// Container runtime of the cluster nodes
    #[arg(long, value_enum, default_value_t = ContainerRuntime::Docker)]
    container_runtime: ContainerRuntime,
}

impl Args {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            image: self.privileged_pod_image.clone(),
            namespace: self.namespace.clone(),
            service_account: self.service_account.clone(),
            runtime: self.container_runtime,
            pod_running_timeout: Duration::from_secs(self.priv_pod_timeout),
            exec_timeout: Duration::from_secs(self.exec_timeout),
            done_grace_period: Duration::from_secs(self.done_grace_period),
        }
    }
}

async fn kube_client(kubeconfig: Option<&PathBuf>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            info!("Using kubeconfig {}", path.display());
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("Invalid kubeconfig")?
        }
        None => Config::infer()
            .await
            .context("Failed to infer cluster configuration")?,
    };
    Client::try_from(config).context("Failed to create Kubernetes client")
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "privcmd_controller=info,kube=warn,tower=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = args.controller_config();
    config.validate().context("Invalid configuration")?;

    info!("Starting privcmd-controller");
    info!(
        "Privileged pods: image {}, namespace {}, service account {}, runtime {:?}",
        config.image, config.namespace, config.service_account, config.runtime
    );

    let client = kube_client(args.kubeconfig.as_ref()).await?;
    let mut controller = Controller::new(
        Arc::new(KubePodClient::new(client)),
        Arc::new(config),
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };
    controller
        .run_until(shutdown, Duration::from_secs(5))
        .await;

    Ok(())
}
