//! Controller configuration.

use std::time::Duration;

use crate::error::{Error, Result};

/// Container runtime on the cluster nodes.
///
/// Selects the runtime socket mounted into the privileged pod and the
/// command used to look up a container's host PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ContainerRuntime {
    #[default]
    Docker,
    Containerd,
}

impl ContainerRuntime {
    /// Host path of the runtime control socket.
    pub fn socket_path(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "/var/run/docker.sock",
            ContainerRuntime::Containerd => "/run/containerd/containerd.sock",
        }
    }

    /// `hostPath` volume type of the socket.
    pub fn socket_host_path_type(&self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "File",
            ContainerRuntime::Containerd => "Socket",
        }
    }

    /// Command printing the host PID of `container_id`.
    pub fn pid_command(&self, container_id: &str) -> Vec<String> {
        let args: &[&str] = match self {
            ContainerRuntime::Docker => &["docker", "inspect", "--format", "'{{ .State.Pid }}'"],
            ContainerRuntime::Containerd => &[
                "crictl",
                "inspect",
                "--output",
                "go-template",
                "--template",
                "{{.info.pid}}",
            ],
        };
        args.iter()
            .map(|s| s.to_string())
            .chain(std::iter::once(container_id.to_string()))
            .collect()
    }
}

/// Settings read once at startup and shared, immutable, by every component.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Image of the privileged container, carrying nsenter and the runtime CLI.
    pub image: String,
    /// Namespace privileged pods are created in.
    pub namespace: String,
    /// Service account privileged pods run under.
    pub service_account: String,
    /// Runtime of the cluster nodes.
    pub runtime: ContainerRuntime,
    /// How long to wait for a privileged pod to reach Running.
    pub pod_running_timeout: Duration,
    /// Deadline for each remote command in the privileged pod.
    pub exec_timeout: Duration,
    /// Time a polling client gets to observe `done` before cleanup.
    pub done_grace_period: Duration,
}

impl ControllerConfig {
    pub const DEFAULT_NAMESPACE: &'static str = "kube-pcc";
    pub const DEFAULT_SERVICE_ACCOUNT: &'static str = "kube-priv-pod";
    pub const DEFAULT_POD_RUNNING_TIMEOUT: Duration = Duration::from_secs(300);
    pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(600);
    pub const DEFAULT_DONE_GRACE_PERIOD: Duration = Duration::from_secs(1);

    /// Configuration with defaults for everything but the image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            namespace: Self::DEFAULT_NAMESPACE.to_string(),
            service_account: Self::DEFAULT_SERVICE_ACCOUNT.to_string(),
            runtime: ContainerRuntime::default(),
            pod_running_timeout: Self::DEFAULT_POD_RUNNING_TIMEOUT,
            exec_timeout: Self::DEFAULT_EXEC_TIMEOUT,
            done_grace_period: Self::DEFAULT_DONE_GRACE_PERIOD,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "no privileged pod image configured".to_string(),
            ));
        }
        if self.namespace.is_empty() {
            return Err(Error::InvalidConfig(
                "privileged pod namespace must not be empty".to_string(),
            ));
        }
        if self.pod_running_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "privileged pod timeout must be positive".to_string(),
            ));
        }
        if self.exec_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "exec timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
