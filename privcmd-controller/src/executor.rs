//! Namespace-entry command execution.
//!
//! The privileged pod shares the host PID namespace, so once the target
//! container's host PID is known, `nsenter` can join that process's IPC, UTS,
//! network and PID namespaces. The mount namespace is left alone so the
//! privileged container keeps its own filesystem and tools.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use tracing::{error, info};

use crate::clients::PodClient;
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::privileged_pod::PRIVILEGED_CONTAINER;
use crate::request::RequestContext;

/// Runtime ID of `container` in `pod`, without its `scheme://` prefix.
///
/// Init containers are searched as well. Returns `None` if the container is
/// unknown or has not been assigned an ID yet.
pub fn resolve_container_id(pod: &Pod, container: &str) -> Option<String> {
    let status = pod.status.as_ref()?;
    status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten())
        .find(|s| s.name == container)
        .and_then(|s| s.container_id.as_deref())
        .map(|id| match id.split_once("://") {
            Some((_, id)) => id,
            None => id,
        })
        .filter(|id| !id.is_empty())
        .map(String::from)
}

/// Full command running `tokens` inside the namespaces of `pid`.
pub fn nsenter_command(pid: u32, tokens: &[String]) -> Vec<String> {
    let mut command: Vec<String> = ["nsenter", "--target"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    command.push(pid.to_string());
    command.extend(
        ["--ipc", "--uts", "--net", "--pid"]
            .iter()
            .map(|s| s.to_string()),
    );
    command.extend(tokens.iter().cloned());
    command
}

/// Parse the output of a runtime inspect command into a PID.
///
/// The docker format string is passed through literally, so its output comes
/// back wrapped in single quotes.
pub fn parse_pid(output: &str) -> std::result::Result<u32, String> {
    let trimmed = output
        .trim()
        .trim_matches(|c: char| c == '\'' || c == '"')
        .trim();
    match trimmed.parse::<u32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(format!("unexpected PID output {:?}", output)),
    }
}

/// Runs commands inside the privileged pod of a request.
pub struct NamespaceExecutor {
    client: Arc<dyn PodClient>,
    config: Arc<ControllerConfig>,
}

impl NamespaceExecutor {
    pub fn new(client: Arc<dyn PodClient>, config: Arc<ControllerConfig>) -> Self {
        Self { client, config }
    }

    /// Look up the host PID of `container` through the container runtime.
    pub async fn resolve_host_pid(
        &self,
        ctx: &RequestContext,
        container: &str,
        container_id: &str,
    ) -> Result<u32> {
        let command = self.config.runtime.pid_command(container_id);
        info!(
            "Command for retrieving PID for container {} with container ID {}: {:?}",
            container, container_id, command
        );

        let failed = |reason: String| Error::PidResolutionFailed {
            container: container.to_string(),
            container_id: container_id.to_string(),
            reason,
        };

        let stdout = self
            .run_in_pod(ctx, command)
            .await
            .map_err(|e| failed(e.to_string()))?;
        let pid = parse_pid(&stdout).map_err(failed)?;

        info!("Retrieved PID for container {}: {}", container, pid);
        Ok(pid)
    }

    /// Run `tokens` inside the namespaces of `pid` and return its stdout.
    pub async fn execute(&self, ctx: &RequestContext, pid: u32, tokens: &[String]) -> Result<String> {
        let command = nsenter_command(pid, tokens);
        info!(
            "Command to execute on pod {} under namespace {}: {:?}",
            ctx.privileged_pod_name, self.config.namespace, command
        );
        let stdout = self.run_in_pod(ctx, command).await?;
        info!("Command output: {}", stdout.trim_end());
        Ok(stdout)
    }

    /// Exec `command` in the privileged container, bounded by the exec
    /// timeout. Stderr is logged but does not fail the call.
    async fn run_in_pod(&self, ctx: &RequestContext, command: Vec<String>) -> Result<String> {
        let exec = self.client.exec(
            &self.config.namespace,
            &ctx.privileged_pod_name,
            PRIVILEGED_CONTAINER,
            &command,
        );

        let result = tokio::time::timeout(self.config.exec_timeout, exec).await;
        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(Error::RemoteExecFailed { command, source }),
            Err(_) => {
                return Err(Error::RemoteExecTimedOut {
                    command,
                    timeout: self.config.exec_timeout,
                })
            }
        };

        if !output.stderr.is_empty() {
            error!("Command {:?} returned std err: {}", command, output.stderr.trim_end());
        }
        Ok(output.stdout)
    }
}
