//! Privileged pod lifecycle.
//!
//! A privileged pod is created on demand next to the target pod, awaited
//! until it reports phase `Running`, used for remote execution, and deleted
//! once the request finishes. Its name is derived from the target pod and
//! container; the request id label records which request created it.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, HostPathVolumeSource, Pod, PodSpec, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::clients::PodClient;
use crate::config::{ContainerRuntime, ControllerConfig};
use crate::error::{Error, Result};
use crate::request::RequestContext;

/// Name of the single container in a privileged pod.
pub const PRIVILEGED_CONTAINER: &str = "priv-pod";

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "privcmd-controller";
pub const LABEL_REQUEST_ID: &str = "privileged-command/request-id";
pub const ANNOTATION_TARGET: &str = "privileged-command/target";

const RUNTIME_SOCKET_VOLUME: &str = "runtime-socket";
const POD_RUNNING: &str = "Running";

/// Where a privileged pod is needed and what it serves.
#[derive(Debug, Clone, Copy)]
pub struct Placement<'a> {
    /// Node the target pod runs on.
    pub node: &'a str,
    pub target_namespace: &'a str,
    pub target_pod: &'a str,
    pub target_container: &'a str,
}

/// Creates, awaits and deletes privileged pods.
pub struct PrivilegedPodManager {
    client: Arc<dyn PodClient>,
    config: Arc<ControllerConfig>,
}

impl PrivilegedPodManager {
    pub fn new(client: Arc<dyn PodClient>, config: Arc<ControllerConfig>) -> Self {
        Self { client, config }
    }

    /// Create the privileged pod for `ctx` and wait until it is running.
    ///
    /// Fails with [`Error::PrivilegedPodConflict`] if a pod with the derived
    /// name already exists; privileged pods are never reused. The single-pod
    /// watch is dropped on every exit path.
    pub async fn provision(&self, placement: Placement<'_>, ctx: &RequestContext) -> Result<()> {
        let namespace = &self.config.namespace;
        let name = &ctx.privileged_pod_name;

        let existing = self
            .client
            .get_pod(namespace, name)
            .await
            .map_err(|source| Error::PodCreateFailed {
                name: name.clone(),
                node: placement.node.to_string(),
                source,
            })?;
        if let Some(pod) = existing {
            return Err(Error::PrivilegedPodConflict {
                name: name.clone(),
                owner: pod.labels().get(LABEL_REQUEST_ID).cloned().unwrap_or_default(),
            });
        }

        info!(
            "Creating privileged pod {} in node {} under namespace {}",
            name, placement.node, namespace
        );
        let pod = self.build_pod(placement, ctx);
        self.client
            .create_pod(namespace, &pod)
            .await
            .map_err(|source| Error::PodCreateFailed {
                name: name.clone(),
                node: placement.node.to_string(),
                source,
            })?;

        let mut watch = self
            .client
            .watch_pod(namespace, name)
            .await
            .map_err(|source| Error::PodWatchFailed {
                name: name.clone(),
                source,
            })?;

        info!("Waiting for privileged pod {} to be in a running status", name);
        let running = async {
            loop {
                match watch.next().await {
                    Some(Ok(pod)) if phase_of(&pod) == POD_RUNNING => return,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => warn!("Watch error for privileged pod {}: {}", name, e),
                    // Nothing more will arrive; only the deadline can end the wait.
                    None => std::future::pending::<()>().await,
                }
            }
        };
        let waited = tokio::time::timeout(self.config.pod_running_timeout, running).await;
        drop(watch);

        if waited.is_ok() {
            info!("Privileged pod {} is running", name);
            return Ok(());
        }

        let phase = match self.client.get_pod(namespace, name).await {
            Ok(Some(pod)) => phase_of(&pod),
            Ok(None) => String::new(),
            Err(e) => {
                warn!("Failed to read privileged pod {}: {}", name, e);
                String::new()
            }
        };
        Err(Error::PodNotRunning {
            name: name.clone(),
            timeout: self.config.pod_running_timeout,
            phase,
        })
    }

    /// Delete the privileged pod of `ctx` with foreground propagation.
    ///
    /// Deleting a pod that does not exist is an error.
    pub async fn delete(&self, ctx: &RequestContext) -> Result<()> {
        let namespace = &self.config.namespace;
        info!(
            "Deleting pod {} under namespace {}",
            ctx.privileged_pod_name, namespace
        );
        self.client
            .delete_pod(namespace, &ctx.privileged_pod_name)
            .await
            .map_err(|source| Error::PodDeleteFailed {
                name: ctx.privileged_pod_name.clone(),
                source,
            })
    }

    /// Pod object for the privileged pod of `ctx`.
    pub fn build_pod(&self, placement: Placement<'_>, ctx: &RequestContext) -> Pod {
        let runtime = self.config.runtime;

        let labels = BTreeMap::from([
            (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
            (LABEL_REQUEST_ID.to_string(), ctx.request_id.to_string()),
        ]);
        let annotations = BTreeMap::from([(
            ANNOTATION_TARGET.to_string(),
            format!(
                "{}/{}/{}",
                placement.target_namespace, placement.target_pod, placement.target_container
            ),
        )]);

        let env = match runtime {
            ContainerRuntime::Containerd => Some(vec![EnvVar {
                name: "CONTAINER_RUNTIME_ENDPOINT".to_string(),
                value: Some(format!("unix://{}", runtime.socket_path())),
                ..Default::default()
            }]),
            ContainerRuntime::Docker => None,
        };

        let container = Container {
            name: PRIVILEGED_CONTAINER.to_string(),
            image: Some(self.config.image.clone()),
            image_pull_policy: Some("Always".to_string()),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            volume_mounts: Some(vec![VolumeMount {
                name: RUNTIME_SOCKET_VOLUME.to_string(),
                mount_path: runtime.socket_path().to_string(),
                ..Default::default()
            }]),
            env,
            ..Default::default()
        };

        Pod {
            metadata: ObjectMeta {
                name: Some(ctx.privileged_pod_name.clone()),
                namespace: Some(self.config.namespace.clone()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PodSpec {
                service_account_name: Some(self.config.service_account.clone()),
                host_pid: Some(true),
                node_name: Some(placement.node.to_string()),
                restart_policy: Some("Never".to_string()),
                containers: vec![container],
                volumes: Some(vec![Volume {
                    name: RUNTIME_SOCKET_VOLUME.to_string(),
                    host_path: Some(HostPathVolumeSource {
                        path: runtime.socket_path().to_string(),
                        type_: Some(runtime.socket_host_path_type().to_string()),
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Phase reported in the pod status, empty if unknown.
pub fn phase_of(pod: &Pod) -> String {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_default()
}
