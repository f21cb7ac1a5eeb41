//! Handler for the `active` status.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{info, warn};

use super::Reconciler;
use crate::annotations::{
    self, status_of, ExecuteStatus, ANNOTATION_EXECUTE_ACTION, ANNOTATION_EXECUTE_CONTAINER,
};
use crate::error::{Error, Result};
use crate::executor::resolve_container_id;
use crate::privileged_pod::Placement;
use crate::request::RequestContext;

impl Reconciler {
    /// Run the requested action and move the status to `done`.
    ///
    /// Everything is recomputed from the current snapshot, so a re-delivered
    /// `active` is handled exactly like a fresh one.
    pub(super) async fn handle_active(
        &self,
        previous: Option<&Pod>,
        pod: &mut Pod,
        ctx: &RequestContext,
    ) -> Result<()> {
        let name = pod.name_any();
        let namespace = pod.namespace().unwrap_or_default();

        if previous.and_then(status_of) == Some(ExecuteStatus::Active) {
            warn!(
                "Retrying privileged command on pod {} under namespace {}",
                name, namespace
            );
        }

        let container = pod
            .annotations()
            .get(ANNOTATION_EXECUTE_CONTAINER)
            .cloned()
            .unwrap_or_default();
        let action = pod
            .annotations()
            .get(ANNOTATION_EXECUTE_ACTION)
            .cloned()
            .unwrap_or_default();
        info!(
            "Handling action {:?} for container {} on pod {}",
            action, container, name
        );

        self.update_status(pod, ExecuteStatus::InProgress, ctx).await?;

        let container_id =
            resolve_container_id(pod, &container).ok_or_else(|| Error::ContainerNotFound {
                container: container.clone(),
                pod: name.clone(),
                namespace: namespace.clone(),
            })?;

        let node = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.clone())
            .filter(|node| !node.is_empty())
            .ok_or_else(|| Error::NodeNameMissing { pod: name.clone() })?;

        let tokens: Vec<String> = action.split_whitespace().map(String::from).collect();
        if tokens.is_empty() {
            return Err(Error::EmptyAction {
                container,
                pod: name,
            });
        }

        let placement = Placement {
            node: &node,
            target_namespace: &namespace,
            target_pod: &name,
            target_container: &container,
        };
        self.pods.provision(placement, ctx).await?;

        let run = async {
            let pid = self
                .executor
                .resolve_host_pid(ctx, &container, &container_id)
                .await?;
            self.executor.execute(ctx, pid, &tokens).await
        };
        run.await.map_err(|e| Error::CommandFailed(Box::new(e)))?;

        self.update_status(pod, ExecuteStatus::Done, ctx).await
    }

    async fn update_status(
        &self,
        pod: &mut Pod,
        status: ExecuteStatus,
        ctx: &RequestContext,
    ) -> Result<()> {
        annotations::set_status(&*self.client, pod, status, ctx)
            .await
            .map_err(|source| Error::StatusUpdate {
                status,
                source: Box::new(source),
            })
    }
}
