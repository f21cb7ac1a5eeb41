//! Handler for the `done` status.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::info;

use super::Reconciler;
use crate::annotations;
use crate::error::{Error, Result};
use crate::request::RequestContext;

impl Reconciler {
    /// Remove the privileged pod, then the protocol annotations.
    ///
    /// The grace period gives a polling client the chance to see `done`
    /// before the annotations disappear. A failed step aborts the handler
    /// and the remaining cleanup is not attempted.
    pub(super) async fn handle_done(&self, pod: &mut Pod, ctx: &RequestContext) -> Result<()> {
        tokio::time::sleep(self.config.done_grace_period).await;

        self.pods.delete(ctx).await?;

        annotations::clear(&*self.client, pod, ctx)
            .await
            .map_err(|e| Error::AnnotationCleanup(Box::new(e)))?;

        info!("Privileged command on pod {} finished", pod.name_any());
        Ok(())
    }
}
