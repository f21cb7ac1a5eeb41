//! Annotation state machine.
//!
//! [`Reconciler::process`] is the single entry point. It looks at the status
//! annotation of the current pod snapshot and runs the matching handler:
//! - `active`: provision a privileged pod, run the action, write `done`
//! - `done`: tear down the privileged pod and the protocol annotations
//!
//! Every other status is left alone. Writing `done` is itself a pod update,
//! so the done handler runs as a separate event after the active handler has
//! returned.

mod active;
mod done;

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use crate::annotations::{status_of, ExecuteStatus};
use crate::clients::PodClient;
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::executor::NamespaceExecutor;
use crate::privileged_pod::PrivilegedPodManager;
use crate::request::RequestContext;

/// What a call to [`Reconciler::process`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The status is not one the state machine acts on.
    Ignored,
    /// The action ran and `done` was written.
    Completed,
    /// The privileged pod and the protocol annotations were removed.
    CleanedUp,
}

/// Drives a target pod through the annotation protocol.
pub struct Reconciler {
    client: Arc<dyn PodClient>,
    config: Arc<ControllerConfig>,
    pods: PrivilegedPodManager,
    executor: NamespaceExecutor,
}

impl Reconciler {
    pub fn new(client: Arc<dyn PodClient>, config: Arc<ControllerConfig>) -> Self {
        Self {
            pods: PrivilegedPodManager::new(Arc::clone(&client), Arc::clone(&config)),
            executor: NamespaceExecutor::new(Arc::clone(&client), Arc::clone(&config)),
            client,
            config,
        }
    }

    /// Privileged pod manager shared with the error path of the dispatcher.
    pub fn privileged_pods(&self) -> &PrivilegedPodManager {
        &self.pods
    }

    /// Act on the status annotation of `current`.
    ///
    /// `current` is updated in place as annotations are written. Handler
    /// failures are wrapped with the status that triggered them.
    pub async fn process(
        &self,
        previous: Option<&Pod>,
        current: &mut Pod,
        ctx: &RequestContext,
    ) -> Result<Outcome> {
        let Some(status) = status_of(current) else {
            return Ok(Outcome::Ignored);
        };

        let result = match status {
            ExecuteStatus::Active => self
                .handle_active(previous, current, ctx)
                .await
                .map(|_| Outcome::Completed),
            ExecuteStatus::Done => self
                .handle_done(current, ctx)
                .await
                .map(|_| Outcome::CleanedUp),
            ExecuteStatus::InProgress | ExecuteStatus::Error => {
                debug!("Nothing to do for status {}", status);
                return Ok(Outcome::Ignored);
            }
        };

        result.map_err(|source| Error::Transition {
            status,
            source: Box::new(source),
        })
    }
}
