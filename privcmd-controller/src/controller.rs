//! Event dispatcher.
//!
//! Watches pods across the cluster, pairs every update with the previous
//! snapshot of the same pod, and hands qualifying updates to the
//! [`Reconciler`]. Events are processed one at a time, in the order the
//! watch delivers them.
//!
//! The dispatcher is where errors stop: a failed request is logged, its
//! privileged pod is removed and the status annotation is set to `error`.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::annotations::{self, CommandRequest, ExecuteStatus};
use crate::clients::{PodClient, PodEvent};
use crate::config::ControllerConfig;
use crate::error::Error;
use crate::reconciler::{Outcome, Reconciler};
use crate::request::RequestContext;

/// Cluster-wide privileged command controller.
pub struct Controller {
    client: Arc<dyn PodClient>,
    reconciler: Reconciler,
    /// Last seen snapshot per `namespace/name`.
    snapshots: HashMap<String, Pod>,
    /// Pods whose `active` request completed and may now move through `done`.
    completions: HashSet<String>,
    /// Keys listed so far while the watch re-lists, `None` outside a re-list.
    relisted: Option<HashSet<String>>,
}

impl Controller {
    pub fn new(client: Arc<dyn PodClient>, config: Arc<ControllerConfig>) -> Self {
        Self {
            reconciler: Reconciler::new(Arc::clone(&client), config),
            client,
            snapshots: HashMap::new(),
            completions: HashSet::new(),
            relisted: None,
        }
    }

    /// Process pod events until the watch stream ends.
    pub async fn run(&mut self) {
        info!("Watching pods for privileged command requests");
        let mut events = self.client.watch_pods();

        while let Some(event) = events.next().await {
            match event {
                Ok(event) => self.handle_event(event).await,
                Err(e) => error!("Pod watch error: {}", e),
            }
        }
        info!("Pod watch stream ended");
    }

    /// Run the watch, restarting it `restart_delay` after it ends, until
    /// `shutdown` resolves.
    pub async fn run_until<F>(&mut self, shutdown: F, restart_delay: Duration)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = async {
                    self.run().await;
                    warn!(
                        "Pod watch ended. Restarting in {} seconds...",
                        restart_delay.as_secs()
                    );
                    tokio::time::sleep(restart_delay).await;
                } => {}
                _ = &mut shutdown => {
                    info!("Shutting down");
                    return;
                }
            }
        }
    }

    /// Handle one event of the pod stream.
    ///
    /// The first sighting of a pod only seeds its snapshot; updates are
    /// dispatched once a previous snapshot exists. Pods missing from a
    /// completed re-list are forgotten as if deleted.
    pub async fn handle_event(&mut self, event: PodEvent) {
        match event {
            PodEvent::Applied(pod) => {
                let key = key_of(&pod);
                if let Some(listed) = self.relisted.as_mut() {
                    listed.insert(key.clone());
                }
                if let Some(previous) = self.snapshots.insert(key.clone(), pod.clone()) {
                    self.handle_update(key, previous, pod).await;
                }
            }
            PodEvent::Deleted(pod) => {
                let key = key_of(&pod);
                debug!("Forgetting deleted pod {}", key);
                self.snapshots.remove(&key);
                self.completions.remove(&key);
            }
            PodEvent::Relisting => {
                self.relisted = Some(HashSet::new());
            }
            PodEvent::Relisted => {
                let Some(listed) = self.relisted.take() else {
                    return;
                };
                let before = self.snapshots.len();
                self.snapshots.retain(|key, _| listed.contains(key));
                self.completions.retain(|key| listed.contains(key));
                let gone = before - self.snapshots.len();
                if gone > 0 {
                    debug!("Forgot {} pods deleted while the watch was down", gone);
                }
            }
        }
    }

    async fn handle_update(&mut self, key: String, previous: Pod, current: Pod) {
        let Some(request) = CommandRequest::from_pod(&current) else {
            return;
        };

        match request.status.parse::<ExecuteStatus>() {
            // A completed request stays `active` in updates queued before
            // its own `done` write; only that `done` moves it on.
            Ok(ExecuteStatus::Active) if self.completions.contains(&key) => {
                debug!("Ignoring stale active status on pod {}", key);
                return;
            }
            Ok(ExecuteStatus::Done) => {
                if !self.completions.remove(&key) {
                    warn!(
                        "Ignoring done status on pod {} that was not set by a completed request",
                        key
                    );
                    return;
                }
            }
            _ => {}
        }

        let name = current.name_any();
        let namespace = current.namespace().unwrap_or_default();
        let ctx = RequestContext::for_target(&name, &request.container);
        let span = info_span!(
            "request",
            request_id = %ctx.request_id,
            pod = %name,
            namespace = %namespace
        );

        self.dispatch(key, previous, current, ctx)
            .instrument(span)
            .await;
    }

    async fn dispatch(&mut self, key: String, previous: Pod, mut current: Pod, ctx: RequestContext) {
        match self
            .reconciler
            .process(Some(&previous), &mut current, &ctx)
            .await
        {
            Ok(Outcome::Completed) => {
                info!("Privileged command completed on pod {}", key);
                self.completions.insert(key);
            }
            Ok(Outcome::CleanedUp) | Ok(Outcome::Ignored) => {}
            Err(e) => self.fail(&mut current, &ctx, e).await,
        }
    }

    /// Record a failed request on the target pod.
    async fn fail(&self, pod: &mut Pod, ctx: &RequestContext, err: Error) {
        error!("{}", err);

        if err.is_conflict() {
            warn!(
                "Leaving privileged pod {} in place, it belongs to another request",
                ctx.privileged_pod_name
            );
        } else if let Err(e) = self.reconciler.privileged_pods().delete(ctx).await {
            error!("Failed to clean up privileged pod: {}", e);
        }

        if let Err(e) =
            annotations::set_status(&*self.client, pod, ExecuteStatus::Error, ctx).await
        {
            error!("Failed to set error status: {}", e);
        }
    }
}

fn key_of(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}
