//! `PodClient` backed by the Kubernetes API server.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use super::{ClientError, ExecOutput, PodClient, PodEvent, PodEventStream, PodWatch};

/// Client for pods on a live cluster.
#[derive(Clone)]
pub struct KubePodClient {
    client: Client,
}

impl KubePodClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Map 404/409 API responses onto the dedicated variants.
fn classify(err: kube::Error, name: &str) -> ClientError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => ClientError::NotFound(name.to_string()),
        kube::Error::Api(ae) if ae.code == 409 => ClientError::AlreadyExists(name.to_string()),
        e => ClientError::Kube(e),
    }
}

async fn read_stream<R: AsyncRead + Unpin>(reader: Option<R>) -> Result<String, ClientError> {
    let mut out = String::new();
    if let Some(mut reader) = reader {
        reader
            .read_to_string(&mut out)
            .await
            .map_err(|e| ClientError::Other(format!("failed to read exec output: {}", e)))?;
    }
    Ok(out)
}

#[async_trait]
impl PodClient for KubePodClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClientError> {
        debug!("Getting pod {}/{}", namespace, name);
        Ok(self.pods(namespace).get_opt(name).await?)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, ClientError> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        debug!("Creating pod {}/{}", namespace, name);
        self.pods(namespace)
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| classify(e, &name))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        debug!("Deleting pod {}/{}", namespace, name);
        self.pods(namespace)
            .delete(name, &DeleteParams::foreground())
            .await
            .map_err(|e| classify(e, name))?;
        Ok(())
    }

    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<Pod, ClientError> {
        debug!("Patching pod {}/{}: {}", namespace, name, patch);
        self.pods(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| classify(e, name))
    }

    async fn watch_pod(&self, namespace: &str, name: &str) -> Result<PodWatch, ClientError> {
        let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
        let stream = watcher(self.pods(namespace), config)
            .default_backoff()
            .applied_objects()
            .map_err(ClientError::from)
            .boxed();
        Ok(stream)
    }

    fn watch_pods(&self) -> PodEventStream {
        let api: Api<Pod> = Api::all(self.client.clone());
        watcher(api, watcher::Config::default())
            .default_backoff()
            .filter_map(|event| async move {
                match event {
                    Ok(watcher::Event::Apply(pod)) | Ok(watcher::Event::InitApply(pod)) => {
                        Some(Ok(PodEvent::Applied(pod)))
                    }
                    Ok(watcher::Event::Delete(pod)) => Some(Ok(PodEvent::Deleted(pod))),
                    Ok(watcher::Event::Init) => Some(Ok(PodEvent::Relisting)),
                    Ok(watcher::Event::InitDone) => Some(Ok(PodEvent::Relisted)),
                    Err(e) => Some(Err(ClientError::from(e))),
                }
            })
            .boxed()
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput, ClientError> {
        debug!("Exec in {}/{} ({}): {:?}", namespace, pod, container, command);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut process = self
            .pods(namespace)
            .exec(pod, command.to_vec(), &params)
            .await
            .map_err(|e| classify(e, pod))?;

        let stdout = process.stdout();
        let stderr = process.stderr();
        let (stdout, stderr) = tokio::try_join!(read_stream(stdout), read_stream(stderr))?;

        let status = match process.take_status() {
            Some(status) => status.await,
            None => None,
        };
        if let Err(e) = process.join().await {
            warn!("Exec session for {}/{} did not close cleanly: {}", namespace, pod, e);
        }

        match status {
            Some(s) if s.status.as_deref() == Some("Success") => Ok(ExecOutput { stdout, stderr }),
            Some(s) => Err(ClientError::Exec(
                s.message
                    .or(s.reason)
                    .unwrap_or_else(|| "remote command failed".to_string()),
            )),
            None => Err(ClientError::Exec(
                "exec session closed without a status".to_string(),
            )),
        }
    }
}
