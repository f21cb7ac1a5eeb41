//! Kubernetes access layer.
//!
//! The controller never talks to the API server directly. Everything it needs
//! goes through the [`PodClient`] trait:
//! - list/watch pods cluster-wide (the dispatcher's event stream)
//! - get/create/delete/patch a pod by namespace and name
//! - watch a single pod by name (privileged pod startup)
//! - exec a command in a running pod's container
//!
//! [`KubePodClient`] is the production implementation backed by `kube`.

pub mod k8s;

pub use k8s::KubePodClient;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;

/// Errors reported by a [`PodClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The named object does not exist.
    #[error("pods \"{0}\" not found")]
    NotFound(String),

    /// An object with the same name already exists.
    #[error("pods \"{0}\" already exists")]
    AlreadyExists(String),

    /// The remote process finished unsuccessfully.
    #[error("exec failed: {0}")]
    Exec(String),

    /// API server error.
    #[error(transparent)]
    Kube(#[from] kube::Error),

    /// Watch stream error.
    #[error(transparent)]
    Watch(#[from] kube::runtime::watcher::Error),

    /// Any other failure.
    #[error("{0}")]
    Other(String),
}

/// Captured output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A change observed on the cluster-wide pod stream.
#[derive(Debug, Clone)]
pub enum PodEvent {
    /// A pod was added or modified.
    Applied(Pod),
    /// A pod was deleted.
    Deleted(Pod),
    /// The watch starts listing all pods again; `Applied` events follow.
    Relisting,
    /// The re-list is complete.
    Relisted,
}

/// Stream of snapshots of a single pod.
pub type PodWatch = BoxStream<'static, Result<Pod, ClientError>>;

/// Stream of cluster-wide pod changes.
pub type PodEventStream = BoxStream<'static, Result<PodEvent, ClientError>>;

/// Pod operations required by the controller.
#[async_trait]
pub trait PodClient: Send + Sync {
    /// Get a pod, `None` if it does not exist.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClientError>;

    /// Create a pod in the given namespace.
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, ClientError>;

    /// Delete a pod with foreground propagation. Fails with
    /// [`ClientError::NotFound`] if the pod is absent.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClientError>;

    /// Apply a JSON merge patch to a pod.
    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<Pod, ClientError>;

    /// Watch a single pod, selected by `metadata.name`. Dropping the stream
    /// stops the watch.
    async fn watch_pod(&self, namespace: &str, name: &str) -> Result<PodWatch, ClientError>;

    /// Watch pods across all namespaces.
    fn watch_pods(&self) -> PodEventStream;

    /// Run `command` in `container` of a running pod, capturing stdout and
    /// stderr separately.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput, ClientError>;
}
