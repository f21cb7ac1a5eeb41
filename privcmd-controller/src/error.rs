//! Controller error types.

use std::time::Duration;

use thiserror::Error;

use crate::annotations::ExecuteStatus;
use crate::clients::ClientError;

/// Errors that can occur while handling a privileged command request.
#[derive(Debug, Error)]
pub enum Error {
    /// The privileged pod could not be created.
    #[error("failed to create pod {name} on node {node}: {source}")]
    PodCreateFailed {
        name: String,
        node: String,
        #[source]
        source: ClientError,
    },

    /// The watch on the privileged pod could not be opened.
    #[error("error starting watcher for privilege pod {name}: {source}")]
    PodWatchFailed {
        name: String,
        #[source]
        source: ClientError,
    },

    /// The privileged pod did not reach the Running phase in time.
    #[error(
        "privileged pod {name} is not running after {} seconds, it is currently in {phase} phase",
        .timeout.as_secs()
    )]
    PodNotRunning {
        name: String,
        timeout: Duration,
        phase: String,
    },

    /// A privileged pod with the derived name already exists.
    #[error("privileged pod {name} already exists and is owned by request {owner}")]
    PrivilegedPodConflict { name: String, owner: String },

    /// The privileged pod could not be deleted.
    #[error("failed to delete pod {name}: {source}")]
    PodDeleteFailed {
        name: String,
        #[source]
        source: ClientError,
    },

    /// The target container has no runtime ID yet.
    #[error("no matching container ID for container {container} on pod {pod} under namespace {namespace}")]
    ContainerNotFound {
        container: String,
        pod: String,
        namespace: String,
    },

    /// The target pod is not scheduled on a node.
    #[error("failed to detect target node: no node name detected for target pod: {pod}")]
    NodeNameMissing { pod: String },

    /// The action annotation holds no command tokens.
    #[error("no command to execute for container {container} on pod {pod}")]
    EmptyAction { container: String, pod: String },

    /// The host PID of the target container could not be determined.
    #[error("unable to retrieve PID for container {container} with container ID {container_id}: {reason}")]
    PidResolutionFailed {
        container: String,
        container_id: String,
        reason: String,
    },

    /// The remote command failed at the transport level or exited unsuccessfully.
    #[error("command {command:?} failed: {source}")]
    RemoteExecFailed {
        command: Vec<String>,
        #[source]
        source: ClientError,
    },

    /// The remote command did not finish before the exec deadline.
    #[error("command {command:?} did not finish within {} seconds", .timeout.as_secs())]
    RemoteExecTimedOut {
        command: Vec<String>,
        timeout: Duration,
    },

    /// The annotation patch was not applied.
    #[error("failed to patch annotation to pod {pod}: {source}")]
    AnnotationPatchFailed {
        pod: String,
        #[source]
        source: ClientError,
    },

    /// An annotation scheduled for deletion is not present.
    #[error("annotation {key} to be deleted does not exist")]
    AnnotationMissing { key: String },

    /// The status annotation could not be moved to a new value.
    #[error("failed to update privileged-command-status annotation to {status}: {source}")]
    StatusUpdate {
        status: ExecuteStatus,
        source: Box<Error>,
    },

    /// Resolving the PID or running the command failed.
    #[error("failed to execute command: {0}")]
    CommandFailed(#[source] Box<Error>),

    /// The protocol annotations could not be removed after completion.
    #[error("failed to delete annotations privileged-command-status, privileged-command-container and privileged-command-action: {0}")]
    AnnotationCleanup(#[source] Box<Error>),

    /// Handling a status transition failed.
    #[error("unable to act upon annotation privileged-command-status change to {status}: {source}")]
    Transition {
        status: ExecuteStatus,
        source: Box<Error>,
    },

    /// Invalid controller configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether the error was caused by a privileged pod that belongs to
    /// another request. Such a pod must not be cleaned up on our behalf.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::PrivilegedPodConflict { .. } => true,
            Error::Transition { source, .. } => source.is_conflict(),
            _ => false,
        }
    }
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, Error>;
