//! Annotation protocol shared with the requesting client.
//!
//! A request is expressed entirely through three annotations on the target
//! pod. The client sets all three (status last) to `active`; the controller
//! moves the status through `in-progress` and `done` and finally removes the
//! keys, or leaves the status at `error`.
//!
//! Writes are computed as a JSON merge patch from the difference between the
//! pod's annotations before and after the change, so annotations written by
//! other actors in the meantime are left untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::clients::PodClient;
use crate::error::{Error, Result};
use crate::request::RequestContext;

/// Status of the current request.
pub const ANNOTATION_EXECUTE_STATUS: &str = "privileged-command-status";
/// Name of the container to act on.
pub const ANNOTATION_EXECUTE_CONTAINER: &str = "privileged-command-container";
/// Whitespace-delimited command and arguments.
pub const ANNOTATION_EXECUTE_ACTION: &str = "privileged-command-action";

/// All keys owned by the protocol.
pub const PROTOCOL_KEYS: [&str; 3] = [
    ANNOTATION_EXECUTE_STATUS,
    ANNOTATION_EXECUTE_CONTAINER,
    ANNOTATION_EXECUTE_ACTION,
];

/// Values of the status annotation. Absence means idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecuteStatus {
    Active,
    InProgress,
    Done,
    Error,
}

impl ExecuteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecuteStatus::Active => "active",
            ExecuteStatus::InProgress => "in-progress",
            ExecuteStatus::Done => "done",
            ExecuteStatus::Error => "error",
        }
    }
}

impl fmt::Display for ExecuteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecuteStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(ExecuteStatus::Active),
            "in-progress" => Ok(ExecuteStatus::InProgress),
            "done" => Ok(ExecuteStatus::Done),
            "error" => Ok(ExecuteStatus::Error),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

/// Parsed status of a pod, `None` if absent or unrecognised.
pub fn status_of(pod: &Pod) -> Option<ExecuteStatus> {
    pod.annotations()
        .get(ANNOTATION_EXECUTE_STATUS)
        .and_then(|s| s.parse().ok())
}

/// The three protocol values, present only when all of them are non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub status: String,
    pub container: String,
    pub action: String,
}

impl CommandRequest {
    /// Extract the request from a pod. Partial writes and unrelated pods
    /// yield `None`.
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let annotations = pod.metadata.annotations.as_ref()?;
        let value = |key: &str| {
            annotations
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
        };

        Some(Self {
            status: value(ANNOTATION_EXECUTE_STATUS)?,
            container: value(ANNOTATION_EXECUTE_CONTAINER)?,
            action: value(ANNOTATION_EXECUTE_ACTION)?,
        })
    }

    /// Command tokens of the action.
    pub fn tokens(&self) -> Vec<String> {
        self.action.split_whitespace().map(String::from).collect()
    }
}

/// Compute a JSON merge patch turning `before` into `after`.
///
/// Only changed keys appear; removed keys are set to `null`. Returns `None`
/// when nothing changed.
pub fn merge_patch(
    before: &BTreeMap<String, String>,
    after: &BTreeMap<String, String>,
) -> Option<Value> {
    let mut changes = Map::new();

    for (key, value) in after {
        if before.get(key) != Some(value) {
            changes.insert(key.clone(), Value::String(value.clone()));
        }
    }
    for key in before.keys() {
        if !after.contains_key(key) {
            changes.insert(key.clone(), Value::Null);
        }
    }

    if changes.is_empty() {
        return None;
    }
    Some(json!({ "metadata": { "annotations": changes } }))
}

async fn apply(
    client: &dyn PodClient,
    pod: &mut Pod,
    after: BTreeMap<String, String>,
    ctx: &RequestContext,
) -> Result<()> {
    let name = pod.name_any();
    let namespace = pod.namespace().unwrap_or_default();

    let Some(patch) = merge_patch(pod.annotations(), &after) else {
        debug!("No annotation change for pod {}/{}", namespace, name);
        return Ok(());
    };

    client
        .patch_pod(&namespace, &name, &patch)
        .await
        .map_err(|source| Error::AnnotationPatchFailed {
            pod: name.clone(),
            source,
        })?;

    *pod.annotations_mut() = after;
    info!(request_id = %ctx.request_id, "Completed patching annotation on pod {}", name);
    Ok(())
}

/// Add or overwrite annotations on a pod in a single patch.
///
/// The local snapshot is updated only after the patch was accepted.
pub async fn upsert(
    client: &dyn PodClient,
    pod: &mut Pod,
    updates: &[(&str, &str)],
    ctx: &RequestContext,
) -> Result<()> {
    let mut after = pod.annotations().clone();
    for (key, value) in updates {
        after.insert(key.to_string(), value.to_string());
    }
    apply(client, pod, after, ctx).await
}

/// Remove annotations from a pod in a single patch.
///
/// Every key must be present, otherwise nothing is removed and
/// [`Error::AnnotationMissing`] is returned.
pub async fn remove(
    client: &dyn PodClient,
    pod: &mut Pod,
    keys: &[&str],
    ctx: &RequestContext,
) -> Result<()> {
    let mut after = pod.annotations().clone();
    for key in keys {
        if after.get(*key).map_or(true, |v| v.is_empty()) {
            return Err(Error::AnnotationMissing {
                key: key.to_string(),
            });
        }
        after.remove(*key);
    }
    apply(client, pod, after, ctx).await
}

/// Move the status annotation to `status`.
pub async fn set_status(
    client: &dyn PodClient,
    pod: &mut Pod,
    status: ExecuteStatus,
    ctx: &RequestContext,
) -> Result<()> {
    upsert(
        client,
        pod,
        &[(ANNOTATION_EXECUTE_STATUS, status.as_str())],
        ctx,
    )
    .await
}

/// Remove all protocol annotations, returning the pod to idle.
pub async fn clear(client: &dyn PodClient, pod: &mut Pod, ctx: &RequestContext) -> Result<()> {
    remove(client, pod, &PROTOCOL_KEYS, ctx).await
}
