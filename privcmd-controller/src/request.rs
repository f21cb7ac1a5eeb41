//! Per-event request identity.

use std::fmt;

use uuid::Uuid;

/// Identity of one qualifying pod update.
///
/// The privileged pod name is a pure function of the target pod and
/// container, so every event for the same request addresses the same helper
/// pod. The request id only correlates log lines and labels the privileged
/// pod; it is never written to the target pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub privileged_pod_name: String,
    pub request_id: Uuid,
}

impl RequestContext {
    /// Fresh context for a request against `container` of `pod`.
    pub fn for_target(pod: &str, container: &str) -> Self {
        Self::new(privileged_pod_name(pod, container), Uuid::new_v4())
    }

    pub fn new(privileged_pod_name: impl Into<String>, request_id: Uuid) -> Self {
        Self {
            privileged_pod_name: privileged_pod_name.into(),
            request_id,
        }
    }
}

impl fmt::Display for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.privileged_pod_name, self.request_id)
    }
}

/// Name of the privileged pod serving `container` of `pod`.
pub fn privileged_pod_name(pod: &str, container: &str) -> String {
    format!("priv_{}_{}", pod, container)
        .replace('_', "-")
        .to_lowercase()
}
