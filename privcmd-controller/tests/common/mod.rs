//! Shared test utilities for privcmd-controller integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use privcmd_controller::annotations::{
    ANNOTATION_EXECUTE_ACTION, ANNOTATION_EXECUTE_CONTAINER, ANNOTATION_EXECUTE_STATUS,
};
use privcmd_controller::clients::{ExecOutput, PodEventStream, PodWatch};
use privcmd_controller::privileged_pod::LABEL_REQUEST_ID;
use privcmd_controller::{ClientError, Controller, ControllerConfig, PodClient, PodEvent};

pub const TARGET_NAMESPACE: &str = "default";
pub const TARGET_POD: &str = "test-pod";
pub const TARGET_CONTAINER: &str = "target-container";
pub const TARGET_NODE: &str = "targetNode";
pub const PRIV_NAMESPACE: &str = "kube-pcc";
pub const PRIV_POD: &str = "priv-test-pod-target-container";
pub const PID: &str = "4242";

/// A command run through [`PodClient::exec`].
#[derive(Debug, Clone)]
pub struct ExecCall {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
}

/// A merge patch submitted through [`PodClient::patch_pod`].
#[derive(Debug, Clone)]
pub struct RecordedPatch {
    pub namespace: String,
    pub name: String,
    pub patch: Value,
}

impl RecordedPatch {
    /// Value the patch assigns to the status annotation, `Null` if removed.
    pub fn status(&self) -> Option<&Value> {
        self.patch["metadata"]["annotations"].get(ANNOTATION_EXECUTE_STATUS)
    }
}

#[derive(Default)]
struct State {
    pods: HashMap<(String, String), Pod>,
    watchers: Vec<(String, String, mpsc::UnboundedSender<Result<Pod, ClientError>>)>,
    events: VecDeque<PodEvent>,
    exec_calls: Vec<ExecCall>,
    patches: Vec<RecordedPatch>,
    auto_run: bool,
    fail_patches: bool,
    fail_exec: bool,
    exec_stderr: String,
    exec_delay: Option<Duration>,
}

impl State {
    fn publish(&mut self, pod: &Pod, deleted: bool) {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();

        if deleted {
            self.events.push_back(PodEvent::Deleted(pod.clone()));
        } else {
            self.events.push_back(PodEvent::Applied(pod.clone()));
            // Closed watches are dropped on the next matching update.
            self.watchers.retain(|(ns, n, tx)| {
                *ns != namespace || *n != name || tx.send(Ok(pod.clone())).is_ok()
            });
        }
    }
}

/// In-memory cluster implementing [`PodClient`].
///
/// Every change is queued as a [`PodEvent`]; tests feed them to the
/// controller with [`pump`]. Privileged pods stay without a status unless
/// `auto_run` is set, in which case they are created already running.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cluster where privileged pods start running immediately.
    pub fn running() -> Self {
        let cluster = Self::new();
        cluster.state.lock().unwrap().auto_run = true;
        cluster
    }

    pub fn set_fail_patches(&self, fail: bool) {
        self.state.lock().unwrap().fail_patches = fail;
    }

    pub fn set_fail_exec(&self, fail: bool) {
        self.state.lock().unwrap().fail_exec = fail;
    }

    pub fn set_exec_stderr(&self, stderr: &str) {
        self.state.lock().unwrap().exec_stderr = stderr.to_string();
    }

    pub fn set_exec_delay(&self, delay: Duration) {
        self.state.lock().unwrap().exec_delay = Some(delay);
    }

    /// Store a pod and publish it as applied.
    pub fn insert_pod(&self, pod: Pod) {
        let mut state = self.state.lock().unwrap();
        let key = (
            pod.metadata.namespace.clone().unwrap_or_default(),
            pod.metadata.name.clone().unwrap_or_default(),
        );
        state.pods.insert(key, pod.clone());
        state.publish(&pod, false);
    }

    /// Overwrite annotations as an external client would.
    pub fn annotate<K: AsRef<str>, V: AsRef<str>>(
        &self,
        namespace: &str,
        name: &str,
        annotations: &[(K, V)],
    ) {
        let mut state = self.state.lock().unwrap();
        let pod = {
            let pod = state
                .pods
                .get_mut(&(namespace.to_string(), name.to_string()))
                .expect("pod to annotate");
            let map = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
            for (key, value) in annotations {
                map.insert(key.as_ref().to_string(), value.as_ref().to_string());
            }
            pod.clone()
        };
        state.publish(&pod, false);
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state
            .lock()
            .unwrap()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn annotations(&self, namespace: &str, name: &str) -> BTreeMap<String, String> {
        self.pod(namespace, name)
            .and_then(|pod| pod.metadata.annotations)
            .unwrap_or_default()
    }

    pub fn take_events(&self) -> Vec<PodEvent> {
        self.state.lock().unwrap().events.drain(..).collect()
    }

    pub fn exec_calls(&self) -> Vec<ExecCall> {
        self.state.lock().unwrap().exec_calls.clone()
    }

    pub fn patches(&self) -> Vec<RecordedPatch> {
        self.state.lock().unwrap().patches.clone()
    }

    /// Status values written by patches, in order. Removal shows as `None`.
    pub fn status_writes(&self) -> Vec<Option<String>> {
        self.patches()
            .iter()
            .filter_map(|p| p.status().map(|v| v.as_str().map(String::from)))
            .collect()
    }
}

#[async_trait]
impl PodClient for FakeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClientError> {
        Ok(self.pod(namespace, name))
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, ClientError> {
        let mut state = self.state.lock().unwrap();
        let name = pod.metadata.name.clone().unwrap_or_default();
        let key = (namespace.to_string(), name.clone());
        if state.pods.contains_key(&key) {
            return Err(ClientError::AlreadyExists(name));
        }

        let mut created = pod.clone();
        created.metadata.namespace = Some(namespace.to_string());
        if state.auto_run {
            created.status = Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            });
        }
        state.pods.insert(key, created.clone());
        state.publish(&created, false);
        Ok(created)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        match state.pods.remove(&(namespace.to_string(), name.to_string())) {
            Some(pod) => {
                state.publish(&pod, true);
                Ok(())
            }
            None => Err(ClientError::NotFound(name.to_string())),
        }
    }

    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<Pod, ClientError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_patches {
            return Err(ClientError::Other("the object has been modified".to_string()));
        }

        let pod = {
            let pod = state
                .pods
                .get_mut(&(namespace.to_string(), name.to_string()))
                .ok_or_else(|| ClientError::NotFound(name.to_string()))?;
            if let Some(changes) = patch["metadata"]["annotations"].as_object() {
                let map = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
                for (key, value) in changes {
                    match value.as_str() {
                        Some(value) => {
                            map.insert(key.clone(), value.to_string());
                        }
                        None => {
                            map.remove(key);
                        }
                    }
                }
            }
            pod.clone()
        };

        state.patches.push(RecordedPatch {
            namespace: namespace.to_string(),
            name: name.to_string(),
            patch: patch.clone(),
        });
        state.publish(&pod, false);
        Ok(pod)
    }

    async fn watch_pod(&self, namespace: &str, name: &str) -> Result<PodWatch, ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        if let Some(pod) = state.pods.get(&(namespace.to_string(), name.to_string())) {
            let _ = tx.send(Ok(pod.clone()));
        }
        state
            .watchers
            .push((namespace.to_string(), name.to_string(), tx));
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    /// Replays the queued events, then ends.
    fn watch_pods(&self) -> PodEventStream {
        let events = self.take_events();
        futures::stream::iter(events.into_iter().map(Ok)).boxed()
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput, ClientError> {
        let (delay, fail, stderr) = {
            let mut state = self.state.lock().unwrap();
            state.exec_calls.push(ExecCall {
                namespace: namespace.to_string(),
                pod: pod.to_string(),
                container: container.to_string(),
                command: command.to_vec(),
            });
            (state.exec_delay, state.fail_exec, state.exec_stderr.clone())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(ClientError::Exec(
                "command terminated with non-zero exit code".to_string(),
            ));
        }

        let stdout = match command.first().map(String::as_str) {
            Some("docker") => format!("'{}'\n", PID),
            Some("crictl") => format!("{}\n", PID),
            _ => format!("ran {}\n", command.join(" ")),
        };
        Ok(ExecOutput { stdout, stderr })
    }
}

/// Configuration used by the tests: 3 second pod timeout.
pub fn test_config() -> ControllerConfig {
    let mut config = ControllerConfig::new("registry.local/priv-tools:latest");
    config.pod_running_timeout = Duration::from_secs(3);
    config
}

/// Target pod on `targetNode` whose container runs as `docker://containerid`.
pub fn target_pod<K: AsRef<str>, V: AsRef<str>>(annotations: &[(K, V)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(TARGET_POD.to_string()),
            namespace: Some(TARGET_NAMESPACE.to_string()),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(TARGET_NODE.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: TARGET_CONTAINER.to_string(),
                container_id: Some("docker://containerid".to_string()),
                ready: true,
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// The three protocol annotations for `status` on the target container.
pub fn request(status: &str, action: &str) -> Vec<(&'static str, String)> {
    vec![
        (ANNOTATION_EXECUTE_STATUS, status.to_string()),
        (ANNOTATION_EXECUTE_CONTAINER, TARGET_CONTAINER.to_string()),
        (ANNOTATION_EXECUTE_ACTION, action.to_string()),
    ]
}

/// Privileged pod with the derived name, labelled as owned by `owner`.
pub fn privileged_pod(owner: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(PRIV_POD.to_string()),
            namespace: Some(PRIV_NAMESPACE.to_string()),
            labels: Some(BTreeMap::from([(
                LABEL_REQUEST_ID.to_string(),
                owner.to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Feed queued events to the controller until the cluster is quiet.
pub async fn pump(controller: &mut Controller, cluster: &FakeCluster) {
    for _ in 0..20 {
        let events = cluster.take_events();
        if events.is_empty() {
            return;
        }
        for event in events {
            controller.handle_event(event).await;
        }
    }
    panic!("controller did not settle");
}
