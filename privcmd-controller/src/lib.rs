//! Privileged command controller.
//!
//! Runs host-level commands (`gdb`, `gcore`, `tcpdump`, ...) against an
//! unprivileged container. A client requests a command through annotations
//! on the target pod; the controller starts a privileged pod on the same
//! node, enters the target container's namespaces with `nsenter`, runs the
//! command and reports back through the same annotations.

pub mod annotations;
pub mod clients;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod privileged_pod;
pub mod reconciler;
pub mod request;

pub use clients::{ClientError, KubePodClient, PodClient, PodEvent};
pub use config::{ContainerRuntime, ControllerConfig};
pub use controller::Controller;
pub use error::{Error, Result};
pub use reconciler::{Outcome, Reconciler};
pub use request::RequestContext;
