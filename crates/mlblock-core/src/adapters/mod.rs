//! Adapters - container runtime integrations that host kernel workers.

mod docker;
mod fake;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use docker::DockerRuntime;
pub use fake::FakeRuntime;

/// Opaque runtime identifier of a launched worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerHandle(String);

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parameters handed to a spawned worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchDescriptor {
    pub kernel_id: String,
    pub orchestrator_url: String,
    pub callback_url: String,
    pub credential: String,
    pub config_file: String,
}

impl LaunchDescriptor {
    /// Environment contract of the worker image, as `KEY=value` pairs.
    pub fn env(&self) -> Vec<String> {
        vec![
            format!("KERNEL_ID={}", self.kernel_id),
            format!("KERNEL_MASTER_HOST={}", self.orchestrator_url),
            format!("CALLBACK_URL={}", self.callback_url),
            format!("AUTH_TOKEN={}", self.credential),
            format!("KERNEL_CONFIG_FILE={}", self.config_file),
        ]
    }
}

/// One lifecycle event from the runtime's event stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeEvent {
    /// Object type, e.g. `container`
    pub kind: Option<String>,
    /// Action, e.g. `die`
    pub action: Option<String>,
    /// Handle id of the object the event is about
    pub id: Option<String>,
    pub attributes: HashMap<String, String>,
}

impl RuntimeEvent {
    /// A container death event with the given exit code attribute.
    pub fn container_died(id: impl Into<String>, exit_code: Option<&str>) -> Self {
        let mut attributes = HashMap::new();
        if let Some(code) = exit_code {
            attributes.insert("exitCode".to_string(), code.to_string());
        }
        Self {
            kind: Some("container".to_string()),
            action: Some("die".to_string()),
            id: Some(id.into()),
            attributes,
        }
    }

    pub fn is_container_death(&self) -> bool {
        self.kind.as_deref() == Some("container") && self.action.as_deref() == Some("die")
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to connect to container runtime at {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    #[error("container runtime {operation} failed for {target}: {message}")]
    Operation {
        operation: &'static str,
        target: String,
        message: String,
    },

    #[error("container {0} publishes no address for the worker port")]
    NoAddress(String),

    #[error("runtime event stream ended")]
    EventStreamClosed,
}

/// Capabilities the orchestrator needs from the execution substrate.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Launch a worker from `image`.
    async fn launch(
        &self,
        image: &str,
        descriptor: &LaunchDescriptor,
    ) -> Result<ContainerHandle, RuntimeError>;

    /// Force-remove a worker. An already-absent worker is success.
    async fn terminate(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// `host:port` reachable from outside the substrate.
    async fn resolve_address(&self, handle: &ContainerHandle) -> Result<String, RuntimeError>;

    /// One-shot resource usage snapshot.
    async fn stats(&self, handle: &ContainerHandle) -> Result<serde_json::Value, RuntimeError>;

    /// Runtime version details.
    async fn version(&self) -> Result<serde_json::Value, RuntimeError>;

    /// Whether the runtime answers at all.
    async fn ping(&self) -> bool {
        self.version().await.is_ok()
    }

    /// Infinite lifecycle event stream. Not restartable.
    fn events(&self) -> BoxStream<'static, Result<RuntimeEvent, RuntimeError>>;
}
