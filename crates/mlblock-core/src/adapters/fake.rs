//! In-memory runtime used by tests and local dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;

use super::{ContainerHandle, ContainerRuntime, LaunchDescriptor, RuntimeError, RuntimeEvent};

#[derive(Default)]
struct FakeState {
    next_id: u64,
    launches: Vec<LaunchDescriptor>,
    live: HashSet<String>,
    addresses: HashMap<String, String>,
    default_address: Option<String>,
    terminated: Vec<ContainerHandle>,
    fail_launches: bool,
}

/// A [`ContainerRuntime`] that launches nothing.
///
/// Launches are recorded, addresses are whatever the caller configured,
/// and lifecycle events are injected with [`FakeRuntime::emit`].
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<RuntimeEvent>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<RuntimeEvent>>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(FakeState::default()),
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
        }
    }

    /// Every launched worker resolves to `address` unless overridden.
    pub fn with_address(self, address: impl Into<String>) -> Self {
        self.state().default_address = Some(address.into());
        self
    }

    pub fn set_address(&self, handle: &ContainerHandle, address: impl Into<String>) {
        self.state()
            .addresses
            .insert(handle.as_str().to_string(), address.into());
    }

    /// Make subsequent launches fail.
    pub fn fail_launches(&self, fail: bool) {
        self.state().fail_launches = fail;
    }

    pub fn launches(&self) -> Vec<LaunchDescriptor> {
        self.state().launches.clone()
    }

    pub fn terminated(&self) -> Vec<ContainerHandle> {
        self.state().terminated.clone()
    }

    pub fn is_live(&self, handle: &ContainerHandle) -> bool {
        self.state().live.contains(handle.as_str())
    }

    /// Push an event onto the stream returned by [`ContainerRuntime::events`].
    pub fn emit(&self, event: RuntimeEvent) {
        if let Some(tx) = self.sender().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// End the event stream once buffered events have drained.
    pub fn close_events(&self) {
        self.sender().take();
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<RuntimeEvent>>> {
        self.events_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn launch(
        &self,
        image: &str,
        descriptor: &LaunchDescriptor,
    ) -> Result<ContainerHandle, RuntimeError> {
        let mut state = self.state();
        if state.fail_launches {
            return Err(RuntimeError::Operation {
                operation: "launch",
                target: image.to_string(),
                message: "launch disabled".to_string(),
            });
        }

        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.launches.push(descriptor.clone());
        state.live.insert(id.clone());
        Ok(ContainerHandle::new(id))
    }

    async fn terminate(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.live.remove(handle.as_str());
        state.terminated.push(handle.clone());
        Ok(())
    }

    async fn resolve_address(&self, handle: &ContainerHandle) -> Result<String, RuntimeError> {
        let state = self.state();
        if !state.live.contains(handle.as_str()) {
            return Err(RuntimeError::Operation {
                operation: "inspect",
                target: handle.to_string(),
                message: "no such container".to_string(),
            });
        }
        state
            .addresses
            .get(handle.as_str())
            .or(state.default_address.as_ref())
            .cloned()
            .ok_or_else(|| RuntimeError::NoAddress(handle.to_string()))
    }

    async fn stats(&self, handle: &ContainerHandle) -> Result<serde_json::Value, RuntimeError> {
        Ok(json!({ "id": handle.as_str(), "live": self.is_live(handle) }))
    }

    async fn version(&self) -> Result<serde_json::Value, RuntimeError> {
        Ok(json!({ "Version": "fake" }))
    }

    fn events(&self) -> BoxStream<'static, Result<RuntimeEvent, RuntimeError>> {
        let taken = self
            .events_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        match taken {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (Ok(event), rx))
            })
            .boxed(),
            None => stream::iter([Err(RuntimeError::EventStreamClosed)]).boxed(),
        }
    }
}
