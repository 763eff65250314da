//! Event reconciler - corrects kernel status from runtime lifecycle events.
//!
//! Runs apart from the request server, with its own store connection and
//! runtime client. Coordination with the kernel manager happens only
//! through persisted kernel records.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;

use crate::adapters::{ContainerRuntime, RuntimeError, RuntimeEvent};
use crate::error::{Error, Result};
use crate::state::{KernelRepository, KernelStatus, StoreError};

const EXIT_CODE_ATTRIBUTE: &str = "exitCode";

/// What a single event did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Not a container death
    Ignored,
    /// Death event without a usable id or exit code
    Malformed,
    /// No kernel owns the container
    Untracked,
    /// Kernel already exited
    Unchanged,
    Updated(KernelStatus),
}

pub struct EventReconciler {
    repo: KernelRepository,
    runtime: Arc<dyn ContainerRuntime>,
    fatal_exit_codes: Vec<i64>,
}

impl EventReconciler {
    pub fn new(
        repo: KernelRepository,
        runtime: Arc<dyn ContainerRuntime>,
        fatal_exit_codes: Vec<i64>,
    ) -> Self {
        Self {
            repo,
            runtime,
            fatal_exit_codes,
        }
    }

    /// Status a worker exiting with `code` ends up in.
    pub fn status_for_exit(&self, code: i64) -> KernelStatus {
        if self.fatal_exit_codes.contains(&code) {
            KernelStatus::Error
        } else {
            KernelStatus::Stopped
        }
    }

    /// Apply one runtime event.
    pub fn apply(&self, event: &RuntimeEvent) -> Result<ReconcileOutcome, StoreError> {
        if !event.is_container_death() {
            return Ok(ReconcileOutcome::Ignored);
        }

        let Some(container_id) = event.id.as_deref().filter(|id| !id.is_empty()) else {
            tracing::warn!("Death event without container id, skipping");
            return Ok(ReconcileOutcome::Malformed);
        };

        let Some(raw) = event.attributes.get(EXIT_CODE_ATTRIBUTE).map(|raw| raw.trim()) else {
            tracing::warn!(container_id = %container_id, "Death event without exit code, skipping");
            return Ok(ReconcileOutcome::Malformed);
        };

        // An empty exit code is a clean exit.
        let code = match raw {
            "" => 0,
            raw => match raw.parse::<i64>() {
                Ok(code) => code,
                Err(_) => {
                    tracing::warn!(
                        container_id = %container_id,
                        exit_code = %raw,
                        "Unparsable exit code, skipping"
                    );
                    return Ok(ReconcileOutcome::Malformed);
                }
            },
        };

        let Some(kernel) = self.repo.find_by_container_id(container_id)? else {
            tracing::debug!(container_id = %container_id, "Untracked container died");
            return Ok(ReconcileOutcome::Untracked);
        };

        let status = self.status_for_exit(code);
        if !self.repo.mark_exited(&kernel.id, status)? {
            tracing::debug!(kernel_id = %kernel.id, "Kernel already exited");
            return Ok(ReconcileOutcome::Unchanged);
        }

        tracing::info!(
            kernel_id = %kernel.id,
            container_id = %container_id,
            exit_code = code,
            status = %status,
            "Kernel exited"
        );
        Ok(ReconcileOutcome::Updated(status))
    }

    /// Consume the runtime event stream until `shutdown` resolves.
    ///
    /// Returns an error if the stream fails or ends, or the store becomes
    /// unusable; the caller is expected to exit and be restarted.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut events = self.runtime.events();
        let this = Arc::new(self);
        tokio::pin!(shutdown);

        tracing::info!("Reconciler watching runtime events");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Reconciler stopping");
                    return Ok(());
                }
                next = events.next() => match next {
                    Some(Ok(event)) => {
                        let worker = this.clone();
                        match tokio::task::spawn_blocking(move || worker.apply(&event)).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(StoreError::Poisoned)) => return Err(StoreError::Poisoned.into()),
                            Ok(Err(e)) => {
                                tracing::error!(error = %e, "Failed to reconcile event");
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "Reconcile task failed");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Runtime event stream failed");
                        return Err(Error::Runtime(e));
                    }
                    None => {
                        tracing::error!("Runtime event stream ended");
                        return Err(Error::Runtime(RuntimeError::EventStreamClosed));
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::FakeRuntime;
    use crate::state::KernelResource;

    fn tracked(repo: &KernelRepository, container_id: &str) -> KernelResource {
        let kernel = KernelResource::new("img");
        repo.insert(&kernel).unwrap();
        repo.attach_container(&kernel.id, container_id).unwrap();
        kernel
    }

    fn reconciler(repo: &KernelRepository) -> EventReconciler {
        EventReconciler::new(repo.clone(), Arc::new(FakeRuntime::new()), vec![1])
    }

    #[test]
    fn exit_codes_map_to_status() {
        let repo = KernelRepository::in_memory().unwrap();
        let failed = tracked(&repo, "c1");
        let clean = tracked(&repo, "c2");
        let reconciler = reconciler(&repo);

        assert_eq!(
            reconciler.apply(&RuntimeEvent::container_died("c1", Some("1"))).unwrap(),
            ReconcileOutcome::Updated(KernelStatus::Error)
        );
        assert_eq!(
            reconciler.apply(&RuntimeEvent::container_died("c2", Some("0"))).unwrap(),
            ReconcileOutcome::Updated(KernelStatus::Stopped)
        );

        assert_eq!(repo.get(&failed.id).unwrap().unwrap().status, KernelStatus::Error);
        assert_eq!(repo.get(&clean.id).unwrap().unwrap().status, KernelStatus::Stopped);
    }

    #[test]
    fn untracked_and_irrelevant_events_change_nothing() {
        let repo = KernelRepository::in_memory().unwrap();
        let kernel = tracked(&repo, "c1");
        let reconciler = reconciler(&repo);

        assert_eq!(
            reconciler.apply(&RuntimeEvent::container_died("other", Some("1"))).unwrap(),
            ReconcileOutcome::Untracked
        );
        let start = RuntimeEvent {
            kind: Some("container".to_string()),
            action: Some("start".to_string()),
            id: Some("c1".to_string()),
            ..RuntimeEvent::default()
        };
        assert_eq!(reconciler.apply(&start).unwrap(), ReconcileOutcome::Ignored);
        assert_eq!(repo.get(&kernel.id).unwrap().unwrap().status, KernelStatus::Starting);
    }

    #[test]
    fn malformed_deaths_are_skipped() {
        let repo = KernelRepository::in_memory().unwrap();
        let kernel = tracked(&repo, "c1");
        let reconciler = reconciler(&repo);

        assert_eq!(
            reconciler.apply(&RuntimeEvent::container_died("c1", Some("boom"))).unwrap(),
            ReconcileOutcome::Malformed
        );
        let anonymous = RuntimeEvent {
            id: None,
            ..RuntimeEvent::container_died("", Some("1"))
        };
        assert_eq!(reconciler.apply(&anonymous).unwrap(), ReconcileOutcome::Malformed);
        assert_eq!(repo.get(&kernel.id).unwrap().unwrap().status, KernelStatus::Starting);
    }

    #[test]
    fn second_death_is_unchanged() {
        let repo = KernelRepository::in_memory().unwrap();
        tracked(&repo, "c1");
        let reconciler = reconciler(&repo);

        reconciler.apply(&RuntimeEvent::container_died("c1", Some(""))).unwrap();
        assert_eq!(
            reconciler.apply(&RuntimeEvent::container_died("c1", Some("1"))).unwrap(),
            ReconcileOutcome::Unchanged
        );
    }

    #[test]
    fn missing_exit_code_is_skipped() {
        let repo = KernelRepository::in_memory().unwrap();
        let kernel = tracked(&repo, "c1");
        let reconciler = reconciler(&repo);

        assert_eq!(
            reconciler.apply(&RuntimeEvent::container_died("c1", None)).unwrap(),
            ReconcileOutcome::Malformed
        );
        assert_eq!(repo.get(&kernel.id).unwrap().unwrap().status, KernelStatus::Starting);

        assert_eq!(
            reconciler.apply(&RuntimeEvent::container_died("c1", Some(""))).unwrap(),
            ReconcileOutcome::Updated(KernelStatus::Stopped)
        );
    }

    #[tokio::test]
    async fn run_applies_events_and_fails_when_stream_ends() {
        let repo = KernelRepository::in_memory().unwrap();
        let kernel = tracked(&repo, "c1");
        let runtime = Arc::new(FakeRuntime::new());
        let reconciler = EventReconciler::new(repo.clone(), runtime.clone(), vec![1]);

        runtime.emit(RuntimeEvent::container_died("c1", Some("1")));
        runtime.close_events();

        let result = reconciler.run(std::future::pending()).await;
        assert!(matches!(
            result,
            Err(Error::Runtime(RuntimeError::EventStreamClosed))
        ));
        assert_eq!(repo.get(&kernel.id).unwrap().unwrap().status, KernelStatus::Error);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let repo = KernelRepository::in_memory().unwrap();
        let reconciler = reconciler(&repo);
        reconciler.run(async {}).await.unwrap();
    }
}
