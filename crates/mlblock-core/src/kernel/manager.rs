//! Kernel manager - provisioning, teardown and the registration handshake.

use std::sync::Arc;

use serde::Deserialize;

use crate::adapters::{ContainerHandle, ContainerRuntime, LaunchDescriptor};
use crate::config::KernelServiceConfig;
use crate::error::{Error, Result};
use crate::event::KernelEvent;
use crate::state::{KernelRepository, KernelResource, KernelStatus};

use super::WebhookClient;

/// Readiness report a worker posts to `/internal/register/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct Heartbeat {
    /// Webhook to notify once the kernel is reachable
    pub callback: String,
    /// Callback credential to present to the webhook
    pub token: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Owns kernel records and drives workers through the runtime.
pub struct KernelManager {
    repo: KernelRepository,
    runtime: Arc<dyn ContainerRuntime>,
    webhook: WebhookClient,
    image: String,
    orchestrator_url: String,
    config_file: String,
}

impl KernelManager {
    pub fn new(
        config: &KernelServiceConfig,
        repo: KernelRepository,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self> {
        Ok(Self {
            repo,
            runtime,
            webhook: WebhookClient::new(config.webhook_timeout())?,
            image: config.image.clone(),
            orchestrator_url: config.orchestrator_url.clone(),
            config_file: config.worker_config_file.clone(),
        })
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Create a STARTING record and launch its worker.
    ///
    /// A failed launch leaves the record behind without a handle.
    pub async fn allocate(&self, callback_url: &str, credential: &str) -> Result<KernelResource> {
        let mut kernel = KernelResource::new(self.image.clone());
        let record = kernel.clone();
        self.repo.blocking(move |repo| repo.insert(&record)).await?;

        let descriptor = LaunchDescriptor {
            kernel_id: kernel.id.clone(),
            orchestrator_url: self.orchestrator_url.clone(),
            callback_url: callback_url.to_string(),
            credential: credential.to_string(),
            config_file: self.config_file.clone(),
        };

        let handle = match self.runtime.launch(&kernel.container_image, &descriptor).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(kernel_id = %kernel.id, error = %e, "Kernel launch failed");
                return Err(e.into());
            }
        };

        let (id, container_id) = (kernel.id.clone(), handle.to_string());
        let attached = self
            .repo
            .blocking(move |repo| repo.attach_container(&id, &container_id))
            .await?;
        if !attached {
            tracing::warn!(
                kernel_id = %kernel.id,
                container_id = %handle,
                "Kernel deleted during launch, removing container"
            );
            self.runtime.terminate(&handle).await?;
            return Err(Error::kernel_not_found(&kernel.id));
        }
        kernel.container_id = Some(handle.to_string());

        tracing::info!(
            kernel_id = %kernel.id,
            container_id = %handle,
            "Kernel allocated"
        );
        Ok(kernel)
    }

    /// Delete the record, remove the worker and optionally notify the
    /// callback of the deletion.
    pub async fn delete(
        &self,
        kernel_id: &str,
        callback_url: Option<&str>,
        credential: Option<&str>,
    ) -> Result<()> {
        let kernel = self.get(kernel_id).await?;
        let id = kernel_id.to_string();
        if !self.repo.blocking(move |repo| repo.delete(&id)).await? {
            return Err(Error::kernel_not_found(kernel_id));
        }
        tracing::info!(kernel_id = %kernel_id, "Kernel record deleted");

        // Only a kernel that reached a container is announced as deleted.
        if let Some(handle) = kernel.handle() {
            self.runtime.terminate(&handle).await?;
            tracing::info!(kernel_id = %kernel_id, container_id = %handle, "Kernel container removed");

            if let (Some(url), Some(token)) = (callback_url, credential) {
                if let Err(e) = self
                    .webhook
                    .notify(url, token, &KernelEvent::deleted(kernel_id))
                    .await
                {
                    tracing::warn!(kernel_id = %kernel_id, error = %e, "Deleted notification failed");
                }
            }
        }
        Ok(())
    }

    pub async fn get(&self, kernel_id: &str) -> Result<KernelResource> {
        let id = kernel_id.to_string();
        self.repo
            .blocking(move |repo| repo.get(&id))
            .await?
            .ok_or_else(|| Error::kernel_not_found(kernel_id))
    }

    pub async fn list(&self) -> Result<Vec<KernelResource>> {
        Ok(self.repo.blocking(|repo| repo.list()).await?)
    }

    pub async fn find_by_handle(&self, handle: &ContainerHandle) -> Result<KernelResource> {
        let container_id = handle.to_string();
        self.repo
            .blocking(move |repo| repo.find_by_container_id(&container_id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("kernel for container {handle}")))
    }

    /// One-shot resource usage of the kernel's worker.
    pub async fn stats(&self, kernel_id: &str) -> Result<serde_json::Value> {
        let handle = self
            .get(kernel_id)
            .await?
            .handle()
            .ok_or_else(|| Error::Conflict("container not allocated".to_string()))?;
        Ok(self.runtime.stats(&handle).await?)
    }

    pub async fn runtime_version(&self) -> Result<serde_json::Value> {
        Ok(self.runtime.version().await?)
    }

    /// Registration handshake: the worker reports it is ready.
    ///
    /// Moves the kernel to RUNNING at its resolved address and notifies the
    /// worker's callback. If the address cannot be resolved or the callback
    /// fails, the worker is removed and the record deleted before the
    /// failure is returned.
    pub async fn register_container_ready(
        &self,
        kernel_id: &str,
        heartbeat: &Heartbeat,
    ) -> Result<KernelResource> {
        let kernel = self.get(kernel_id).await?;
        if !kernel.status.can_transition_to(KernelStatus::Running) {
            return Err(Error::Conflict(format!(
                "kernel {kernel_id} is {}, expected starting",
                kernel.status
            )));
        }
        let handle = kernel
            .handle()
            .ok_or_else(|| Error::Conflict("container not allocated".to_string()))?;

        tracing::info!(
            kernel_id = %kernel_id,
            version = heartbeat.version.as_deref().unwrap_or("unknown"),
            "Kernel registering"
        );

        let address = match self.runtime.resolve_address(&handle).await {
            Ok(address) => address,
            Err(e) => {
                self.compensate(kernel_id, &handle).await;
                return Err(Error::Upstream(format!(
                    "registration of kernel {kernel_id} failed: {e}"
                )));
            }
        };

        let url = format!("http://{address}");
        let (id, running_url) = (kernel_id.to_string(), url.clone());
        let marked = self
            .repo
            .blocking(move |repo| repo.mark_running(&id, &running_url))
            .await?;
        if !marked {
            return Err(Error::Conflict(format!(
                "kernel {kernel_id} left starting during registration"
            )));
        }

        let event = KernelEvent::started(kernel_id, &url);
        if let Err(e) = self
            .webhook
            .notify(&heartbeat.callback, &heartbeat.token, &event)
            .await
        {
            tracing::error!(kernel_id = %kernel_id, error = %e, "Started webhook failed, rolling back");
            self.compensate(kernel_id, &handle).await;
            return Err(Error::Upstream(format!(
                "registration of kernel {kernel_id} failed: {e}"
            )));
        }

        tracing::info!(kernel_id = %kernel_id, url = %url, "Kernel running");
        Ok(KernelResource {
            status: KernelStatus::Running,
            url: Some(url),
            ..kernel
        })
    }

    /// Remove the worker and the record. Absence of either is fine.
    async fn compensate(&self, kernel_id: &str, handle: &ContainerHandle) {
        if let Err(e) = self.runtime.terminate(handle).await {
            tracing::error!(
                kernel_id = %kernel_id,
                container_id = %handle,
                error = %e,
                "Failed to remove container during rollback"
            );
        }
        let id = kernel_id.to_string();
        match self.repo.blocking(move |repo| repo.delete(&id)).await {
            Ok(true) => tracing::info!(kernel_id = %kernel_id, "Kernel rolled back"),
            Ok(false) => tracing::debug!(kernel_id = %kernel_id, "Kernel already deleted"),
            Err(e) => tracing::error!(kernel_id = %kernel_id, error = %e, "Failed to delete kernel during rollback"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::adapters::FakeRuntime;

    fn manager(runtime: Arc<FakeRuntime>) -> (KernelManager, KernelRepository) {
        let repo = KernelRepository::in_memory().unwrap();
        let config = KernelServiceConfig {
            webhook_timeout_secs: 1,
            ..KernelServiceConfig::default()
        };
        let manager = KernelManager::new(&config, repo.clone(), runtime).unwrap();
        (manager, repo)
    }

    fn dead_callback() -> Heartbeat {
        Heartbeat {
            callback: "http://127.0.0.1:9/webhook/kernel/projects".to_string(),
            token: "tok".to_string(),
            version: Some("0.0.6".to_string()),
        }
    }

    #[tokio::test]
    async fn allocate_launches_with_descriptor() {
        let runtime = Arc::new(FakeRuntime::new());
        let (manager, _) = manager(runtime.clone());

        let kernel = manager.allocate("http://cb", "tok").await.unwrap();
        assert_eq!(kernel.status, KernelStatus::Starting);
        assert!(kernel.url.is_none());

        let launches = runtime.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].kernel_id, kernel.id);
        assert_eq!(launches[0].callback_url, "http://cb");
        assert_eq!(launches[0].credential, "tok");

        let handle = kernel.handle().unwrap();
        assert_eq!(manager.find_by_handle(&handle).await.unwrap().id, kernel.id);
    }

    #[tokio::test]
    async fn failed_launch_leaves_orphan_record() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_launches(true);
        let (manager, repo) = manager(runtime);

        assert!(matches!(
            manager.allocate("http://cb", "tok").await,
            Err(Error::Runtime(_))
        ));
        let orphans = repo.list().unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].status, KernelStatus::Starting);
        assert!(orphans[0].container_id.is_none());
    }

    #[tokio::test]
    async fn delete_removes_record_and_worker() {
        let runtime = Arc::new(FakeRuntime::new());
        let (manager, _) = manager(runtime.clone());
        let kernel = manager.allocate("http://cb", "tok").await.unwrap();

        manager
            .delete(&kernel.id, Some("http://127.0.0.1:9/cb"), Some("tok"))
            .await
            .unwrap();

        assert!(!runtime.is_live(&kernel.handle().unwrap()));
        assert!(matches!(manager.get(&kernel.id).await, Err(Error::NotFound(_))));
        assert!(matches!(
            manager.delete(&kernel.id, None, None).await,
            Err(Error::NotFound(_))
        ));
    }

    async fn counting_callback() -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = axum::Router::new().route(
            "/cb",
            axum::routing::put(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    axum::http::StatusCode::OK
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}/cb"), hits)
    }

    #[tokio::test]
    async fn deleted_notification_only_for_launched_kernels() {
        let runtime = Arc::new(FakeRuntime::new());
        let (manager, repo) = manager(runtime);
        let (callback, hits) = counting_callback().await;

        let orphan = KernelResource::new("img");
        repo.insert(&orphan).unwrap();
        manager
            .delete(&orphan.id, Some(&callback), Some("tok"))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let launched = manager.allocate("http://cb", "tok").await.unwrap();
        manager
            .delete(&launched.id, Some(&callback), Some("tok"))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stats_requires_a_container() {
        let runtime = Arc::new(FakeRuntime::new());
        let (manager, repo) = manager(runtime);
        let bare = KernelResource::new("img");
        repo.insert(&bare).unwrap();

        assert!(matches!(manager.stats(&bare.id).await, Err(Error::Conflict(_))));
        assert!(matches!(manager.stats("missing").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn register_unknown_kernel_is_not_found() {
        let (manager, _) = manager(Arc::new(FakeRuntime::new()));
        assert!(matches!(
            manager.register_container_ready("missing", &dead_callback()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_webhook_rolls_registration_back() {
        let runtime = Arc::new(FakeRuntime::new().with_address("127.0.0.1:4000"));
        let (manager, _) = manager(runtime.clone());
        let kernel = manager.allocate("http://cb", "tok").await.unwrap();
        let handle = kernel.handle().unwrap();

        let err = manager
            .register_container_ready(&kernel.id, &dead_callback())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Upstream(_)));
        assert!(matches!(manager.get(&kernel.id).await, Err(Error::NotFound(_))));
        assert!(!runtime.is_live(&handle));
    }

    #[tokio::test]
    async fn unresolvable_address_rolls_registration_back() {
        let runtime = Arc::new(FakeRuntime::new());
        let (manager, _) = manager(runtime.clone());
        let kernel = manager.allocate("http://cb", "tok").await.unwrap();

        assert!(manager
            .register_container_ready(&kernel.id, &dead_callback())
            .await
            .is_err());
        assert!(matches!(manager.get(&kernel.id).await, Err(Error::NotFound(_))));
        assert_eq!(runtime.terminated().len(), 1);
    }

    #[tokio::test]
    async fn register_refuses_exited_kernels() {
        let runtime = Arc::new(FakeRuntime::new().with_address("127.0.0.1:4000"));
        let (manager, repo) = manager(runtime);
        let kernel = manager.allocate("http://cb", "tok").await.unwrap();
        repo.mark_exited(&kernel.id, KernelStatus::Error).unwrap();

        assert!(matches!(
            manager.register_container_ready(&kernel.id, &dead_callback()).await,
            Err(Error::Conflict(_))
        ));
        assert_eq!(manager.get(&kernel.id).await.unwrap().status, KernelStatus::Error);
    }
}
