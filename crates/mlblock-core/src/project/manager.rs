//! Project manager - project sessions and their kernel binding.
//!
//! Binding state machine:
//!
//! ```text
//! DISCONNECTED/ERROR --connect--> CONNECTING --started webhook--> CONNECTED
//! CONNECTED --disconnect--> DISCONNECTED
//! ```
//!
//! A CONNECTING project cannot be disconnected. The move into CONNECTING
//! is a conditional store update, so only one provisioning request is ever
//! in flight per project.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::event::{KernelEvent, KernelEventType};
use crate::state::{BindingStatus, Project, ProjectRepository};

use super::KernelProvisioner;

/// Result of a connect request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectOutcome {
    pub status: BindingStatus,
    /// Bound kernel; never set while CONNECTING
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_id: Option<String>,
}

pub struct ProjectManager {
    repo: ProjectRepository,
    provisioner: Arc<dyn KernelProvisioner>,
}

impl ProjectManager {
    pub fn new(repo: ProjectRepository, provisioner: Arc<dyn KernelProvisioner>) -> Self {
        Self { repo, provisioner }
    }

    pub async fn create(&self) -> Result<Project> {
        let project = Project::new();
        let record = project.clone();
        self.repo.blocking(move |repo| repo.insert(&record)).await?;
        tracing::info!(project_id = %project.id, name = %project.name, "Project created");
        Ok(project)
    }

    pub async fn list(&self, skip: u32, limit: u32) -> Result<Vec<Project>> {
        Ok(self.repo.blocking(move |repo| repo.list(skip, limit)).await?)
    }

    pub async fn get(&self, project_id: &str) -> Result<Project> {
        let id = project_id.to_string();
        self.repo
            .blocking(move |repo| repo.get(&id))
            .await?
            .ok_or_else(|| Error::project_not_found(project_id))
    }

    /// Delete a project, tearing down its kernel first if one is bound.
    pub async fn delete(&self, project_id: &str) -> Result<()> {
        let project = self.get(project_id).await?;
        if let Some(kernel_id) = &project.kernel_id {
            if let Err(e) = self.provisioner.stop_kernel(project_id, kernel_id).await {
                tracing::warn!(
                    project_id = %project_id,
                    kernel_id = %kernel_id,
                    error = %e,
                    "Kernel teardown failed, deleting project anyway"
                );
            }
        }
        let id = project_id.to_string();
        if !self.repo.blocking(move |repo| repo.delete(&id)).await? {
            return Err(Error::project_not_found(project_id));
        }
        tracing::info!(project_id = %project_id, "Project deleted");
        Ok(())
    }

    /// Store the opaque workflow graph.
    pub async fn checkpoint(
        &self,
        project_id: &str,
        graph: serde_json::Value,
    ) -> Result<DateTime<Utc>> {
        let id = project_id.to_string();
        if !self.repo.blocking(move |repo| repo.save_graph(&id, &graph)).await? {
            return Err(Error::project_not_found(project_id));
        }
        tracing::debug!(project_id = %project_id, "Graph checkpointed");
        Ok(Utc::now())
    }

    /// Request a kernel for the project.
    ///
    /// A project that is bound or already connecting is returned as-is.
    /// If provisioning fails the error is returned and the project stays
    /// CONNECTING.
    pub async fn connect_kernel(&self, project_id: &str) -> Result<ConnectOutcome> {
        let project = self.get(project_id).await?;

        let id = project_id.to_string();
        if project.has_binding() || !self.repo.blocking(move |repo| repo.begin_connect(&id)).await? {
            let current = self.get(project_id).await?;
            tracing::debug!(
                project_id = %project_id,
                status = %current.kernel_status,
                "Connect ignored, binding already present"
            );
            return Ok(ConnectOutcome {
                status: current.kernel_status,
                kernel_id: current.kernel_id,
            });
        }
        tracing::info!(project_id = %project_id, "Project connecting");

        match self.provisioner.provision_kernel(project_id).await {
            Ok(kernel) => {
                tracing::debug!(project_id = %project_id, kernel_id = %kernel.id, "Kernel requested");
                Ok(ConnectOutcome {
                    status: BindingStatus::Connecting,
                    kernel_id: None,
                })
            }
            Err(e) => {
                tracing::error!(
                    project_id = %project_id,
                    error = %e,
                    "Kernel provisioning failed, project left connecting"
                );
                Err(e)
            }
        }
    }

    /// Release the project's kernel.
    pub async fn disconnect_kernel(&self, project_id: &str) -> Result<Project> {
        let project = self.get(project_id).await?;
        if project.kernel_status == BindingStatus::Connecting {
            return Err(Error::NotImplemented(
                "disconnect while a kernel is connecting".to_string(),
            ));
        }

        if let Some(kernel_id) = &project.kernel_id {
            self.provisioner.stop_kernel(project_id, kernel_id).await?;
        }

        let id = project_id.to_string();
        if !self.repo.blocking(move |repo| repo.release_binding(&id)).await? {
            let current = self.get(project_id).await?;
            return Err(Error::Conflict(format!(
                "project {project_id} became {} during disconnect",
                current.kernel_status
            )));
        }
        tracing::info!(project_id = %project_id, "Project disconnected");
        self.get(project_id).await
    }

    /// Webhook entry point for kernel lifecycle events.
    pub async fn handle_kernel_event(
        &self,
        project_id: &str,
        event: &KernelEvent,
    ) -> Result<Project> {
        self.get(project_id).await?;

        match event.kind {
            KernelEventType::Started => {
                let url = event
                    .kernel_url
                    .as_deref()
                    .filter(|url| !url.trim().is_empty())
                    .ok_or_else(|| {
                        Error::Validation("started event without kernel_url".to_string())
                    })?;
                if event.kernel_id.trim().is_empty() {
                    return Err(Error::Validation("event without kernel_id".to_string()));
                }
                let (id, kernel_id, kernel_url) =
                    (project_id.to_string(), event.kernel_id.clone(), url.to_string());
                let bound = self
                    .repo
                    .blocking(move |repo| repo.bind_kernel(&id, &kernel_id, &kernel_url))
                    .await?;
                if !bound {
                    return Err(Error::project_not_found(project_id));
                }
                tracing::info!(
                    project_id = %project_id,
                    kernel_id = %event.kernel_id,
                    url = %url,
                    "Project connected"
                );
            }
            other => {
                tracing::info!(
                    project_id = %project_id,
                    kernel_id = %event.kernel_id,
                    event = other.as_str(),
                    "No handler for kernel event"
                );
            }
        }
        self.get(project_id).await
    }
}
