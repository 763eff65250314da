//! Kernel provisioner - the project service's view of the kernel service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::config::ProjectServiceConfig;
use crate::credential::CredentialSigner;
use crate::error::{Error, Result};
use crate::state::KernelResource;

/// Requests kernels on behalf of projects.
#[async_trait]
pub trait KernelProvisioner: Send + Sync {
    /// Ask for a new kernel whose readiness is reported back for `project_id`.
    async fn provision_kernel(&self, project_id: &str) -> Result<KernelResource>;

    /// Tear down `kernel_id`. An already-absent kernel is success.
    async fn stop_kernel(&self, project_id: &str, kernel_id: &str) -> Result<()>;
}

/// [`KernelProvisioner`] over the kernel service's HTTP API.
pub struct RestKernelService {
    http: reqwest::Client,
    base_url: String,
    callback_url: String,
    signer: CredentialSigner,
}

impl RestKernelService {
    pub fn new(config: &ProjectServiceConfig, signer: CredentialSigner) -> Result<Self> {
        Self::with_endpoints(
            &config.kernel_api,
            config.webhook_url(),
            config.request_timeout(),
            signer,
        )
    }

    pub fn with_endpoints(
        base_url: &str,
        callback_url: String,
        timeout: Duration,
        signer: CredentialSigner,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            callback_url,
            signer,
        })
    }

    fn callback_query(&self, project_id: &str) -> Result<[(&'static str, String); 2]> {
        let token = self.signer.mint(project_id)?;
        Ok([("callback", self.callback_url.clone()), ("token", token)])
    }
}

#[async_trait]
impl KernelProvisioner for RestKernelService {
    async fn provision_kernel(&self, project_id: &str) -> Result<KernelResource> {
        let response = self
            .http
            .post(format!("{}/kernels", self.base_url))
            .query(&self.callback_query(project_id)?)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("kernel service unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream(format!(
                "kernel service refused provisioning ({status}): {body}"
            )));
        }

        let kernel: KernelResource = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("invalid kernel service response: {e}")))?;

        tracing::info!(
            project_id = %project_id,
            kernel_id = %kernel.id,
            "Kernel provisioning requested"
        );
        Ok(kernel)
    }

    async fn stop_kernel(&self, project_id: &str, kernel_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/kernels/{}", self.base_url, kernel_id))
            .query(&self.callback_query(project_id)?)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("kernel service unreachable: {e}")))?;

        match response.status() {
            status if status.is_success() => {
                tracing::info!(project_id = %project_id, kernel_id = %kernel_id, "Kernel stopped");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                tracing::debug!(kernel_id = %kernel_id, "Kernel already gone");
                Ok(())
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::Upstream(format!(
                    "kernel service refused teardown of {kernel_id} ({status}): {body}"
                )))
            }
        }
    }
}
