//! Webhook client - pushes kernel events to the project service.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::event::KernelEvent;

/// Outbound webhook caller with a bounded per-request timeout.
#[derive(Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
}

impl WebhookClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    /// PUT `event` to `callback_url`, presenting `credential` as the
    /// `Authorization` header. Any non-success status is an upstream failure.
    pub async fn notify(&self, callback_url: &str, credential: &str, event: &KernelEvent) -> Result<()> {
        let response = self
            .http
            .put(callback_url)
            .header(reqwest::header::AUTHORIZATION, credential)
            .json(event)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("webhook {callback_url} unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream(format!(
                "webhook {callback_url} returned {status}: {body}"
            )));
        }

        tracing::debug!(
            kernel_id = %event.kernel_id,
            event = event.kind.as_str(),
            "Webhook delivered"
        );
        Ok(())
    }
}
