//! Tunnel - reverse proxy from `/tunnel/{kernel_id}/...` to the bound worker.

use std::time::Duration;

use axum::body::Bytes;
use axum::http::{header, HeaderMap, Method, StatusCode};

use crate::error::{Error, Result};
use crate::state::ProjectRepository;

/// Connection-scoped headers that are never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// An inbound request to forward.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub method: Method,
    pub headers: HeaderMap,
    /// Raw query string, without the `?`
    pub query: Option<String>,
    pub body: Bytes,
}

/// What the worker answered.
#[derive(Debug, Clone)]
pub struct TunnelResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Stateless forwarder resolving kernel ids through project bindings.
#[derive(Clone)]
pub struct Tunnel {
    projects: ProjectRepository,
    http: reqwest::Client,
}

impl Tunnel {
    pub fn new(projects: ProjectRepository, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { projects, http })
    }

    /// Current worker address of the project bound to `kernel_id`.
    pub async fn resolve(&self, kernel_id: &str) -> Result<String> {
        let id = kernel_id.to_string();
        let project = self
            .projects
            .blocking(move |repo| repo.find_by_kernel_id(&id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("project for kernel {kernel_id}")))?;
        project
            .kernel_url
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| Error::NotReady(format!("kernel {kernel_id}")))
    }

    /// Forward `request` to `{address}/{destination}` and relay the answer.
    pub async fn forward(
        &self,
        kernel_id: &str,
        destination: &str,
        request: TunnelRequest,
    ) -> Result<TunnelResponse> {
        let address = self.resolve(kernel_id).await?;
        let url = upstream_url(&address, destination, request.query.as_deref());

        let mut headers = request.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        tracing::debug!(kernel_id = %kernel_id, method = %request.method, url = %url, "Tunnel forward");

        let response = self
            .http
            .request(request.method, &url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(kernel_id = %kernel_id, url = %url, error = %e, "Tunnel upstream failed");
                Error::Upstream(format!("kernel {kernel_id} unreachable: {e}"))
            })?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(header::CONTENT_LENGTH);

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Upstream(format!("kernel {kernel_id} response broken: {e}")))?;

        Ok(TunnelResponse {
            status,
            headers,
            body,
        })
    }
}

/// `{address}/{destination}[?query]`. Scheme-less addresses get `http://`.
pub fn upstream_url(address: &str, destination: &str, query: Option<&str>) -> String {
    let base = address.trim_end_matches('/');
    let mut url = if base.contains("://") {
        format!("{}/{}", base, destination.trim_start_matches('/'))
    } else {
        format!("http://{}/{}", base, destination.trim_start_matches('/'))
    };
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Project;

    #[test]
    fn upstream_url_shapes() {
        assert_eq!(upstream_url("10.0.0.5:9000", "fs", None), "http://10.0.0.5:9000/fs");
        assert_eq!(
            upstream_url("http://10.0.0.5:9000/", "/api/kernels", Some("a=1&b=2")),
            "http://10.0.0.5:9000/api/kernels?a=1&b=2"
        );
        assert_eq!(upstream_url("h:1", "", Some("")), "http://h:1/");
    }

    #[tokio::test]
    async fn resolve_distinguishes_missing_and_unready() {
        let repo = ProjectRepository::in_memory().unwrap();
        let tunnel = Tunnel::new(repo.clone(), Duration::from_secs(1)).unwrap();
        assert!(matches!(tunnel.resolve("k1").await, Err(Error::NotFound(_))));

        let project = Project {
            kernel_id: Some("k1".to_string()),
            ..Project::new()
        };
        repo.insert(&project).unwrap();
        assert!(matches!(tunnel.resolve("k1").await, Err(Error::NotReady(_))));

        repo.bind_kernel(&project.id, "k1", "http://10.0.0.5:9000").unwrap();
        assert_eq!(tunnel.resolve("k1").await.unwrap(), "http://10.0.0.5:9000");
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "close".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert(header::COOKIE, "session=abc".parse().unwrap());
        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers[header::COOKIE], "session=abc");
    }
}
