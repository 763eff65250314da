//! Service configuration loading and management.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable holding the shared callback signing secret.
pub const CALLBACK_SECRET_ENV: &str = "MLBLOCK_CALLBACK_SECRET";
/// Environment override for `project_service.kernel_api`.
pub const KERNEL_API_ENV: &str = "MLBLOCK_KERNEL_API";
/// Environment override for `project_service.public_url`.
pub const PUBLIC_URL_ENV: &str = "MLBLOCK_PUBLIC_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("callback secret is empty; set MLBLOCK_CALLBACK_SECRET or callback_secret")]
    MissingSecret,
}

/// Top-level configuration, loaded from mlblock.yaml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Shared HS256 secret for callback credentials
    pub callback_secret: String,

    /// Kernel resource manager and reconciler
    pub kernel_service: KernelServiceConfig,

    /// Project session manager and tunnel
    pub project_service: ProjectServiceConfig,

    /// Container runtime connection
    pub runtime: RuntimeConfig,
}

/// Kernel service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelServiceConfig {
    pub bind: SocketAddr,

    /// SQLite database holding kernel records
    pub database: PathBuf,

    /// Worker image launched for every kernel
    pub image: String,

    /// Base URL workers use to reach this service
    pub orchestrator_url: String,

    /// Internal port the worker serves on
    pub worker_port: u16,

    /// Host part of the address handed out for a worker
    pub advertise_host: String,

    /// Fixed config path inside the worker
    pub worker_config_file: String,

    /// Exit codes that mark a dead kernel as ERROR rather than STOPPED
    pub fatal_exit_codes: Vec<i64>,

    pub webhook_timeout_secs: u64,
}

fn default_kernel_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}
fn default_kernel_database() -> PathBuf {
    PathBuf::from("kernels.db")
}
fn default_image() -> String {
    "mlblock-kernel-slave:0.0.6".to_string()
}
fn default_orchestrator_url() -> String {
    "http://host.docker.internal:8000".to_string()
}
fn default_worker_port() -> u16 {
    5000
}
fn default_advertise_host() -> String {
    "127.0.0.1".to_string()
}
fn default_worker_config_file() -> String {
    "/root/.local/share/jupyter/runtime/config.json".to_string()
}
fn default_fatal_exit_codes() -> Vec<i64> {
    vec![1]
}
fn default_timeout_secs() -> u64 {
    5
}

impl Default for KernelServiceConfig {
    fn default() -> Self {
        Self {
            bind: default_kernel_bind(),
            database: default_kernel_database(),
            image: default_image(),
            orchestrator_url: default_orchestrator_url(),
            worker_port: default_worker_port(),
            advertise_host: default_advertise_host(),
            worker_config_file: default_worker_config_file(),
            fatal_exit_codes: default_fatal_exit_codes(),
            webhook_timeout_secs: default_timeout_secs(),
        }
    }
}

impl KernelServiceConfig {
    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }
}

/// Project service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectServiceConfig {
    pub bind: SocketAddr,

    /// SQLite database holding project records
    pub database: PathBuf,

    /// Base URL of the kernel service
    pub kernel_api: String,

    /// Base URL the kernel service uses for webhooks back to us
    pub public_url: String,

    pub request_timeout_secs: u64,

    pub tunnel_timeout_secs: u64,
}

fn default_project_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}
fn default_project_database() -> PathBuf {
    PathBuf::from("projects.db")
}
fn default_kernel_api() -> String {
    "http://localhost:8000".to_string()
}
fn default_public_url() -> String {
    "http://host.docker.internal:8080".to_string()
}
fn default_tunnel_timeout_secs() -> u64 {
    30
}

impl Default for ProjectServiceConfig {
    fn default() -> Self {
        Self {
            bind: default_project_bind(),
            database: default_project_database(),
            kernel_api: default_kernel_api(),
            public_url: default_public_url(),
            request_timeout_secs: default_timeout_secs(),
            tunnel_timeout_secs: default_tunnel_timeout_secs(),
        }
    }
}

impl ProjectServiceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn tunnel_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_timeout_secs)
    }

    /// Webhook endpoint handed to the kernel service as `callback`.
    pub fn webhook_url(&self) -> String {
        format!(
            "{}/webhook/kernel/projects",
            self.public_url.trim_end_matches('/')
        )
    }
}

/// Container runtime connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Docker socket path; local defaults when unset
    pub docker_socket: Option<PathBuf>,

    pub timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_socket: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Load from `path` if it exists, defaults otherwise, then apply
    /// environment overrides.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = lookup(CALLBACK_SECRET_ENV) {
            self.callback_secret = secret;
        }
        if let Some(api) = lookup(KERNEL_API_ENV) {
            self.project_service.kernel_api = api;
        }
        if let Some(url) = lookup(PUBLIC_URL_ENV) {
            self.project_service.public_url = url;
        }
    }

    /// The signing secret, refusing to run with an empty one.
    pub fn require_secret(&self) -> Result<&str, ConfigError> {
        if self.callback_secret.trim().is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        Ok(&self.callback_secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = ServiceConfig::from_yaml(
            r#"
kernel_service:
  image: custom:1
  fatal_exit_codes: [1, 137]
project_service:
  public_url: http://projects.internal:9000/
"#,
        )
        .unwrap();

        assert_eq!(config.kernel_service.image, "custom:1");
        assert_eq!(config.kernel_service.fatal_exit_codes, vec![1, 137]);
        assert_eq!(config.kernel_service.worker_port, 5000);
        assert_eq!(config.kernel_service.webhook_timeout(), Duration::from_secs(5));
        assert_eq!(
            config.project_service.webhook_url(),
            "http://projects.internal:9000/webhook/kernel/projects"
        );
        assert_eq!(config.runtime.timeout_secs, 5);
    }

    #[test]
    fn outbound_timeouts_are_short_by_default() {
        let config = ServiceConfig::default();
        assert_eq!(config.runtime.timeout_secs, 5);
        assert_eq!(config.kernel_service.webhook_timeout(), Duration::from_secs(5));
        assert_eq!(config.project_service.request_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn env_overrides_secret_and_urls() {
        let mut config = ServiceConfig::default();
        assert!(config.require_secret().is_err());

        config.apply_env(|key| match key {
            CALLBACK_SECRET_ENV => Some("s3cret".to_string()),
            KERNEL_API_ENV => Some("http://kernels:8000".to_string()),
            _ => None,
        });

        assert_eq!(config.require_secret().unwrap(), "s3cret");
        assert_eq!(config.project_service.kernel_api, "http://kernels:8000");
        assert_eq!(
            config.project_service.public_url,
            "http://host.docker.internal:8080"
        );
    }
}
