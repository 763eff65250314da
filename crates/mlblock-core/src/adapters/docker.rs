//! Docker adapter - runs kernel workers as containers via the Docker API.

use std::time::Duration;

use async_trait::async_trait;
use bollard::{
    errors::Error as BollardError,
    models::{ContainerCreateBody, EventMessage, HostConfig},
    query_parameters::{
        CreateContainerOptions, EventsOptions, InspectContainerOptions,
        RemoveContainerOptionsBuilder, StartContainerOptions, StatsOptionsBuilder,
    },
    Docker, API_DEFAULT_VERSION,
};
use futures::stream::{BoxStream, StreamExt};

use super::{ContainerHandle, ContainerRuntime, LaunchDescriptor, RuntimeError, RuntimeEvent};
use crate::config::{KernelServiceConfig, RuntimeConfig};

/// Container runtime backed by a Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    endpoint: String,
    worker_port: u16,
    advertise_host: String,
}

impl DockerRuntime {
    /// Open a client. Each call yields an independent connection.
    pub fn connect(
        runtime: &RuntimeConfig,
        kernel: &KernelServiceConfig,
    ) -> Result<Self, RuntimeError> {
        let (docker, endpoint) = match &runtime.docker_socket {
            Some(path) => {
                let endpoint = format!("unix://{}", path.display());
                let docker = Docker::connect_with_socket(
                    &path.to_string_lossy(),
                    runtime.timeout_secs,
                    API_DEFAULT_VERSION,
                )
                .map_err(|source| RuntimeError::Connect {
                    endpoint: endpoint.clone(),
                    message: source.to_string(),
                })?;
                (docker, endpoint)
            }
            None => {
                let endpoint = "local-docker-daemon".to_string();
                let docker = Docker::connect_with_local_defaults()
                    .map_err(|source| RuntimeError::Connect {
                        endpoint: endpoint.clone(),
                        message: source.to_string(),
                    })?
                    .with_timeout(Duration::from_secs(runtime.timeout_secs));
                (docker, endpoint)
            }
        };

        tracing::info!(endpoint = %endpoint, "Connected to docker");

        Ok(Self {
            docker,
            endpoint,
            worker_port: kernel.worker_port,
            advertise_host: kernel.advertise_host.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn port_key(&self) -> String {
        format!("{}/tcp", self.worker_port)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn launch(
        &self,
        image: &str,
        descriptor: &LaunchDescriptor,
    ) -> Result<ContainerHandle, RuntimeError> {
        let body = ContainerCreateBody {
            image: Some(image.to_string()),
            env: Some(descriptor.env()),
            host_config: Some(HostConfig {
                publish_all_ports: Some(true),
                extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions>, body)
            .await
            .map_err(|source| operation_error("create_container", &descriptor.kernel_id, source))?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
            .map_err(|source| operation_error("start_container", &created.id, source))?;

        tracing::info!(
            kernel_id = %descriptor.kernel_id,
            container_id = %created.id,
            image = %image,
            "Launched kernel container"
        );

        Ok(ContainerHandle::new(created.id))
    }

    async fn terminate(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        match self
            .docker
            .remove_container(
                handle.as_str(),
                Some(RemoveContainerOptionsBuilder::new().force(true).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(error) if is_not_found_error(&error) => {
                tracing::debug!(container_id = %handle, "Container already removed");
                Ok(())
            }
            Err(error) => Err(operation_error("remove_container", handle.as_str(), error)),
        }
    }

    async fn resolve_address(&self, handle: &ContainerHandle) -> Result<String, RuntimeError> {
        let inspected = self
            .docker
            .inspect_container(handle.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(|source| operation_error("inspect_container", handle.as_str(), source))?;

        let host_port = inspected
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|mut ports| ports.remove(&self.port_key()))
            .flatten()
            .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port))
            .filter(|port| !port.is_empty())
            .ok_or_else(|| RuntimeError::NoAddress(handle.to_string()))?;

        Ok(format!("{}:{}", self.advertise_host, host_port))
    }

    async fn stats(&self, handle: &ContainerHandle) -> Result<serde_json::Value, RuntimeError> {
        let mut stream = self.docker.stats(
            handle.as_str(),
            Some(StatsOptionsBuilder::new().stream(false).one_shot(true).build()),
        );
        let snapshot = stream
            .next()
            .await
            .ok_or_else(|| RuntimeError::Operation {
                operation: "stats",
                target: handle.to_string(),
                message: "no stats returned".to_string(),
            })?
            .map_err(|source| operation_error("stats", handle.as_str(), source))?;

        serde_json::to_value(snapshot).map_err(|e| RuntimeError::Operation {
            operation: "stats",
            target: handle.to_string(),
            message: e.to_string(),
        })
    }

    async fn version(&self) -> Result<serde_json::Value, RuntimeError> {
        let version = self
            .docker
            .version()
            .await
            .map_err(|source| operation_error("version", &self.endpoint, source))?;
        serde_json::to_value(version).map_err(|e| RuntimeError::Operation {
            operation: "version",
            target: self.endpoint.clone(),
            message: e.to_string(),
        })
    }

    async fn ping(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    fn events(&self) -> BoxStream<'static, Result<RuntimeEvent, RuntimeError>> {
        let endpoint = self.endpoint.clone();
        self.docker
            .events(None::<EventsOptions>)
            .map(move |item| {
                item.map(runtime_event).map_err(|source| RuntimeError::Operation {
                    operation: "events",
                    target: endpoint.clone(),
                    message: source.to_string(),
                })
            })
            .boxed()
    }
}

fn runtime_event(message: EventMessage) -> RuntimeEvent {
    let (id, attributes) = match message.actor {
        Some(actor) => (actor.id, actor.attributes.unwrap_or_default()),
        None => (None, Default::default()),
    };
    RuntimeEvent {
        kind: message.typ.map(|t| t.to_string()),
        action: message.action,
        id,
        attributes,
    }
}

fn is_not_found_error(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn operation_error(operation: &'static str, target: &str, source: BollardError) -> RuntimeError {
    RuntimeError::Operation {
        operation,
        target: target.to_string(),
        message: source.to_string(),
    }
}
