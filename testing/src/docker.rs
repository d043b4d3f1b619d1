//! Docker-backed container runtime built on `testcontainers`.

use crate::container::{ContainerRuntime, ContainerSpec, RunningContainer};
use async_trait::async_trait;
use errors::FixtureError;
use std::time::Duration;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// Used when `ContainerSpec::startup_timeout` is unset.
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default)]
pub struct DockerRuntime;

pub struct DockerContainer {
    id: String,
    image: String,
    inner: ContainerAsync<GenericImage>
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    type Container = DockerContainer;

    async fn start(&self, spec: &ContainerSpec) -> Result<DockerContainer, FixtureError> {
        let image_name = spec.image.to_string();
        tracing::info!(image = %image_name, port = spec.exposed_port, "Starting container");

        let image = GenericImage::new(spec.image.name.clone(), spec.image.tag.clone())
            .with_exposed_port(ContainerPort::Tcp(spec.exposed_port))
            .with_wait_for(WaitFor::message_on_stderr(spec.ready_log.clone()));

        let request = spec.env.iter().fold(
            image.with_startup_timeout(spec.startup_timeout.unwrap_or(DEFAULT_STARTUP_TIMEOUT)),
            |request, (key, value)| request.with_env_var(key, value)
        );

        let inner = request
            .start()
            .await
            .map_err(|e| FixtureError::ContainerStart {
                image: image_name.clone(),
                reason: e.to_string()
            })?;

        let id = inner.id().to_string();
        tracing::info!(image = %image_name, container = %id, "Container started");

        Ok(DockerContainer {
            id,
            image: image_name,
            inner
        })
    }
}

#[async_trait]
impl RunningContainer for DockerContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn host(&self) -> Result<String, FixtureError> {
        self.inner
            .get_host()
            .await
            .map(|host| host.to_string())
            .map_err(|e| FixtureError::Discovery {
                what: format!("host of {}", self.image),
                reason: e.to_string()
            })
    }

    async fn mapped_port(&self, internal_port: u16) -> Result<u16, FixtureError> {
        self.inner
            .get_host_port_ipv4(ContainerPort::Tcp(internal_port))
            .await
            .map_err(|e| FixtureError::Discovery {
                what: format!("port {internal_port} of {}", self.image),
                reason: e.to_string()
            })
    }

    async fn terminate(self) -> Result<(), FixtureError> {
        tracing::info!(container = %self.id, "Terminating container");
        let resource = format!("container {}", self.id);
        self.inner
            .rm()
            .await
            .map_err(|e| FixtureError::Teardown {
                resource,
                reason: e.to_string()
            })
    }
}
