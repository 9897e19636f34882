// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Container worker runtime over the Docker API.
//!
//! Also covers the cloud mode: point `host` at a remote engine and the same
//! create/start/stop calls drive containers on the platform side.

use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::domain::error::{CoordError, Result};
use crate::domain::worker::{SpawnMode, WorkerCommand, WorkerInstance, WorkerRuntime};

#[derive(Debug, Clone)]
pub struct DockerRuntimeConfig {
    /// Worker image to run.
    pub image: String,
    /// Remote engine URL for cloud mode; local socket when absent.
    pub host: Option<String>,
    /// Custom socket path, when the engine is not at the default location.
    pub socket_path: Option<String>,
    pub network_mode: Option<String>,
    /// Pull the image before the first spawn.
    pub autopull: bool,
}

impl DockerRuntimeConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            host: None,
            socket_path: None,
            network_mode: None,
            autopull: false,
        }
    }
}

pub struct DockerRuntime {
    docker: Docker,
    config: DockerRuntimeConfig,
    mode: SpawnMode,
}

impl DockerRuntime {
    pub fn new(config: DockerRuntimeConfig) -> Result<Self> {
        let mode = if config.host.is_some() {
            SpawnMode::Cloud
        } else {
            SpawnMode::Docker
        };
        let docker = if let Some(host) = &config.host {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| CoordError::Backend(format!("docker host {}: {}", host, e)))?
        } else if let Some(path) = &config.socket_path {
            #[cfg(unix)]
            let conn = Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION);
            #[cfg(windows)]
            let conn = Docker::connect_with_named_pipe(path, 120, bollard::API_DEFAULT_VERSION);
            conn.map_err(|e| CoordError::Backend(format!("docker socket {}: {}", path, e)))?
        } else {
            Docker::connect_with_local_defaults()
                .map_err(|e| CoordError::Backend(format!("docker: {}", e)))?
        };
        Ok(Self {
            docker,
            config,
            mode,
        })
    }

    pub async fn healthcheck(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| CoordError::Backend(format!("docker daemon unreachable: {}", e)))?;
        Ok(())
    }

    async fn pull_image(&self) -> Result<()> {
        debug!(image = %self.config.image, "pulling worker image");
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: self.config.image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| {
                CoordError::Backend(format!("pull {} failed: {}", self.config.image, e))
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerRuntime for DockerRuntime {
    fn mode(&self) -> SpawnMode {
        self.mode
    }

    async fn launch(&self, name: &str, command: &WorkerCommand) -> Result<WorkerInstance> {
        if self.config.autopull {
            self.pull_image().await?;
        }

        let mut cmd = Vec::with_capacity(command.args.len() + 1);
        cmd.push(command.program.clone());
        cmd.extend(command.args.iter().cloned());

        let env: Vec<String> = command
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let container_name = format!("agentcoord-worker-{}", name);
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    platform: None,
                }),
                Config {
                    image: Some(self.config.image.clone()),
                    cmd: Some(cmd),
                    env: Some(env),
                    host_config: Some(HostConfig {
                        network_mode: self.config.network_mode.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                CoordError::Backend(format!("create container {}: {}", container_name, e))
            })?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| CoordError::Backend(format!("start container {}: {}", created.id, e)))?;

        info!(worker = name, container = %created.id, "spawned container worker");
        Ok(WorkerInstance {
            id: created.id,
            started_at: Utc::now(),
        })
    }

    async fn is_alive(&self, instance: &WorkerInstance) -> bool {
        match self.docker.inspect_container(&instance.id, None).await {
            Ok(details) => details
                .state
                .and_then(|s| s.running)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn terminate(&self, instance: &WorkerInstance, grace: Duration) -> Result<()> {
        // Docker's stop is already graceful-first: SIGTERM, then SIGKILL
        // after the deadline.
        if let Err(e) = self
            .docker
            .stop_container(
                &instance.id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
        {
            warn!(container = %instance.id, error = %e, "stop failed, forcing removal");
        }
        self.docker
            .remove_container(
                &instance.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| CoordError::Backend(format!("remove container {}: {}", instance.id, e)))?;
        Ok(())
    }
}
