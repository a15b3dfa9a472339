// src/runtime/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    CreateImageOptions as BollardCreateImageOptionsQuery,
    ListContainersOptions as BollardListContainersOptionsQuery,
    RemoveContainerOptionsBuilder, StartContainerOptions as BollardStartContainerOptionsQuery,
    StopContainerOptionsBuilder,
};
use bollard::Docker;
use futures_util::stream::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use super::{ContainerInfo, ContainerRuntime, ContainerSpec, ExecChunk, ExecRequest, ExecSession};
use crate::errors::RuntimeError;
use crate::function::CONTAINER_HOST_ALIAS;

/// [`ContainerRuntime`] backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect with the platform defaults (`DOCKER_HOST` or the local socket).
    /// Connecting is lazy; a missing daemon only shows up on the first call.
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(format!("Failed to connect to Docker: {}", e)))?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn is_not_found_error(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code: 404, .. }
    )
}

fn is_connection_error(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::SocketNotFoundError(_)
            | BollardError::HyperResponseError { .. }
            | BollardError::IOError { .. }
            | BollardError::RequestTimeoutError
    )
}

fn docker_error(operation: &str, target: &str, error: BollardError) -> RuntimeError {
    if is_not_found_error(&error) {
        RuntimeError::NotFound(target.to_string())
    } else if is_connection_error(&error) {
        RuntimeError::Unavailable(format!("{} {}: {}", operation, target, error))
    } else {
        RuntimeError::operation(operation, format!("{}: {}", target, error))
    }
}

fn split_image_tag(image: &str) -> (&str, &str) {
    // A colon after the last slash is a tag; one before it is a registry port.
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (image, "latest"),
    }
}

fn env_list(env: &std::collections::BTreeMap<String, String>) -> Option<Vec<String>> {
    if env.is_empty() {
        None
    } else {
        Some(env.iter().map(|(k, v)| format!("{}={}", k, v)).collect())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        let (from_image, tag) = split_image_tag(image);
        log::info!("Pulling image {}:{}", from_image, tag);
        let options = Some(BollardCreateImageOptionsQuery {
            from_image: Some(from_image.to_string()),
            tag: Some(tag.to_string()),
            ..Default::default()
        });
        self.docker
            .create_image(options, None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| docker_error("pull_image", image, e))?;
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(spec.name.clone()),
            ..Default::default()
        });

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: spec.working_dir.clone(),
            env: env_list(&spec.env),
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                binds: Some(spec.mounts.iter().map(|m| m.to_bind()).collect()),
                memory: spec.memory_mb.map(|mb| (mb as i64) * 1024 * 1024),
                extra_hosts: Some(vec![format!("{}:host-gateway", CONTAINER_HOST_ALIAS)]),
                init: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(options, config)
            .await
            .map_err(|e| docker_error("create_container", &spec.name, e))?;
        Ok(container.id)
    }

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(container_id, None::<BollardStartContainerOptionsQuery>)
            .await
            .map_err(|e| docker_error("start_container", container_id, e))
    }

    async fn stop(&self, container_id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptionsBuilder::new()
            .t(timeout.as_secs() as i32)
            .build();
        match self.docker.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(docker_error("stop_container", container_id, e)),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptionsBuilder::new()
            .force(true)
            .v(true)
            .build();
        self.docker
            .remove_container(container_id, Some(options))
            .await
            .map_err(|e| docker_error("remove_container", container_id, e))
    }

    async fn exec(
        &self,
        container_id: &str,
        request: ExecRequest,
    ) -> Result<ExecSession, RuntimeError> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions::<String> {
                    cmd: Some(request.command.clone()),
                    env: env_list(&request.env),
                    working_dir: request.working_dir.clone(),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| docker_error("create_exec", container_id, e))?;

        let started = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|e| docker_error("start_exec", container_id, e))?;

        match started {
            StartExecResults::Attached { output, mut input } => {
                input
                    .write_all(&request.stdin)
                    .await
                    .map_err(|e| RuntimeError::operation("exec_stdin", e))?;
                input
                    .flush()
                    .await
                    .map_err(|e| RuntimeError::operation("exec_stdin", e))?;

                // The stdin half stays owned by the stream so the hijacked
                // connection lives as long as the output is being read.
                let exec_id = exec.id.clone();
                let output = output
                    .filter_map(move |item| {
                        let _stdin = &input;
                        let chunk = match item {
                            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                                Some(Ok(ExecChunk::Stdout(message.to_vec())))
                            }
                            Ok(LogOutput::StdErr { message }) => {
                                Some(Ok(ExecChunk::Stderr(message.to_vec())))
                            }
                            Ok(LogOutput::StdIn { .. }) => None,
                            Err(e) => Some(Err(docker_error("exec_output", &exec_id, e))),
                        };
                        futures_util::future::ready(chunk)
                    })
                    .boxed();

                Ok(ExecSession {
                    id: exec.id,
                    output,
                })
            }
            StartExecResults::Detached => Err(RuntimeError::operation(
                "start_exec",
                format!("exec in {} started detached", container_id),
            )),
        }
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, RuntimeError> {
        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| docker_error("inspect_exec", exec_id, e))?;
        if inspect.running.unwrap_or(false) {
            return Ok(None);
        }
        Ok(inspect.exit_code)
    }

    async fn list(&self, labels: &[(String, String)]) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>(),
        );
        let options = Some(BollardListContainersOptionsQuery {
            all: true,
            filters: Some(filters),
            ..Default::default()
        });

        let containers = self
            .docker
            .list_containers(options)
            .await
            .map_err(|e| docker_error("list_containers", "engine containers", e))?;

        Ok(containers
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                Some(ContainerInfo {
                    id,
                    name: summary
                        .names
                        .and_then(|names| names.into_iter().next())
                        .map(|name| name.trim_start_matches('/').to_string()),
                    labels: summary.labels.unwrap_or_default(),
                    running: summary
                        .status
                        .map(|status| status.starts_with("Up"))
                        .unwrap_or(false),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_image_tag() {
        assert_eq!(split_image_tag("python:3.12-slim"), ("python", "3.12-slim"));
        assert_eq!(split_image_tag("alpine"), ("alpine", "latest"));
        assert_eq!(
            split_image_tag("registry.local:5000/team/node"),
            ("registry.local:5000/team/node", "latest")
        );
        assert_eq!(
            split_image_tag("registry.local:5000/team/node:20"),
            ("registry.local:5000/team/node", "20")
        );
    }

    #[test]
    fn test_env_list_is_sorted_key_value_pairs() {
        let mut env = std::collections::BTreeMap::new();
        env.insert("B".to_string(), "2".to_string());
        env.insert("A".to_string(), "1".to_string());
        assert_eq!(
            env_list(&env),
            Some(vec!["A=1".to_string(), "B=2".to_string()])
        );
        assert_eq!(env_list(&std::collections::BTreeMap::new()), None);
    }

    #[tokio::test]
    async fn test_docker_runtime_connect() {
        // Connecting is lazy, so this only fails on a malformed DOCKER_HOST.
        let runtime = DockerRuntime::connect();
        if let Ok(runtime) = runtime {
            let _ = runtime.ping().await;
        }
    }
}
