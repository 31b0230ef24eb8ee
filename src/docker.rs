use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::ContainerInspectResponse;
use bollard::query_parameters::{
    InspectContainerOptions, RemoveContainerOptions, UploadToContainerOptions,
};
use bollard::Docker;
use tar::{Builder, Header};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::ContainerEngine;
use crate::error::{FixtureError, Result};
use crate::types::ExecOutput;

/// A container managed through the Docker Engine API.
pub struct DockerContainer {
    docker: Docker,
    id: String,
    hostname: String,
}

impl DockerContainer {
    pub fn new(docker: Docker, id: String) -> Self {
        let hostname = resolve_hostname(
            std::env::var("TESTCONTAINERS_HOST_OVERRIDE").ok().as_deref(),
            std::env::var("DOCKER_HOST").ok().as_deref(),
        );
        Self::with_hostname(docker, id, hostname)
    }

    pub const fn with_hostname(docker: Docker, id: String, hostname: String) -> Self {
        Self {
            docker,
            id,
            hostname,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn short_id(&self) -> &str {
        self.id.get(..12).unwrap_or(&self.id)
    }

    /// Force-removes the container together with its anonymous volumes.
    pub async fn remove(&self) -> Result<()> {
        self.docker
            .remove_container(
                &self.id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await?;
        info!("Removed container {}", self.short_id());
        Ok(())
    }

    async fn run_exec(&self, argv: &[String]) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                &self.id,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await?
        {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        let exit_code = inspect.exit_code.unwrap_or(-1);
        debug!("Exec in {} exited with {}", self.short_id(), exit_code);

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}

#[async_trait]
impl ContainerEngine for DockerContainer {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn mapped_public_port(&self, container_port: u16) -> Result<u16> {
        let container = self
            .docker
            .inspect_container(&self.id, None::<InspectContainerOptions>)
            .await?;

        host_port(&container, container_port).ok_or(FixtureError::PortNotMapped(container_port))
    }

    async fn exec(&self, argv: &[String], cancel: &CancellationToken) -> Result<ExecOutput> {
        debug!("Exec in {}: {}", self.short_id(), argv.join(" "));
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(FixtureError::Cancelled),
            result = self.run_exec(argv) => result,
        }
    }

    async fn copy_to_container(&self, content: &[u8], path: &str, mode: u32) -> Result<()> {
        let archive = single_file_archive(content, path, mode)?;
        self.docker
            .upload_to_container(
                &self.id,
                Some(UploadToContainerOptions {
                    path: "/".to_string(),
                    ..Default::default()
                }),
                bollard::body_full(archive.into()),
            )
            .await?;
        debug!(
            "Copied {} bytes to {}:{}",
            content.len(),
            self.short_id(),
            path
        );
        Ok(())
    }
}

/// Picks the host that published ports are reachable on: an explicit
/// override first, then the host part of a TCP `DOCKER_HOST`.
pub fn resolve_hostname(host_override: Option<&str>, docker_host: Option<&str>) -> String {
    if let Some(host) = host_override.map(str::trim).filter(|h| !h.is_empty()) {
        return host.to_string();
    }

    docker_host
        .and_then(|url| {
            ["tcp://", "http://", "https://"]
                .iter()
                .find_map(|scheme| url.strip_prefix(scheme))
        })
        .and_then(|rest| rest.split(['/', ':']).next())
        .filter(|host| !host.is_empty())
        .map_or_else(|| "localhost".to_string(), ToString::to_string)
}

fn host_port(container: &ContainerInspectResponse, container_port: u16) -> Option<u16> {
    let key = format!("{container_port}/tcp");
    container
        .network_settings
        .as_ref()?
        .ports
        .as_ref()?
        .get(&key)?
        .as_ref()?
        .iter()
        .find_map(|binding| binding.host_port.as_deref()?.parse().ok())
}

/// Tar stream holding one regular file, as `upload_to_container` expects.
fn single_file_archive(content: &[u8], path: &str, mode: u32) -> std::io::Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    let mut header = Header::new_gnu();
    header.set_path(path.trim_start_matches('/'))?;
    header.set_size(content.len() as u64);
    header.set_mode(mode);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    builder.append(&header, content)?;
    builder.into_inner()
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use bollard::models::{NetworkSettings, PortBinding};
    use std::collections::HashMap;
    use std::io::Read;

    fn inspect_with_ports(
        ports: HashMap<String, Option<Vec<PortBinding>>>,
    ) -> ContainerInspectResponse {
        ContainerInspectResponse {
            id: Some("abc123".to_string()),
            network_settings: Some(NetworkSettings {
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_hostname_defaults_to_localhost() {
        assert_eq!(resolve_hostname(None, None), "localhost");
        assert_eq!(
            resolve_hostname(None, Some("unix:///var/run/docker.sock")),
            "localhost"
        );
    }

    #[test]
    fn test_resolve_hostname_from_tcp_docker_host() {
        assert_eq!(
            resolve_hostname(None, Some("tcp://192.168.99.100:2376")),
            "192.168.99.100"
        );
        assert_eq!(
            resolve_hostname(None, Some("http://docker.internal")),
            "docker.internal"
        );
    }

    #[test]
    fn test_resolve_hostname_override_wins() {
        assert_eq!(
            resolve_hostname(Some("ci-host"), Some("tcp://10.0.0.1:2375")),
            "ci-host"
        );
        assert_eq!(
            resolve_hostname(Some("  "), Some("tcp://10.0.0.1:2375")),
            "10.0.0.1"
        );
    }

    #[test]
    fn test_host_port_from_inspect() {
        let mut ports = HashMap::new();
        ports.insert(
            "6650/tcp".to_string(),
            Some(vec![
                PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some("49153".to_string()),
                },
                PortBinding {
                    host_ip: Some("::".to_string()),
                    host_port: Some("49153".to_string()),
                },
            ]),
        );
        ports.insert("8080/tcp".to_string(), None);

        let container = inspect_with_ports(ports);
        assert_eq!(host_port(&container, 6650), Some(49153));
        assert_eq!(host_port(&container, 8080), None);
        assert_eq!(host_port(&container, 9999), None);
    }

    #[test]
    fn test_host_port_without_network_settings() {
        let container = ContainerInspectResponse::default();
        assert_eq!(host_port(&container, 6650), None);
    }

    #[test]
    fn test_single_file_archive_keeps_mode_and_content() {
        let archive = single_file_archive(b"#!/bin/bash\necho hi", "/testcontainers.sh", 0o755)
            .unwrap();

        let mut reader = tar::Archive::new(archive.as_slice());
        let mut entries = reader.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();

        assert_eq!(
            entry.path().unwrap().to_str().unwrap(),
            "testcontainers.sh"
        );
        assert_eq!(entry.header().mode().unwrap(), 0o755);

        let mut body = String::new();
        entry.read_to_string(&mut body).unwrap();
        assert_eq!(body, "#!/bin/bash\necho hi");
        assert!(entries.next().is_none());
    }
}
