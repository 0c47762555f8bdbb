//! Container engine seam
//!
//! [`ContainerRuntime`] is everything the node driver needs from a container
//! engine: label-filtered listing, create/start/stop/remove, archive transfer in
//! and out of a container filesystem, exec and network inspection.
//! [`DockerRuntime`] implements it against the Docker Engine API.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    UploadToContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::ListImagesOptions;
use bollard::models::HostConfig;
use bollard::network::InspectNetworkOptions;
use bollard::Docker;
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, info, instrument};

use crate::error::{DeployError, Result};

/// A container as reported by the engine's listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub labels: HashMap<String, String>,
    pub state: String,
    /// Image reference the container was created from
    pub image: String,
    /// Address on the first network that reports one
    pub ip_address: Option<String>,
}

/// Everything needed to create a node container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub network: String,
    pub cap_add: Vec<String>,
    pub binds: Vec<String>,
    pub auto_remove: bool,
}

/// One IPAM block of a network
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IpamBlock {
    pub subnet: Option<String>,
    pub ip_range: Option<String>,
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Exit codes 126/127 and the engine's own message both mean the binary is absent
    pub fn command_not_found(&self) -> bool {
        self.exit_code == 126
            || self.exit_code == 127
            || self.stdout.contains("executable file not found")
            || self.stderr.contains("executable file not found")
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// All containers, running or not, that carry `label_key`
    async fn list_containers(&self, label_key: &str) -> Result<Vec<ContainerSummary>>;

    /// Returns the new container id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Succeeds when the container is already stopped
    async fn stop_container(&self, id: &str) -> Result<()>;

    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Extract a tar archive into `dest_dir` inside the container
    async fn upload_archive(&self, id: &str, dest_dir: &str, archive: Vec<u8>) -> Result<()>;

    /// Fetch `path` as a tar archive. `Ok(None)` when the path does not exist,
    /// [`DeployError::ResourceNotFound`] when the container does not.
    async fn download_archive(&self, id: &str, path: &str) -> Result<Option<Vec<u8>>>;

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput>;

    async fn network_ipam(&self, network: &str) -> Result<Vec<IpamBlock>>;

    /// Tags of locally available images in `repository`, e.g. `repo:tag`
    async fn list_image_tags(&self, repository: &str) -> Result<Vec<String>>;
}

/// Docker Engine implementation of [`ContainerRuntime`]
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

const DOCKER_TIMEOUT_SECS: u64 = 120;

impl DockerRuntime {
    /// Connect to `host`, or to the local engine defaults when unset
    #[instrument(skip_all)]
    pub fn connect(host: Option<&str>) -> Result<Self> {
        let docker = match host {
            Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
                Docker::connect_with_http(host, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            Some(host) => {
                Docker::connect_with_socket(host, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(map_docker_error)?;

        info!(host = host.unwrap_or("local"), "Connected to Docker engine");

        Ok(Self { docker })
    }
}

fn map_docker_error(err: DockerError) -> DeployError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => DeployError::ResourceNotFound(message),
        other => DeployError::Backend(other.to_string()),
    }
}

/// The engine answers 404 both for a missing path and a missing container;
/// only the former reads as "no archive".
fn map_download_error(err: DockerError) -> Result<Option<Vec<u8>>> {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } if !message.contains("No such container") => Ok(None),
        other => Err(map_docker_error(other)),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self, label_key: &str) -> Result<Vec<ContainerSummary>> {
        let filters: HashMap<String, Vec<String>> =
            [("label".to_string(), vec![label_key.to_string()])]
                .into_iter()
                .collect();

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(map_docker_error)?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
                state: c.state.unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                ip_address: c
                    .network_settings
                    .and_then(|settings| settings.networks)
                    .and_then(|networks| {
                        networks
                            .into_values()
                            .filter_map(|endpoint| endpoint.ip_address)
                            .find(|ip| !ip.is_empty())
                    }),
            })
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                auto_remove: Some(spec.auto_remove),
                network_mode: Some(spec.network.clone()),
                cap_add: Some(spec.cap_add.clone()),
                binds: Some(spec.binds.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(map_docker_error)?;

        for warning in &created.warnings {
            debug!(container = %created.id, warning, "engine warning on create");
        }

        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_docker_error)
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        match self.docker.stop_container(id, None).await {
            Ok(()) => Ok(()),
            // 304: container already stopped
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_docker_error(e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 409: removal already in progress (auto-remove)
            Err(DockerError::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(map_docker_error(e)),
        }
    }

    async fn upload_archive(&self, id: &str, dest_dir: &str, archive: Vec<u8>) -> Result<()> {
        let options = UploadToContainerOptions {
            path: dest_dir.to_string(),
            ..Default::default()
        };

        self.docker
            .upload_to_container(id, Some(options), Bytes::from(archive))
            .await
            .map_err(map_docker_error)
    }

    async fn download_archive(&self, id: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = Box::pin(self.docker.download_from_container(id, Some(options)));

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => archive.extend_from_slice(&bytes),
                Err(e) => return map_download_error(e),
            }
        }

        Ok(Some(archive))
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(map_docker_error)?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(map_docker_error)?
        {
            while let Some(msg) = output.next().await {
                match msg.map_err(map_docker_error)? {
                    LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message))
                    }
                    LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message))
                    }
                    _ => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(map_docker_error)?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn network_ipam(&self, network: &str) -> Result<Vec<IpamBlock>> {
        let info = self
            .docker
            .inspect_network(network, None::<InspectNetworkOptions<String>>)
            .await
            .map_err(map_docker_error)?;

        Ok(info
            .ipam
            .and_then(|ipam| ipam.config)
            .unwrap_or_default()
            .into_iter()
            .map(|block| IpamBlock {
                subnet: block.subnet.filter(|s| !s.is_empty()),
                ip_range: block.ip_range.filter(|s| !s.is_empty()),
                gateway: block.gateway.filter(|s| !s.is_empty()),
            })
            .collect())
    }

    async fn list_image_tags(&self, repository: &str) -> Result<Vec<String>> {
        let filters: HashMap<String, Vec<String>> =
            [("reference".to_string(), vec![format!("{}:*", repository)])]
                .into_iter()
                .collect();

        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                filters,
                ..Default::default()
            }))
            .await
            .map_err(map_docker_error)?;

        Ok(images
            .into_iter()
            .flat_map(|image| image.repo_tags)
            .collect())
    }
}
