//! Podman provider.
//!
//! Talks to the Docker-compatible API of the local Podman service through
//! bollard. Every run gets its own network named after the namespace; each
//! node is a container on it with its config and data directories bind
//! mounted from the run's working directory, so files can be placed before
//! the container starts and read back after it exits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum, HostConfig};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::lifecycle::{ResourceHandle, ResourceState, ResourceTracker};
use super::r#trait::{
    ContainerSpec, ExecOutput, FileTransfer, Provider, ProviderCapabilities, ResourceDefinition, ResourceSpec,
};
use super::{run_program, wait_until, ProviderKind, ProviderOptions};
use crate::command::{generate_command, RemotePaths};
use crate::constants::{CONTAINER_READY_POLL, FINISH_MAGIC_FILE, NODE_CONTAINER_WAIT_LOG};
use crate::error::{OrchestratorError, Result};
use crate::topology::{ImagePullPolicy, Node};

const PODMAN: &str = "podman";

/// Podman execution provider.
pub struct PodmanProvider {
    docker: Docker,
    options: ProviderOptions,
    tracker: ResourceTracker,
}

impl PodmanProvider {
    /// Connects to the local Podman service.
    ///
    /// The connection is lazy; [`Provider::validate_access`] pings it.
    pub fn connect(options: ProviderOptions) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| OrchestratorError::provider_access("podman", e.to_string()))?;
        Ok(Self {
            docker,
            options,
            tracker: ResourceTracker::new(),
        })
    }

    fn node_dir(&self, node: &str) -> PathBuf {
        self.options.tmp_dir.join(node)
    }

    fn container_name(&self, node: &str) -> String {
        format!("{}_{node}", self.options.namespace)
    }

    /// Local path backing `remote` inside `node`, if it lives on a bind mount.
    fn host_path(&self, node: &str, remote: &str) -> Option<PathBuf> {
        let paths = RemotePaths::default();
        let mounts = [(paths.cfg, "cfg"), (paths.data, "data"), (paths.relay_data, "relay-data")];
        mounts.iter().find_map(|(dir, sub)| {
            let rest = remote.strip_prefix(dir.as_str())?;
            if !rest.is_empty() && !rest.starts_with('/') {
                return None;
            }
            Some(self.node_dir(node).join(sub).join(rest.trim_start_matches('/')))
        })
    }

    async fn container_id(&self, node: &str) -> Result<String> {
        Ok(self.tracker.require(node).await?.resource_id)
    }

    async fn inspect(&self, node: &str) -> Result<ContainerInspectResponse> {
        let id = self.container_id(node).await?;
        Ok(self.docker.inspect_container(&id, None).await?)
    }

    async fn ensure_image(&self, image: &str, always: bool) -> Result<()> {
        if !always && self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => return Err(OrchestratorError::provider_access("podman", format!("pull {image}: {e}"))),
            }
        }
        Ok(())
    }

    async fn wait_ready(&self, def: &ResourceDefinition) -> Result<()> {
        let name = def.name.as_str();
        let temp = def.is_temp();
        let ready = wait_until(self.options.spawn_timeout, CONTAINER_READY_POLL, || async move {
            let inspect = self.inspect(name).await?;
            let state = inspect.state.unwrap_or_default();
            match state.status {
                Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::DEAD) => {
                    let code = state.exit_code.unwrap_or(-1);
                    if temp && code == 0 {
                        Ok(true)
                    } else {
                        Err(OrchestratorError::spawn_failed(name, format!("container exited with code {code}")))
                    }
                }
                _ if state.running != Some(true) => Ok(false),
                _ if temp => Ok(self.logs(name, None).await?.contains(NODE_CONTAINER_WAIT_LOG)),
                _ => Ok(true),
            }
        })
        .await?;
        if !ready {
            return Err(OrchestratorError::spawn_timeout(name, "container"));
        }
        Ok(())
    }

    fn container_spec(&self, node: &Node, command: Vec<String>) -> ContainerSpec {
        let dir = self.node_dir(&node.name);
        let paths = RemotePaths::default();
        let binds = [("cfg", &paths.cfg), ("data", &paths.data), ("relay-data", &paths.relay_data)]
            .into_iter()
            .map(|(sub, remote)| format!("{}:{remote}", dir.join(sub).display()))
            .collect();
        let labels = [
            ("app", "zombienet".to_string()),
            ("zombie-role", node.role.name().to_string()),
            ("zombie-ns", self.options.namespace.clone()),
            ("zombie-node", node.name.clone()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        ContainerSpec {
            image: node.image.reference().to_string(),
            command,
            env: node.env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            labels,
            binds,
            memory: node.resources.as_ref().and_then(|r| r.memory_limit_bytes()),
            memory_reservation: node.resources.as_ref().and_then(|r| r.memory_reservation_bytes()),
            nano_cpus: node.resources.as_ref().and_then(|r| r.nano_cpus()),
            pull: self.options.image_pull_policy == ImagePullPolicy::Always,
        }
    }
}

#[async_trait]
impl Provider for PodmanProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Podman
    }

    fn namespace(&self) -> &str {
        &self.options.namespace
    }

    fn tmp_dir(&self) -> &Path {
        &self.options.tmp_dir
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::container()
    }

    async fn validate_access(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| OrchestratorError::provider_access("podman", e.to_string()))?;
        Ok(())
    }

    async fn create_namespace(&self) -> Result<()> {
        let labels = HashMap::from([("zombie-ns", self.namespace())]);
        let config = CreateNetworkOptions {
            name: self.namespace(),
            labels,
            ..Default::default()
        };
        self.docker.create_network(config).await?;
        info!(network = %self.namespace(), "Created network");
        Ok(())
    }

    fn generate_resource_definition(&self, node: &Node) -> Result<ResourceDefinition> {
        let paths = self.remote_paths(&node.name);
        let command = generate_command(node, &paths)?.container_args(&paths.cfg);
        Ok(ResourceDefinition {
            name: node.name.clone(),
            role: node.role,
            ports: node.ports,
            spec: ResourceSpec::Container(self.container_spec(node, command)),
        })
    }

    async fn spawn(&self, def: &ResourceDefinition, files: &[FileTransfer]) -> Result<()> {
        let ResourceSpec::Container(spec) = &def.spec else {
            return Err(OrchestratorError::spawn_failed(&def.name, "not a container definition"));
        };
        let name = def.name.as_str();
        self.ensure_image(&spec.image, spec.pull).await?;

        let dir = self.node_dir(name);
        for sub in ["cfg", "data", "relay-data"] {
            tokio::fs::create_dir_all(dir.join(sub)).await?;
        }
        let mut late = Vec::new();
        for file in files {
            match self.host_path(name, &file.remote) {
                Some(target) => {
                    if let Some(parent) = target.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::copy(&file.local, &target).await?;
                }
                None => late.push(file),
            }
        }

        let exposed_ports: HashMap<String, HashMap<(), ()>> = [def.ports.p2p, def.ports.rpc, def.ports.prometheus]
            .iter()
            .map(|p| (format!("{p}/tcp"), HashMap::new()))
            .collect();
        let host_config = HostConfig {
            binds: Some(spec.binds.clone()),
            network_mode: Some(self.namespace().to_string()),
            publish_all_ports: Some(true),
            memory: spec.memory,
            memory_reservation: spec.memory_reservation,
            nano_cpus: spec.nano_cpus,
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            hostname: Some(name.to_string()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone().into_iter().collect()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            cmd: Some(spec.command.clone()),
            ..Default::default()
        };
        let container_name = self.container_name(name);
        let options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };
        let response = self.docker.create_container(Some(options), config).await?;
        self.tracker.register(ResourceHandle::new(name, &response.id, def.role)).await;
        info!(container = %container_name, id = %response.id, "Created container");

        for file in late {
            let local = file.local.to_string_lossy();
            let target = format!("{}:{}", response.id, file.remote);
            run_program(PODMAN, &["cp", &local, &target], None)
                .await?
                .into_result("podman cp")?;
        }

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await?;
        self.wait_ready(def).await?;

        let inspect = self.inspect(name).await?;
        let ip = inspect
            .network_settings
            .and_then(|s| s.networks)
            .and_then(|n| n.get(self.namespace()).and_then(|e| e.ip_address.clone()))
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = ip {
            self.tracker.set_ip(name, ip).await?;
        }
        self.tracker.update_state(name, ResourceState::Running).await?;
        info!(container = %container_name, role = %def.role, "Container ready");
        Ok(())
    }

    async fn copy_file_to_node(&self, node: &str, local: &Path, remote: &str) -> Result<()> {
        if let Some(target) = self.host_path(node, remote) {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(local, &target).await?;
            return Ok(());
        }
        let id = self.container_id(node).await?;
        let local = local.to_string_lossy();
        run_program(PODMAN, &["cp", &local, &format!("{id}:{remote}")], None)
            .await?
            .into_result("podman cp")?;
        Ok(())
    }

    async fn copy_file_from_node(&self, node: &str, remote: &str, local: &Path) -> Result<()> {
        if let Some(source) = self.host_path(node, remote) {
            if tokio::fs::try_exists(&source).await? {
                tokio::fs::copy(&source, local).await?;
                return Ok(());
            }
        }
        let id = self.container_id(node).await?;
        let local = local.to_string_lossy();
        run_program(PODMAN, &["cp", &format!("{id}:{remote}"), &local], None)
            .await?
            .into_result("podman cp")?;
        Ok(())
    }

    async fn put_magic_file(&self, node: &str) -> Result<()> {
        let out = self.exec(node, &["touch", FINISH_MAGIC_FILE]).await?;
        if !out.success() {
            debug!(node = %node, output = %out.combined_output(), "Helper already gone");
        }
        Ok(())
    }

    async fn start_port_forwarding(&self, port: u16, node: &str) -> Result<u16> {
        if let Some(local) = self.tracker.require(node).await?.local_port(port) {
            return Ok(local);
        }
        let inspect = self.inspect(node).await?;
        let local = inspect
            .network_settings
            .and_then(|s| s.ports)
            .and_then(|ports| ports.get(&format!("{port}/tcp")).cloned().flatten())
            .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port))
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| OrchestratorError::node_not_found(format!("{node} does not publish port {port}")))?;
        self.tracker.map_port(node, port, local).await
    }

    async fn node_address(&self, node: &str, port: u16) -> Result<(String, u16)> {
        let handle = self.tracker.require(node).await?;
        let ip = handle
            .ip_address
            .ok_or_else(|| OrchestratorError::node_not_found(format!("{node} has no address")))?;
        Ok((ip, port))
    }

    async fn run_command(&self, args: &[&str]) -> Result<ExecOutput> {
        run_program(PODMAN, args, None).await
    }

    async fn exec(&self, node: &str, cmd: &[&str]) -> Result<ExecOutput> {
        let id = self.container_id(node).await?;
        debug!(node = %node, cmd = ?cmd, "Executing command");

        let exec_options = CreateExecOptions {
            cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.docker.create_exec(&id, exec_options).await?;
        let start_result = self.docker.start_exec(&exec.id, None).await?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } = start_result {
            while let Some(result) = output.next().await {
                match result? {
                    LogOutput::StdOut { message } => stdout.push_str(&String::from_utf8_lossy(&message)),
                    LogOutput::StdErr { message } => stderr.push_str(&String::from_utf8_lossy(&message)),
                    _ => {}
                }
            }
        }

        let exit_code = self.docker.inspect_exec(&exec.id).await?.exit_code.unwrap_or(-1) as i32;
        Ok(ExecOutput::new(stdout, stderr, exit_code))
    }

    async fn logs(&self, node: &str, since: Option<Duration>) -> Result<String> {
        let id = self.container_id(node).await?;
        let since = since
            .map(|d| chrono::Utc::now().timestamp() - d.as_secs() as i64)
            .unwrap_or(0);
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            since,
            tail: "all".to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(&id, Some(options));
        let mut output = String::new();
        while let Some(log) = stream.next().await {
            output.push_str(&log?.to_string());
        }
        Ok(output)
    }

    async fn destroy_namespace(&self) -> Result<()> {
        let filters = HashMap::from([("label".to_string(), vec![format!("zombie-ns={}", self.namespace())])]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        let mut failures = Vec::new();
        for container in containers {
            let Some(id) = container.id else { continue };
            let remove = RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            };
            if let Err(e) = self.docker.remove_container(&id, Some(remove)).await {
                warn!(container = %id, error = %e, "Failed to remove container");
                failures.push(id);
            }
        }
        self.tracker.clear().await;

        if let Err(e) = self.docker.remove_network(self.namespace()).await {
            warn!(network = %self.namespace(), error = %e, "Failed to remove network");
            failures.push(self.namespace().to_string());
        }
        if !failures.is_empty() {
            return Err(OrchestratorError::teardown_failed(format!("could not remove {}", failures.join(", "))));
        }
        info!(network = %self.namespace(), "Removed network");
        Ok(())
    }

    async fn pause(&self, node: &str) -> Result<()> {
        let id = self.container_id(node).await?;
        self.docker.pause_container(&id).await?;
        self.tracker.update_state(node, ResourceState::Paused).await?;
        info!(node = %node, "Paused container");
        Ok(())
    }

    async fn resume(&self, node: &str) -> Result<()> {
        let id = self.container_id(node).await?;
        self.docker.unpause_container(&id).await?;
        self.tracker.update_state(node, ResourceState::Running).await?;
        info!(node = %node, "Unpaused container");
        Ok(())
    }

    async fn restart(&self, node: &str, after: Option<Duration>) -> Result<()> {
        let script = match after {
            Some(d) => format!("echo restart {} > /tmp/zombiepipe", d.as_secs()),
            None => "echo restart > /tmp/zombiepipe".to_string(),
        };
        self.exec(node, &["bash", "-c", &script]).await?.into_result("restart")?;
        info!(node = %node, "Restarted node");
        Ok(())
    }
}
