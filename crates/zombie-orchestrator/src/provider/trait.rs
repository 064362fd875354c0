//! Execution provider trait definition.
//!
//! This module defines the capability contract every execution backend
//! implements, along with the resource definitions and command output types
//! shared by the backends.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ProviderKind;
use crate::command::RemotePaths;
use crate::error::{OrchestratorError, Result};
use crate::topology::{Node, NodeRole, Ports};

/// Core trait for execution providers.
///
/// A provider owns one namespace and every resource spawned in it. The
/// orchestrator drives it through a fixed sequence:
///
/// 1. `validate_access()` and `create_namespace()`
/// 2. `static_setup()` for namespace-wide resources
/// 3. `generate_resource_definition()` then `spawn()` once per node
/// 4. file transfer, port forwarding and `exec()` while the network runs
/// 5. `destroy_namespace()` to remove everything
///
/// Implementations must be `Send + Sync`: node handles share the provider
/// and several spawns may be in flight at once.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Returns the provider kind.
    fn kind(&self) -> ProviderKind;

    /// Returns the namespace all resources are created in.
    fn namespace(&self) -> &str;

    /// Returns the local working directory of the run.
    fn tmp_dir(&self) -> &Path;

    /// Returns the capabilities of this provider.
    fn capabilities(&self) -> ProviderCapabilities;

    /// Returns where `node` finds its configuration and data directories.
    fn remote_paths(&self, node: &str) -> RemotePaths {
        let _ = node;
        RemotePaths::default()
    }

    /// Checks that the backend is reachable and usable.
    ///
    /// # Errors
    ///
    /// Returns `ProviderAccess` if the backend can not be used.
    async fn validate_access(&self) -> Result<()>;

    /// Creates the isolation scope of this run.
    async fn create_namespace(&self) -> Result<()>;

    /// Creates namespace-wide resources shared by every node.
    async fn static_setup(&self) -> Result<()> {
        Ok(())
    }

    /// Builds the backend-specific description of how to run `node`.
    ///
    /// This is a pure function: nothing is created until [`Provider::spawn`].
    fn generate_resource_definition(&self, node: &Node) -> Result<ResourceDefinition>;

    /// Creates the resource, copies `files` into it and waits until it is ready.
    ///
    /// # Errors
    ///
    /// Returns `SpawnTimeout` if the resource is not ready within the spawn
    /// budget and `SpawnFailed` if it dies first. Neither is retried here.
    async fn spawn(&self, def: &ResourceDefinition, files: &[FileTransfer]) -> Result<()>;

    /// Copies a local file into a running node.
    async fn copy_file_to_node(&self, node: &str, local: &Path, remote: &str) -> Result<()>;

    /// Copies a file out of a running node.
    async fn copy_file_from_node(&self, node: &str, remote: &str, local: &Path) -> Result<()>;

    /// Releases a helper node waiting for its files to be collected.
    async fn put_magic_file(&self, node: &str) -> Result<()> {
        let _ = node;
        Ok(())
    }

    /// Returns a local port reaching `port` of `node`.
    ///
    /// Calling it again for the same node and port returns the same mapping.
    async fn start_port_forwarding(&self, port: u16, node: &str) -> Result<u16>;

    /// Returns the address other nodes use to reach `port` of `node`.
    async fn node_address(&self, node: &str, port: u16) -> Result<(String, u16)>;

    /// Runs a backend command (`kubectl`, `podman` or `bash`) with `args`.
    ///
    /// A non-zero exit is reported in the output, not as an error.
    async fn run_command(&self, args: &[&str]) -> Result<ExecOutput>;

    /// Executes a command inside a running node.
    async fn exec(&self, node: &str, cmd: &[&str]) -> Result<ExecOutput>;

    /// Returns the logs of a node, optionally only the most recent ones.
    async fn logs(&self, node: &str, since: Option<Duration>) -> Result<String>;

    /// Writes the logs of `node` to `<tmp_dir>/logs/<node>.log`.
    async fn dump_logs(&self, node: &str) -> Result<PathBuf> {
        let dir = self.tmp_dir().join("logs");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{node}.log"));
        let logs = self.logs(node, None).await?;
        tokio::fs::write(&path, logs).await?;
        debug!(node = %node, path = %path.display(), "Dumped logs");
        Ok(path)
    }

    /// Removes every resource of the namespace.
    async fn destroy_namespace(&self) -> Result<()>;

    /// Pauses the node process.
    ///
    /// Default implementation returns an error if not supported.
    async fn pause(&self, node: &str) -> Result<()> {
        let _ = node;
        Err(OrchestratorError::capability_not_supported("pause"))
    }

    /// Resumes a paused node process.
    ///
    /// Default implementation returns an error if not supported.
    async fn resume(&self, node: &str) -> Result<()> {
        let _ = node;
        Err(OrchestratorError::capability_not_supported("resume"))
    }

    /// Restarts the node process, optionally after a delay.
    ///
    /// Default implementation returns an error if not supported.
    async fn restart(&self, node: &str, after: Option<Duration>) -> Result<()> {
        let _ = (node, after);
        Err(OrchestratorError::capability_not_supported("restart"))
    }
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("kind", &self.kind())
            .field("namespace", &self.namespace())
            .finish()
    }
}

/// A provider shared by the orchestrator and every node handle.
pub type SharedProvider = Arc<dyn Provider>;

/// Capabilities supported by an execution provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    /// Whether nodes can be paused and resumed.
    pub supports_pause: bool,

    /// Whether nodes can be restarted in place.
    pub supports_restart: bool,

    /// Whether node ports are only reachable through a forwarded local port.
    pub requires_port_forward: bool,

    /// Whether resource limits are enforced.
    pub supports_resource_limits: bool,

    /// Whether nodes run from container images.
    pub uses_images: bool,

    /// Whether nodes are isolated from the host.
    pub isolated: bool,
}

impl ProviderCapabilities {
    /// Capabilities of a container backend.
    pub fn container() -> Self {
        Self {
            supports_pause: true,
            supports_restart: true,
            requires_port_forward: false,
            supports_resource_limits: true,
            uses_images: true,
            isolated: true,
        }
    }

    /// Capabilities of the native backend.
    pub fn native() -> Self {
        Self {
            supports_pause: true,
            supports_restart: true,
            ..Default::default()
        }
    }

    /// Checks if a capability is supported.
    pub fn has(&self, capability: &str) -> bool {
        match capability {
            "pause" | "resume" => self.supports_pause,
            "restart" => self.supports_restart,
            "port_forward" => self.requires_port_forward,
            "resource_limits" => self.supports_resource_limits,
            "images" => self.uses_images,
            "isolation" => self.isolated,
            _ => false,
        }
    }
}

/// A local file to place inside a node before it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    /// Local path.
    pub local: PathBuf,
    /// Absolute path inside the node.
    pub remote: String,
}

impl FileTransfer {
    /// Creates a new transfer.
    pub fn new(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }
}

/// How a provider runs one node; created per spawn and never reused.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDefinition {
    /// Node name.
    pub name: String,
    /// Node role.
    pub role: NodeRole,
    /// Ports the node listens on.
    pub ports: Ports,
    /// Backend-specific shape.
    pub spec: ResourceSpec,
}

impl ResourceDefinition {
    /// Returns true for short-lived helper nodes.
    pub fn is_temp(&self) -> bool {
        self.role == NodeRole::Temp
    }
}

/// Backend-specific part of a [`ResourceDefinition`].
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSpec {
    /// A pod manifest, serialized for `kubectl apply`.
    Pod(serde_json::Value),
    /// A container on the run's network.
    Container(ContainerSpec),
    /// A local process.
    Process(ProcessSpec),
}

/// A container to create on the single-host runtime.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerSpec {
    /// Image reference.
    pub image: String,
    /// Command and arguments.
    pub command: Vec<String>,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Bind mounts, `host:container`.
    pub binds: Vec<String>,
    /// Memory limit in bytes.
    pub memory: Option<i64>,
    /// Memory reservation in bytes.
    pub memory_reservation: Option<i64>,
    /// CPU limit in nano cpus.
    pub nano_cpus: Option<i64>,
    /// Whether to pull the image before creating the container.
    pub pull: bool,
}

/// A local process to start.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessSpec {
    /// Program and arguments.
    pub command: Vec<String>,
    /// Environment.
    pub env: BTreeMap<String, String>,
    /// Node directory.
    pub dir: PathBuf,
    /// File capturing stdout and stderr.
    pub log_file: PathBuf,
}

/// Output from executing a command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Standard output from the command.
    pub stdout: String,

    /// Standard error from the command.
    pub stderr: String,

    /// Exit code of the command.
    pub exit_code: i32,
}

impl ExecOutput {
    /// Creates a new exec output.
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined stdout and stderr.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Returns stdout lines as a vector.
    pub fn stdout_lines(&self) -> Vec<&str> {
        self.stdout.lines().collect()
    }

    /// Converts a failed run into a `CommandFailed` error.
    pub fn into_result(self, command: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            let output = self.combined_output();
            Err(OrchestratorError::command_failed(command, self.exit_code, output))
        }
    }
}

impl From<std::process::Output> for ExecOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        }
    }
}
