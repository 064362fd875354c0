//! Native provider: every node is a local process.
//!
//! Nodes share the host network, so the ports picked at compile time are the
//! ports they listen on and no forwarding is needed. A node's directories
//! live under `<tmp_dir>/<node>` and its output goes to `<tmp_dir>/<node>.log`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::lifecycle::{ResourceHandle, ResourceState, ResourceTracker};
use super::r#trait::{ExecOutput, FileTransfer, ProcessSpec, Provider, ProviderCapabilities, ResourceDefinition, ResourceSpec};
use super::{run_program, wait_until, ProviderKind, ProviderOptions};
use crate::command::{generate_command, RemotePaths};
use crate::constants::{LOCALHOST, NATIVE_READY_MARKER, NATIVE_READY_POLL};
use crate::error::{OrchestratorError, Result};
use crate::topology::Node;

struct NativeProcess {
    child: Child,
    spec: ProcessSpec,
}

/// Native execution provider.
pub struct NativeProvider {
    options: ProviderOptions,
    tracker: ResourceTracker,
    processes: Mutex<HashMap<String, NativeProcess>>,
}

impl NativeProvider {
    /// Creates a provider rooted at the options' working directory.
    pub fn new(options: ProviderOptions) -> Self {
        Self {
            options,
            tracker: ResourceTracker::new(),
            processes: Mutex::new(HashMap::new()),
        }
    }

    fn log_file(&self, node: &str) -> PathBuf {
        self.options.tmp_dir.join(format!("{node}.log"))
    }

    async fn start_process(&self, spec: &ProcessSpec) -> Result<Child> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| OrchestratorError::config_validation("empty node command"))?;
        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_file)
            .await?
            .into_std()
            .await;
        let stderr = log.try_clone()?;

        let child = Command::new(program)
            .args(args)
            .envs(&spec.env)
            .current_dir(&spec.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()?;
        debug!(program = %program, pid = ?child.id(), "Started process");
        Ok(child)
    }

    /// Polls the node log for the ready marker, failing as soon as the
    /// process exits. Only output written past `offset` counts, so a restart
    /// is not satisfied by the marker of the previous run.
    async fn wait_ready(&self, name: &str, child: &mut Child, log: &Path, offset: u64) -> Result<()> {
        let ready = wait_until(self.options.spawn_timeout, NATIVE_READY_POLL, || {
            let alive = ensure_running(name, child);
            async move {
                alive?;
                let logs = tokio::fs::read(log).await.unwrap_or_default();
                let fresh = logs.get(offset as usize..).unwrap_or_default();
                Ok(String::from_utf8_lossy(fresh).contains(NATIVE_READY_MARKER))
            }
        })
        .await?;
        if !ready {
            return Err(OrchestratorError::spawn_timeout(name, "process"));
        }
        Ok(())
    }

    async fn log_len(log: &Path) -> u64 {
        tokio::fs::metadata(log).await.map(|m| m.len()).unwrap_or(0)
    }

    async fn wait_exit(&self, name: &str, child: &mut Child) -> Result<i32> {
        let status = tokio::time::timeout(self.options.spawn_timeout, child.wait())
            .await
            .map_err(|_| OrchestratorError::spawn_timeout(name, "process"))??;
        if !status.success() {
            return Err(OrchestratorError::spawn_failed(name, format!("process exited with {status}")));
        }
        Ok(status.code().unwrap_or(0))
    }

    async fn signal(&self, node: &str, signal: &str) -> Result<()> {
        let pid = self.tracker.require(node).await?.resource_id;
        run_program("kill", &[signal, &pid], None)
            .await?
            .into_result(&format!("kill {signal} {pid}"))?;
        Ok(())
    }
}

#[async_trait]
impl Provider for NativeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Native
    }

    fn namespace(&self) -> &str {
        &self.options.namespace
    }

    fn tmp_dir(&self) -> &Path {
        &self.options.tmp_dir
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::native()
    }

    fn remote_paths(&self, node: &str) -> RemotePaths {
        let dir = self.options.tmp_dir.join(node);
        let path = |sub: &str| dir.join(sub).to_string_lossy().into_owned();
        RemotePaths {
            cfg: path("cfg"),
            data: path("data"),
            relay_data: path("relay-data"),
        }
    }

    async fn validate_access(&self) -> Result<()> {
        let out = self
            .run_command(&["--help"])
            .await
            .map_err(|e| OrchestratorError::provider_access("native", e.to_string()))?;
        if !out.success() {
            return Err(OrchestratorError::provider_access("native", out.combined_output()));
        }
        Ok(())
    }

    async fn create_namespace(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.options.tmp_dir).await?;
        Ok(())
    }

    fn generate_resource_definition(&self, node: &Node) -> Result<ResourceDefinition> {
        let paths = self.remote_paths(&node.name);
        let command = generate_command(node, &paths)?.native_args();
        Ok(ResourceDefinition {
            name: node.name.clone(),
            role: node.role,
            ports: node.ports,
            spec: ResourceSpec::Process(ProcessSpec {
                command,
                env: node.env.clone(),
                dir: self.options.tmp_dir.join(&node.name),
                log_file: self.log_file(&node.name),
            }),
        })
    }

    async fn spawn(&self, def: &ResourceDefinition, files: &[FileTransfer]) -> Result<()> {
        let ResourceSpec::Process(spec) = &def.spec else {
            return Err(OrchestratorError::spawn_failed(&def.name, "not a process definition"));
        };
        let name = def.name.as_str();
        for sub in ["cfg", "data", "relay-data"] {
            tokio::fs::create_dir_all(spec.dir.join(sub)).await?;
        }
        for file in files {
            self.copy_file_to_node(name, &file.local, &file.remote).await?;
        }

        let offset = Self::log_len(&spec.log_file).await;
        let mut child = self.start_process(spec).await?;
        let pid = child.id().map(|p| p.to_string()).unwrap_or_default();
        self.tracker.register(ResourceHandle::new(name, pid, def.role)).await;

        if def.is_temp() {
            let exit_code = self.wait_exit(name, &mut child).await?;
            self.tracker.update_state(name, ResourceState::Exited { exit_code }).await?;
            info!(node = %name, "Helper process finished");
            return Ok(());
        }

        if let Err(e) = self.wait_ready(name, &mut child, &spec.log_file, offset).await {
            warn!(node = %name, log = %spec.log_file.display(), "Process not ready");
            return Err(e);
        }
        self.tracker.update_state(name, ResourceState::Running).await?;
        self.processes.lock().await.insert(
            name.to_string(),
            NativeProcess {
                child,
                spec: spec.clone(),
            },
        );
        info!(node = %name, role = %def.role, "Process ready");
        Ok(())
    }

    async fn copy_file_to_node(&self, _node: &str, local: &Path, remote: &str) -> Result<()> {
        if let Some(parent) = Path::new(remote).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, remote).await?;
        Ok(())
    }

    async fn copy_file_from_node(&self, _node: &str, remote: &str, local: &Path) -> Result<()> {
        tokio::fs::copy(remote, local).await?;
        Ok(())
    }

    async fn start_port_forwarding(&self, port: u16, _node: &str) -> Result<u16> {
        Ok(port)
    }

    async fn node_address(&self, _node: &str, port: u16) -> Result<(String, u16)> {
        Ok((LOCALHOST.to_string(), port))
    }

    async fn run_command(&self, args: &[&str]) -> Result<ExecOutput> {
        run_program("bash", args, None).await
    }

    async fn exec(&self, node: &str, cmd: &[&str]) -> Result<ExecOutput> {
        self.tracker.require(node).await?;
        let (program, args) = cmd
            .split_first()
            .ok_or_else(|| OrchestratorError::config_validation("empty command"))?;
        run_program(program, args, None).await
    }

    async fn logs(&self, node: &str, _since: Option<Duration>) -> Result<String> {
        Ok(tokio::fs::read_to_string(self.log_file(node)).await?)
    }

    async fn destroy_namespace(&self) -> Result<()> {
        let mut processes = self.processes.lock().await;
        for (name, mut process) in processes.drain() {
            if let Err(e) = process.child.kill().await {
                debug!(node = %name, error = %e, "Process already gone");
            }
        }
        self.tracker.clear().await;
        info!(namespace = %self.namespace(), "Stopped all processes");
        Ok(())
    }

    async fn pause(&self, node: &str) -> Result<()> {
        self.signal(node, "-STOP").await?;
        self.tracker.update_state(node, ResourceState::Paused).await?;
        info!(node = %node, "Paused process");
        Ok(())
    }

    async fn resume(&self, node: &str) -> Result<()> {
        self.signal(node, "-CONT").await?;
        self.tracker.update_state(node, ResourceState::Running).await?;
        info!(node = %node, "Resumed process");
        Ok(())
    }

    async fn restart(&self, node: &str, after: Option<Duration>) -> Result<()> {
        let mut process = self
            .processes
            .lock()
            .await
            .remove(node)
            .ok_or_else(|| OrchestratorError::node_not_found(node))?;
        process.child.kill().await?;
        if let Some(delay) = after {
            tokio::time::sleep(delay).await;
        }

        let offset = Self::log_len(&process.spec.log_file).await;
        let mut child = self.start_process(&process.spec).await?;
        self.wait_ready(node, &mut child, &process.spec.log_file, offset).await?;
        let handle = self.tracker.require(node).await?;
        let pid = child.id().map(|p| p.to_string()).unwrap_or_default();
        self.tracker
            .register(ResourceHandle {
                resource_id: pid,
                state: ResourceState::Running,
                ..handle
            })
            .await;
        process.child = child;
        self.processes.lock().await.insert(node.to_string(), process);
        info!(node = %node, "Restarted process");
        Ok(())
    }
}

fn ensure_running(name: &str, child: &mut Child) -> Result<()> {
    match child.try_wait()? {
        Some(status) => Err(OrchestratorError::spawn_failed(name, format!("process exited with {status}"))),
        None => Ok(()),
    }
}
