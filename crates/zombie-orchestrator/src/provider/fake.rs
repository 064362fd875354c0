//! In-memory provider used by the orchestration tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ExecOutput, FileTransfer, Provider, ProviderCapabilities, ProviderKind, ResourceDefinition, ResourceSpec};
use crate::constants::NODE_CONTAINER_WAIT_LOG;
use crate::error::{OrchestratorError, Result};
use crate::genesis::parse_chain_spec;
use crate::topology::Node;

/// Records every call and serves files from memory.
pub(crate) struct FakeProvider {
    kind: ProviderKind,
    tmp_dir: PathBuf,
    spawn_delay: Duration,
    /// `define:<node>`, `spawn:<node>`, `ready:<node>`, `release:<node>`,
    /// `forward:<node>:<port>`, `destroy`.
    pub events: Mutex<Vec<String>>,
    /// Files a helper node "produced", keyed by remote path.
    pub remote_files: Mutex<HashMap<String, String>>,
    /// What `cat <path>` prints inside a node.
    pub cat_output: Mutex<HashMap<String, String>>,
    /// Chain spec inspected whenever a definition is generated.
    pub watched_spec: Mutex<Option<PathBuf>>,
    /// Boot node count of the watched spec per defined node.
    pub bootnodes_at_definition: Mutex<HashMap<String, usize>>,
    /// Files handed to each spawn.
    pub transfers: Mutex<HashMap<String, Vec<FileTransfer>>>,
    /// Node whose spawn fails.
    pub fail_spawn_of: Mutex<Option<String>>,
    capabilities: ProviderCapabilities,
    destroyed: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeProvider {
    pub(crate) fn new(tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            kind: ProviderKind::Kubernetes,
            tmp_dir: tmp_dir.into(),
            spawn_delay: Duration::from_millis(100),
            events: Mutex::default(),
            remote_files: Mutex::default(),
            cat_output: Mutex::default(),
            watched_spec: Mutex::default(),
            bootnodes_at_definition: Mutex::default(),
            transfers: Mutex::default(),
            fail_spawn_of: Mutex::default(),
            capabilities: ProviderCapabilities::container(),
            destroyed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_remote_file(self, remote: &str, content: &str) -> Self {
        self.remote_files.lock().unwrap().insert(remote.to_string(), content.to_string());
        self
    }

    pub(crate) fn with_capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Highest number of spawns that were running at the same time.
    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn namespace(&self) -> &str {
        "zombie-test"
    }

    fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities.clone()
    }

    async fn validate_access(&self) -> Result<()> {
        Ok(())
    }

    async fn create_namespace(&self) -> Result<()> {
        self.record("namespace".into());
        Ok(())
    }

    fn generate_resource_definition(&self, node: &Node) -> Result<ResourceDefinition> {
        self.record(format!("define:{}", node.name));
        if let Some(path) = self.watched_spec.lock().unwrap().as_ref() {
            let count = std::fs::read_to_string(path)
                .ok()
                .and_then(|c| parse_chain_spec(&c).ok())
                .and_then(|doc| doc["bootNodes"].as_array().map(Vec::len))
                .unwrap_or(0);
            self.bootnodes_at_definition.lock().unwrap().insert(node.name.clone(), count);
        }
        Ok(ResourceDefinition {
            name: node.name.clone(),
            role: node.role,
            ports: node.ports,
            spec: ResourceSpec::Pod(serde_json::json!({"command": node.full_command})),
        })
    }

    async fn spawn(&self, def: &ResourceDefinition, files: &[FileTransfer]) -> Result<()> {
        self.record(format!("spawn:{}", def.name));
        self.transfers.lock().unwrap().insert(def.name.clone(), files.to_vec());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.spawn_delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.fail_spawn_of.lock().unwrap().as_deref() == Some(def.name.as_str()) {
            return Err(OrchestratorError::spawn_timeout(&def.name, "pod"));
        }
        self.record(format!("ready:{}", def.name));
        Ok(())
    }

    async fn copy_file_to_node(&self, _node: &str, _local: &Path, _remote: &str) -> Result<()> {
        Ok(())
    }

    async fn copy_file_from_node(&self, _node: &str, remote: &str, local: &Path) -> Result<()> {
        let content = self.remote_files.lock().unwrap().get(remote).cloned().ok_or_else(|| {
            OrchestratorError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, remote.to_string()))
        })?;
        tokio::fs::write(local, content).await?;
        Ok(())
    }

    async fn put_magic_file(&self, node: &str) -> Result<()> {
        self.record(format!("release:{node}"));
        Ok(())
    }

    async fn start_port_forwarding(&self, port: u16, node: &str) -> Result<u16> {
        self.record(format!("forward:{node}:{port}"));
        Ok(port)
    }

    async fn node_address(&self, _node: &str, port: u16) -> Result<(String, u16)> {
        Ok(("10.0.0.1".to_string(), port))
    }

    async fn run_command(&self, _args: &[&str]) -> Result<ExecOutput> {
        Ok(ExecOutput::default())
    }

    async fn exec(&self, _node: &str, cmd: &[&str]) -> Result<ExecOutput> {
        match cmd {
            ["cat", path] => match self.cat_output.lock().unwrap().get(*path) {
                Some(out) => Ok(ExecOutput::new(out.clone(), "", 0)),
                None => Ok(ExecOutput::new("", "No such file", 1)),
            },
            _ => Ok(ExecOutput::default()),
        }
    }

    async fn logs(&self, node: &str, _since: Option<Duration>) -> Result<String> {
        Ok(format!("{node}\n{NODE_CONTAINER_WAIT_LOG}\n"))
    }

    async fn pause(&self, node: &str) -> Result<()> {
        self.record(format!("pause:{node}"));
        Ok(())
    }

    async fn resume(&self, node: &str) -> Result<()> {
        self.record(format!("resume:{node}"));
        Ok(())
    }

    async fn restart(&self, node: &str, _after: Option<Duration>) -> Result<()> {
        self.record(format!("restart:{node}"));
        Ok(())
    }

    async fn destroy_namespace(&self) -> Result<()> {
        self.record("destroy".into());
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
