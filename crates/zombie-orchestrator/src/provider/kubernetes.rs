//! Kubernetes provider.
//!
//! Nodes run as pods in a dedicated namespace. Everything goes through the
//! `kubectl` binary: manifests are applied from files in the run's working
//! directory, files move with `kubectl cp` and ports are reached through
//! `kubectl port-forward` child processes.
//!
//! Each pod starts with an init container that waits for the finish magic
//! file, which gives us a window to copy chain specs and keys into the shared
//! volumes before the node process starts.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::lifecycle::{ResourceHandle, ResourceState, ResourceTracker};
use super::r#trait::{ExecOutput, FileTransfer, Provider, ProviderCapabilities, ResourceDefinition, ResourceSpec};
use super::{run_program, wait_until, ProviderKind, ProviderOptions};
use crate::command::{generate_command, RemotePaths};
use crate::constants::{CONTAINER_READY_POLL, FINISH_MAGIC_FILE, TRANSFER_CONTAINER_NAME, TRANSFER_CONTAINER_WAIT_LOG};
use crate::error::{OrchestratorError, Result};
use crate::topology::{Node, NodeRole, ResourceQuantities, Resources};

const KUBECTL: &str = "kubectl";
const TRANSFER_IMAGE: &str = "docker.io/alpine:latest";
const PORT_FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Kubernetes execution provider.
pub struct KubernetesProvider {
    options: ProviderOptions,
    tracker: ResourceTracker,
    /// Running `kubectl port-forward` children, keyed by node and port.
    forwards: Mutex<Forwards>,
}

impl KubernetesProvider {
    /// Creates a provider for the namespace in `options`.
    pub fn new(options: ProviderOptions) -> Self {
        Self {
            options,
            tracker: ResourceTracker::new(),
            forwards: Mutex::new(HashMap::new()),
        }
    }

    async fn kubectl(&self, args: &[&str]) -> Result<ExecOutput> {
        run_program(KUBECTL, args, None).await
    }

    async fn kubectl_ok(&self, args: &[&str]) -> Result<ExecOutput> {
        let command = format!("{KUBECTL} {}", args.join(" "));
        self.kubectl(args).await?.into_result(&command)
    }

    async fn get_pod(&self, name: &str) -> Result<Pod> {
        let ns = self.namespace();
        let out = self.kubectl_ok(&["get", "pod", name, "-n", ns, "-o", "json"]).await?;
        Ok(serde_json::from_str(&out.stdout)?)
    }

    async fn wait_transfer_container(&self, name: &str) -> Result<()> {
        let ready = wait_until(self.options.spawn_timeout, CONTAINER_READY_POLL, || async move {
            match self.get_pod(name).await {
                Ok(pod) => Ok(transfer_container_running(&pod)),
                Err(e) => {
                    debug!(pod = %name, error = %e, "Pod not visible yet");
                    Ok(false)
                }
            }
        })
        .await?;
        if !ready {
            return Err(OrchestratorError::spawn_timeout(name, "pod"));
        }
        debug!(pod = %name, log = TRANSFER_CONTAINER_WAIT_LOG, "Transfer container ready");
        Ok(())
    }

    async fn wait_pod_ready(&self, name: &str) -> Result<Pod> {
        let ready = wait_until(self.options.spawn_timeout, CONTAINER_READY_POLL, || async move {
            let pod = self.get_pod(name).await?;
            match pod_phase(&pod) {
                Some("Running") | Some("Succeeded") => Ok(true),
                Some("Failed") => Err(OrchestratorError::spawn_failed(name, "pod phase is Failed")),
                _ => Ok(false),
            }
        })
        .await?;
        if !ready {
            return Err(OrchestratorError::spawn_timeout(name, "pod"));
        }
        self.get_pod(name).await
    }

    async fn copy_into_transfer_container(&self, name: &str, file: &FileTransfer) -> Result<()> {
        let ns = self.namespace();
        if let Some(parent) = Path::new(&file.remote).parent() {
            let parent = parent.to_string_lossy();
            self.kubectl_ok(&["exec", name, "-n", ns, "-c", TRANSFER_CONTAINER_NAME, "--", "mkdir", "-p", &parent])
                .await?;
        }
        let local = file.local.to_string_lossy();
        let target = format!("{ns}/{name}:{}", file.remote);
        self.kubectl_ok(&["cp", &local, &target, "-c", TRANSFER_CONTAINER_NAME]).await?;
        debug!(pod = %name, file = %file.remote, "Copied file");
        Ok(())
    }

    async fn signal_wrapper(&self, node: &str, message: &str) -> Result<()> {
        let script = format!("echo {message} > /tmp/zombiepipe");
        let command = format!("exec {node} {script}");
        self.exec(node, &["sh", "-c", &script]).await?.into_result(&command)?;
        Ok(())
    }

    async fn spawn_port_forward(&self, node: &str, port: u16) -> Result<(u16, Child)> {
        let ns = self.namespace().to_string();
        let pod = format!("pod/{node}");
        let mapping = format!(":{port}");
        let mut child = tokio::process::Command::new(KUBECTL)
            .args(["port-forward", &pod, &mapping, "-n", &ns])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OrchestratorError::provider_access("kubernetes", "port-forward has no stdout"))?;
        let mut lines = BufReader::new(stdout).lines();
        let read = async {
            while let Some(line) = lines.next_line().await? {
                if let Some(local) = parse_forwarded_port(&line) {
                    return Ok(Some(local));
                }
            }
            Ok::<_, OrchestratorError>(None)
        };
        match tokio::time::timeout(PORT_FORWARD_TIMEOUT, read).await {
            Ok(Ok(Some(local))) => {
                // Keep draining so the child never blocks on a full pipe.
                tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });
                Ok((local, child))
            }
            Ok(Ok(None)) => Err(OrchestratorError::provider_access("kubernetes", format!("port-forward to {node} exited"))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(OrchestratorError::timeout(format!("port-forward to {node}:{port}"))),
        }
    }

    fn pod_manifest(&self, node: &Node, command: Vec<String>, paths: &RemotePaths) -> PodManifest {
        let ns = self.namespace().to_string();
        let mounts = vec![
            VolumeMount::new("tmp-cfg", &paths.cfg),
            VolumeMount::new("tmp-data", &paths.data),
            VolumeMount::new("tmp-relay-data", &paths.relay_data),
        ];
        let labels = BTreeMap::from([
            ("app".to_string(), "zombienet".to_string()),
            ("zombie-role".to_string(), node.role.name().to_string()),
            ("zombie-ns".to_string(), ns.clone()),
        ]);

        let transfer = ContainerManifest {
            name: TRANSFER_CONTAINER_NAME.to_string(),
            image: TRANSFER_IMAGE.to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            command: vec![
                "ash".to_string(),
                "-c".to_string(),
                format!(
                    "until [ -f {FINISH_MAGIC_FILE} ]; do echo {TRANSFER_CONTAINER_WAIT_LOG}; sleep 1; done;"
                ),
            ],
            env: Vec::new(),
            ports: Vec::new(),
            volume_mounts: mounts.clone(),
            resources: None,
        };

        let main = ContainerManifest {
            name: node.name.clone(),
            image: node.image.reference().to_string(),
            image_pull_policy: self.options.image_pull_policy.as_str().to_string(),
            command,
            env: node
                .env
                .iter()
                .map(|(name, value)| EnvVar {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            ports: vec![
                ContainerPort::new("prometheus", node.ports.prometheus),
                ContainerPort::new("rpc", node.ports.rpc),
                ContainerPort::new("p2p", node.ports.p2p),
            ],
            volume_mounts: mounts,
            resources: node.resources.as_ref().map(ResourceRequirements::from),
        };

        PodManifest {
            api_version: "v1",
            kind: "Pod",
            metadata: ObjectMeta {
                name: node.name.clone(),
                namespace: ns,
                labels,
            },
            spec: PodSpec {
                hostname: node.name.clone(),
                restart_policy: if node.role == NodeRole::Temp { "Never" } else { "OnFailure" },
                init_containers: vec![transfer],
                containers: vec![main],
                volumes: ["tmp-cfg", "tmp-data", "tmp-relay-data"]
                    .into_iter()
                    .map(|name| Volume {
                        name: name.to_string(),
                        empty_dir: EmptyDir {},
                    })
                    .collect(),
            },
        }
    }
}

#[async_trait]
impl Provider for KubernetesProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Kubernetes
    }

    fn namespace(&self) -> &str {
        &self.options.namespace
    }

    fn tmp_dir(&self) -> &Path {
        &self.options.tmp_dir
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            requires_port_forward: true,
            ..ProviderCapabilities::container()
        }
    }

    async fn validate_access(&self) -> Result<()> {
        let out = self
            .kubectl(&["cluster-info"])
            .await
            .map_err(|e| OrchestratorError::provider_access("kubernetes", e.to_string()))?;
        if !out.success() {
            return Err(OrchestratorError::provider_access("kubernetes", out.combined_output()));
        }
        Ok(())
    }

    async fn create_namespace(&self) -> Result<()> {
        let manifest = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": self.namespace(),
                "labels": {"app": "zombienet", "zombie-ns": self.namespace()}
            }
        });
        let data = serde_json::to_vec(&manifest)?;
        run_program(KUBECTL, &["apply", "-f", "-"], Some(&data))
            .await?
            .into_result("kubectl apply namespace")?;
        info!(namespace = %self.namespace(), "Created namespace");
        Ok(())
    }

    fn generate_resource_definition(&self, node: &Node) -> Result<ResourceDefinition> {
        let paths = self.remote_paths(&node.name);
        let command = generate_command(node, &paths)?.container_args(&paths.cfg);
        let manifest = serde_json::to_value(self.pod_manifest(node, command, &paths))?;
        Ok(ResourceDefinition {
            name: node.name.clone(),
            role: node.role,
            ports: node.ports,
            spec: ResourceSpec::Pod(manifest),
        })
    }

    async fn spawn(&self, def: &ResourceDefinition, files: &[FileTransfer]) -> Result<()> {
        let ResourceSpec::Pod(manifest) = &def.spec else {
            return Err(OrchestratorError::spawn_failed(&def.name, "not a pod definition"));
        };
        let name = def.name.as_str();
        let path: PathBuf = self.tmp_dir().join(format!("{name}-pod.yaml"));
        tokio::fs::write(&path, serde_yaml::to_string(manifest)?).await?;
        debug!(pod = %name, manifest = %path.display(), "Applying pod manifest");

        let path_arg = path.to_string_lossy();
        self.kubectl_ok(&["apply", "-f", &path_arg, "-n", self.namespace()]).await?;
        self.tracker.register(ResourceHandle::new(name, name, def.role)).await;

        self.wait_transfer_container(name).await?;
        for file in files {
            self.copy_into_transfer_container(name, file).await?;
        }
        self.kubectl_ok(&[
            "exec",
            name,
            "-n",
            self.namespace(),
            "-c",
            TRANSFER_CONTAINER_NAME,
            "--",
            "touch",
            FINISH_MAGIC_FILE,
        ])
        .await?;

        let pod = self.wait_pod_ready(name).await?;
        if let Some(ip) = pod_ip(&pod) {
            self.tracker.set_ip(name, ip).await?;
        }
        self.tracker.update_state(name, ResourceState::Running).await?;
        info!(pod = %name, role = %def.role, "Pod ready");
        Ok(())
    }

    async fn copy_file_to_node(&self, node: &str, local: &Path, remote: &str) -> Result<()> {
        let local = local.to_string_lossy();
        let target = format!("{}/{node}:{remote}", self.namespace());
        self.kubectl_ok(&["cp", &local, &target, "-c", node]).await?;
        Ok(())
    }

    async fn copy_file_from_node(&self, node: &str, remote: &str, local: &Path) -> Result<()> {
        let source = format!("{}/{node}:{remote}", self.namespace());
        let local = local.to_string_lossy();
        self.kubectl_ok(&["cp", &source, &local, "-c", node]).await?;
        Ok(())
    }

    async fn put_magic_file(&self, node: &str) -> Result<()> {
        self.kubectl_ok(&["exec", node, "-n", self.namespace(), "--", "touch", FINISH_MAGIC_FILE])
            .await?;
        Ok(())
    }

    async fn start_port_forwarding(&self, port: u16, node: &str) -> Result<u16> {
        let key = (node.to_string(), port);
        if let Some(local) = live_forward(&mut *self.forwards.lock().await, &key) {
            return Ok(local);
        }

        // Not locked while kubectl starts, so other nodes' forwards proceed.
        let (local, child) = self.spawn_port_forward(node, port).await?;
        let (local, surplus) = settle_forward(&mut *self.forwards.lock().await, key, local, child);
        if let Some(mut surplus) = surplus {
            debug!(node = %node, port, "Port-forward raced, keeping the first one");
            if let Err(e) = surplus.kill().await {
                debug!(node = %node, port, error = %e, "Surplus port-forward already gone");
            }
            return Ok(local);
        }
        info!(node = %node, port, local, "Port-forward established");
        Ok(local)
    }

    async fn node_address(&self, node: &str, port: u16) -> Result<(String, u16)> {
        if let Some(ip) = self.tracker.get(node).await.and_then(|h| h.ip_address) {
            return Ok((ip, port));
        }
        let pod = self.get_pod(node).await?;
        let ip = pod_ip(&pod).ok_or_else(|| OrchestratorError::node_not_found(format!("{node} has no pod ip")))?;
        Ok((ip.to_string(), port))
    }

    async fn run_command(&self, args: &[&str]) -> Result<ExecOutput> {
        self.kubectl(args).await
    }

    async fn exec(&self, node: &str, cmd: &[&str]) -> Result<ExecOutput> {
        let mut args = vec!["exec", node, "-n", self.namespace(), "-c", node, "--"];
        args.extend_from_slice(cmd);
        self.run_command(&args).await
    }

    async fn logs(&self, node: &str, since: Option<Duration>) -> Result<String> {
        let since = since.map(|d| format!("--since={}s", d.as_secs().max(1)));
        let mut args = vec!["logs", node, "-n", self.namespace(), "-c", node];
        if let Some(since) = since.as_deref() {
            args.push(since);
        }
        Ok(self.run_command(&args).await?.into_result("kubectl logs")?.stdout)
    }

    async fn destroy_namespace(&self) -> Result<()> {
        let mut forwards = self.forwards.lock().await;
        for ((node, port), (_, mut child)) in forwards.drain() {
            if let Err(e) = child.kill().await {
                debug!(node = %node, port, error = %e, "Port-forward already gone");
            }
        }
        drop(forwards);

        let out = self
            .kubectl(&["delete", "namespace", self.namespace(), "--wait=false"])
            .await?;
        self.tracker.clear().await;
        if !out.success() {
            error!(namespace = %self.namespace(), output = %out.combined_output(), "Failed to delete namespace");
            return Err(OrchestratorError::teardown_failed(out.combined_output()));
        }
        info!(namespace = %self.namespace(), "Deleted namespace");
        Ok(())
    }

    async fn pause(&self, node: &str) -> Result<()> {
        self.signal_wrapper(node, "pause").await?;
        self.tracker.update_state(node, ResourceState::Paused).await?;
        info!(node = %node, "Paused node");
        Ok(())
    }

    async fn resume(&self, node: &str) -> Result<()> {
        self.signal_wrapper(node, "resume").await?;
        self.tracker.update_state(node, ResourceState::Running).await?;
        info!(node = %node, "Resumed node");
        Ok(())
    }

    async fn restart(&self, node: &str, after: Option<Duration>) -> Result<()> {
        let message = match after {
            Some(d) => format!("restart {}", d.as_secs()),
            None => "restart".to_string(),
        };
        self.signal_wrapper(node, &message).await?;
        info!(node = %node, "Restarted node");
        Ok(())
    }
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.pod_ip.as_deref()
}

fn transfer_container_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.init_container_statuses.as_ref())
        .into_iter()
        .flatten()
        .any(|s| s.name == TRANSFER_CONTAINER_NAME && s.state.as_ref().is_some_and(|state| state.running.is_some()))
}

/// Live `kubectl port-forward` children keyed by (pod, remote port).
type Forwards = HashMap<(String, u16), (u16, Child)>;

/// Local port of a still-running forward for `key`.
fn live_forward(forwards: &mut Forwards, key: &(String, u16)) -> Option<u16> {
    let (local, child) = forwards.get_mut(key)?;
    if matches!(child.try_wait(), Ok(None)) {
        return Some(*local);
    }
    warn!(node = %key.0, port = key.1, "Port-forward died, re-establishing");
    None
}

/// Records a freshly started forward unless a live one won the race; the
/// loser is handed back to be killed.
fn settle_forward(forwards: &mut Forwards, key: (String, u16), local: u16, child: Child) -> (u16, Option<Child>) {
    if let Some(existing) = live_forward(forwards, &key) {
        return (existing, Some(child));
    }
    forwards.insert(key, (local, child));
    (local, None)
}

// "Forwarding from 127.0.0.1:41234 -> 9944"
fn parse_forwarded_port(line: &str) -> Option<u16> {
    let rest = line.strip_prefix("Forwarding from ")?;
    let addr = rest.split_whitespace().next()?;
    addr.rsplit(':').next()?.parse().ok()
}

// Pod manifest types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PodManifest {
    api_version: &'static str,
    kind: &'static str,
    metadata: ObjectMeta,
    spec: PodSpec,
}

#[derive(Debug, Serialize)]
struct ObjectMeta {
    name: String,
    namespace: String,
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PodSpec {
    hostname: String,
    restart_policy: &'static str,
    init_containers: Vec<ContainerManifest>,
    containers: Vec<ContainerManifest>,
    volumes: Vec<Volume>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContainerManifest {
    name: String,
    image: String,
    image_pull_policy: String,
    command: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    env: Vec<EnvVar>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<ContainerPort>,
    volume_mounts: Vec<VolumeMount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resources: Option<ResourceRequirements>,
}

#[derive(Debug, Serialize)]
struct EnvVar {
    name: String,
    value: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContainerPort {
    container_port: u16,
    name: String,
}

impl ContainerPort {
    fn new(name: &str, port: u16) -> Self {
        Self {
            container_port: port,
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct VolumeMount {
    name: String,
    mount_path: String,
}

impl VolumeMount {
    fn new(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            mount_path: path.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Volume {
    name: String,
    empty_dir: EmptyDir,
}

#[derive(Debug, Serialize)]
struct EmptyDir {}

#[derive(Debug, Serialize)]
struct ResourceRequirements {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    requests: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    limits: BTreeMap<String, String>,
}

impl From<&Resources> for ResourceRequirements {
    fn from(resources: &Resources) -> Self {
        let quantities = |q: &Option<ResourceQuantities>| {
            let mut map = BTreeMap::new();
            if let Some(q) = q {
                if let Some(memory) = &q.memory {
                    map.insert("memory".to_string(), memory.clone());
                }
                if let Some(cpu) = &q.cpu {
                    map.insert("cpu".to_string(), cpu.clone());
                }
            }
            map
        };
        Self {
            requests: quantities(&resources.requests),
            limits: quantities(&resources.limits),
        }
    }
}
