//! Execution providers.
//!
//! This module defines the [`Provider`] trait and the three backends that
//! implement it: Kubernetes pods driven through `kubectl`, Podman containers
//! driven through its Docker-compatible API, and plain local processes.

#[cfg(test)]
pub(crate) mod fake;
mod kubernetes;
mod lifecycle;
mod native;
mod podman;
mod r#trait;

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::constants::DEFAULT_NODE_SPAWN_TIMEOUT_SECS;
use crate::error::{OrchestratorError, Result};
use crate::topology::ImagePullPolicy;

pub use kubernetes::KubernetesProvider;
pub use lifecycle::{ResourceHandle, ResourceState, ResourceTracker};
pub use native::NativeProvider;
pub use podman::PodmanProvider;
pub use r#trait::{
    ContainerSpec, ExecOutput, FileTransfer, ProcessSpec, Provider, ProviderCapabilities, ResourceDefinition,
    ResourceSpec, SharedProvider,
};

/// Prefix of a reference to another node inside a command,
/// e.g. `{{ZOMBIE:alice:multiAddress}}`.
pub const NETWORK_REF_PREFIX: &str = "{{ZOMBIE:";

/// The execution backend of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Pods in a Kubernetes namespace.
    #[default]
    Kubernetes,
    /// Containers on a Podman network.
    Podman,
    /// Local processes.
    Native,
}

impl ProviderKind {
    /// Returns the provider name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kubernetes => "kubernetes",
            Self::Podman => "podman",
            Self::Native => "native",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            "podman" => Ok(Self::Podman),
            "native" => Ok(Self::Native),
            other => Err(OrchestratorError::config_validation(format!("unknown provider {other}"))),
        }
    }
}

/// Settings shared by every provider.
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    /// Namespace of the run.
    pub namespace: String,
    /// Local working directory.
    pub tmp_dir: PathBuf,
    /// Readiness budget of one spawn.
    pub spawn_timeout: Duration,
    /// When to pull node images.
    pub image_pull_policy: ImagePullPolicy,
}

impl ProviderOptions {
    /// Creates options with the default spawn budget.
    pub fn new(namespace: impl Into<String>, tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            namespace: namespace.into(),
            tmp_dir: tmp_dir.into(),
            spawn_timeout: Duration::from_secs(DEFAULT_NODE_SPAWN_TIMEOUT_SECS),
            image_pull_policy: ImagePullPolicy::default(),
        }
    }
}

/// Creates the provider for `kind` and checks it can be used.
///
/// # Errors
///
/// Returns `ProviderAccess` if the backend is unreachable.
pub async fn connect(kind: ProviderKind, options: ProviderOptions) -> Result<SharedProvider> {
    let provider: SharedProvider = match kind {
        ProviderKind::Kubernetes => Arc::new(KubernetesProvider::new(options)),
        ProviderKind::Podman => Arc::new(PodmanProvider::connect(options)?),
        ProviderKind::Native => Arc::new(NativeProvider::new(options)),
    };
    provider.validate_access().await?;
    info!(provider = %kind, namespace = %provider.namespace(), "Provider ready");
    Ok(provider)
}

/// Generates a fresh namespace name for `kind`.
pub fn generate_namespace(kind: ProviderKind) -> String {
    let mut bytes = match kind {
        ProviderKind::Podman => vec![0u8; 4],
        _ => vec![0u8; 16],
    };
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("zombie-{}", hex::encode(bytes))
}

/// Replaces every `{{ZOMBIE:<node>:<field>}}` token in `text`.
///
/// `resolve` receives the node name and field and returns the value.
///
/// # Errors
///
/// Returns `ConfigValidation` for a token `resolve` can not answer.
pub fn replace_network_refs<F>(text: &str, resolve: F) -> Result<String>
where
    F: Fn(&str, &str) -> Option<String>,
{
    if !text.contains(NETWORK_REF_PREFIX) {
        return Ok(text.to_string());
    }
    let re = Regex::new(r"\{\{ZOMBIE:([^:}]+):([^}]+)\}\}")
        .map_err(|e| OrchestratorError::config_validation(e.to_string()))?;

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in re.captures_iter(text) {
        let (Some(whole), Some(node), Some(field)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let value = resolve(node.as_str(), field.as_str()).ok_or_else(|| {
            OrchestratorError::config_validation(format!("unresolved network reference {}", whole.as_str()))
        })?;
        out.push_str(&text[last..whole.start()]);
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// Runs `program` with `args`, optionally feeding `stdin`.
pub(crate) async fn run_program(program: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<ExecOutput> {
    debug!(program = %program, args = ?args, "Running command");
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input).await?;
        drop(pipe);
    }
    Ok(child.wait_with_output().await?.into())
}

/// Polls `check` every `interval` until it returns true or `timeout` elapses.
///
/// Returns false on timeout; errors from `check` end the wait.
pub(crate) async fn wait_until<F, Fut>(timeout: Duration, interval: Duration, mut check: F) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = tokio::time::Instant::now();
    loop {
        if check().await? {
            return Ok(true);
        }
        if start.elapsed() >= timeout {
            return Ok(false);
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_provider_kind_serde() {
        let kind: ProviderKind = serde_json::from_str("\"podman\"").unwrap();
        assert_eq!(kind, ProviderKind::Podman);
        assert_eq!(serde_json::to_string(&ProviderKind::Native).unwrap(), "\"native\"");
        assert_eq!("k8s".parse::<ProviderKind>().unwrap(), ProviderKind::Kubernetes);
        assert!("docker".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_generate_namespace() {
        let ns = generate_namespace(ProviderKind::Kubernetes);
        assert!(ns.starts_with("zombie-"));
        assert_eq!(ns.len(), "zombie-".len() + 32);
        assert_eq!(generate_namespace(ProviderKind::Podman).len(), "zombie-".len() + 8);
        assert_ne!(ns, generate_namespace(ProviderKind::Kubernetes));
    }

    #[test]
    fn test_replace_network_refs() {
        let resolve = |node: &str, field: &str| match (node, field) {
            ("alice", "multiAddress") => Some("/ip4/10.0.0.1/tcp/30333/ws/p2p/12D3".to_string()),
            ("alice", "wsUri") => Some("ws://127.0.0.1:9944".to_string()),
            _ => None,
        };
        let out = replace_network_refs(
            "--bootnodes {{ZOMBIE:alice:multiAddress}} --url {{ZOMBIE:alice:wsUri}}",
            resolve,
        )
        .unwrap();
        assert_eq!(out, "--bootnodes /ip4/10.0.0.1/tcp/30333/ws/p2p/12D3 --url ws://127.0.0.1:9944");

        assert_eq!(replace_network_refs("plain", resolve).unwrap(), "plain");
        let err = replace_network_refs("{{ZOMBIE:bob:wsUri}}", resolve).unwrap_err();
        assert!(matches!(err, OrchestratorError::ConfigValidation(_)));
    }

    #[tokio::test]
    async fn test_run_program_captures_output() {
        let out = run_program("sh", &["-c", "cat; echo err >&2; exit 3"], Some(b"hello")).await.unwrap();
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.stderr.trim(), "err");
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until() {
        let calls = AtomicUsize::new(0);
        let ready = wait_until(Duration::from_secs(10), Duration::from_secs(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n >= 2) }
        })
        .await
        .unwrap();
        assert!(ready);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let ready = wait_until(Duration::from_secs(3), Duration::from_secs(1), || async { Ok(false) })
            .await
            .unwrap();
        assert!(!ready);
    }
}
