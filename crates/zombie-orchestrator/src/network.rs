//! The registry of a launched network.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{OrchestratorError, Result};
use crate::node::{NetworkNode, NodeUris};
use crate::provider::SharedProvider;

/// File the network summary is written to, inside the working directory.
pub const SUMMARY_FILE: &str = "zombie.json";

/// Every node handle of one run plus namespace-level lifecycle.
#[derive(Debug)]
pub struct Network {
    provider: SharedProvider,
    relay_chain: String,
    chain_id: Option<String>,
    started_at: DateTime<Utc>,
    relay: Vec<Arc<NetworkNode>>,
    paras: BTreeMap<u32, Vec<Arc<NetworkNode>>>,
    companions: Vec<Arc<NetworkNode>>,
    launched: bool,
}

/// Serialized form of a network.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSummary {
    /// Namespace of the run.
    pub namespace: String,
    /// Local working directory.
    pub tmp_dir: PathBuf,
    /// Relay chain name.
    pub relay_chain: String,
    /// `id` of the relay chain spec.
    pub chain_id: Option<String>,
    /// Launch start time.
    pub started_at: DateTime<Utc>,
    /// Relay chain nodes.
    pub relay: Vec<NodeSummary>,
    /// Collators per parachain.
    pub parachains: BTreeMap<u32, Vec<NodeSummary>>,
    /// Companion services.
    pub companions: Vec<NodeSummary>,
}

/// Serialized form of a node.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    /// Node name.
    pub name: String,
    /// Addresses.
    #[serde(flatten)]
    pub uris: NodeUris,
}

impl From<&NetworkNode> for NodeSummary {
    fn from(node: &NetworkNode) -> Self {
        Self {
            name: node.name().to_string(),
            uris: node.uris(),
        }
    }
}

impl Network {
    /// Creates an empty registry.
    pub fn new(provider: SharedProvider, relay_chain: impl Into<String>) -> Self {
        Self {
            provider,
            relay_chain: relay_chain.into(),
            chain_id: None,
            started_at: Utc::now(),
            relay: Vec::new(),
            paras: BTreeMap::new(),
            companions: Vec::new(),
            launched: false,
        }
    }

    /// Namespace of the run.
    pub fn namespace(&self) -> &str {
        self.provider.namespace()
    }

    /// Local working directory.
    pub fn tmp_dir(&self) -> &Path {
        self.provider.tmp_dir()
    }

    /// The provider running the nodes.
    pub fn provider(&self) -> &SharedProvider {
        &self.provider
    }

    /// Relay chain name.
    pub fn relay_chain(&self) -> &str {
        &self.relay_chain
    }

    /// `id` of the relay chain spec, once known.
    pub fn chain_id(&self) -> Option<&str> {
        self.chain_id.as_deref()
    }

    pub(crate) fn set_chain_id(&mut self, id: impl Into<String>) {
        self.chain_id = Some(id.into());
    }

    /// Whether every node was spawned.
    pub fn is_launched(&self) -> bool {
        self.launched
    }

    pub(crate) fn mark_launched(&mut self) {
        self.launched = true;
    }

    /// Registers a relay chain node.
    pub fn add_relay_node(&mut self, node: NetworkNode) -> Arc<NetworkNode> {
        let node = Arc::new(node);
        self.relay.push(Arc::clone(&node));
        node
    }

    /// Registers a collator of `para_id`.
    pub fn add_collator(&mut self, para_id: u32, node: NetworkNode) -> Arc<NetworkNode> {
        let node = Arc::new(node);
        self.paras.entry(para_id).or_default().push(Arc::clone(&node));
        node
    }

    /// Registers a companion service.
    pub fn add_companion(&mut self, node: NetworkNode) -> Arc<NetworkNode> {
        let node = Arc::new(node);
        self.companions.push(Arc::clone(&node));
        node
    }

    /// Relay chain nodes in spawn order.
    pub fn relay_nodes(&self) -> &[Arc<NetworkNode>] {
        &self.relay
    }

    /// Collators of `para_id` in spawn order.
    pub fn collators(&self, para_id: u32) -> &[Arc<NetworkNode>] {
        self.paras.get(&para_id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Ids of the parachains with at least one collator.
    pub fn para_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.paras.keys().copied()
    }

    /// Companion services.
    pub fn companions(&self) -> &[Arc<NetworkNode>] {
        &self.companions
    }

    /// Every node: relay first, then collators by para id, then companions.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<NetworkNode>> {
        self.relay
            .iter()
            .chain(self.paras.values().flatten())
            .chain(self.companions.iter())
    }

    /// Looks a node up by name.
    pub fn get_node_by_name(&self, name: &str) -> Result<Arc<NetworkNode>> {
        self.nodes()
            .find(|n| n.name() == name)
            .cloned()
            .ok_or_else(|| OrchestratorError::node_not_found(name))
    }

    /// Returns the node called `name_or_group`, or every node of that group.
    pub fn get_nodes(&self, name_or_group: &str) -> Result<Vec<Arc<NetworkNode>>> {
        let nodes: Vec<_> = self
            .nodes()
            .filter(|n| n.name() == name_or_group || n.group() == Some(name_or_group))
            .cloned()
            .collect();
        if nodes.is_empty() {
            return Err(OrchestratorError::node_not_found(name_or_group));
        }
        Ok(nodes)
    }

    /// Checks that node `name` answers RPC within `timeout`.
    pub async fn node_is_up(&self, name: &str, timeout: Duration) -> Result<bool> {
        Ok(self.get_node_by_name(name)?.is_up(timeout).await)
    }

    /// Resolves a `{{ZOMBIE:<node>:<field>}}` reference.
    pub fn reference(&self, node: &str, field: &str) -> Option<String> {
        let node = self.get_node_by_name(node).ok()?;
        match field {
            "multiAddress" | "multiaddr" => Some(node.multi_address()),
            "wsUri" => Some(node.ws_uri()),
            "prometheusUri" => Some(node.prometheus_uri()),
            "name" => Some(node.name().to_string()),
            _ => None,
        }
    }

    /// Writes the logs of every node under `<tmp>/logs`.
    ///
    /// Failures are logged and skipped.
    pub async fn dump_logs(&self) -> Vec<PathBuf> {
        let mut dumped = Vec::new();
        for node in self.nodes() {
            match self.provider.dump_logs(node.name()).await {
                Ok(path) => dumped.push(path),
                Err(e) => warn!(node = %node.name(), error = %e, "Could not dump logs"),
            }
        }
        dumped
    }

    /// Removes every resource of the namespace.
    pub async fn stop(&self) -> Result<()> {
        info!(namespace = %self.namespace(), "Stopping network");
        self.provider.destroy_namespace().await
    }

    /// Returns the serializable summary.
    pub fn summary(&self) -> NetworkSummary {
        let summarize = |nodes: &[Arc<NetworkNode>]| -> Vec<NodeSummary> {
            nodes.iter().map(|n| NodeSummary::from(n.as_ref())).collect()
        };
        NetworkSummary {
            namespace: self.namespace().to_string(),
            tmp_dir: self.tmp_dir().to_path_buf(),
            relay_chain: self.relay_chain.clone(),
            chain_id: self.chain_id.clone(),
            started_at: self.started_at,
            relay: summarize(&self.relay),
            parachains: self.paras.iter().map(|(id, nodes)| (*id, summarize(nodes))).collect(),
            companions: summarize(&self.companions),
        }
    }

    /// Writes the summary to `<tmp>/zombie.json`.
    pub async fn write_summary(&self) -> Result<PathBuf> {
        let path = self.tmp_dir().join(SUMMARY_FILE);
        let data = serde_json::to_string_pretty(&self.summary())?;
        tokio::fs::write(&path, data).await?;
        info!(path = %path.display(), "Wrote network summary");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::HttpMetricsSource;
    use crate::node::NodeClients;
    use crate::provider::fake::FakeProvider;
    use crate::rpc::tests::FakeChain;
    use crate::topology::Ports;

    fn handle(provider: &SharedProvider, chain: &Arc<FakeChain>, name: &str, group: Option<&str>) -> NetworkNode {
        NetworkNode::new(
            name,
            Ports::default(),
            NodeUris {
                ws_uri: format!("ws://127.0.0.1:9944/{name}"),
                prometheus_uri: "http://127.0.0.1:9615/metrics".to_string(),
                multi_address: format!("/ip4/10.0.0.1/tcp/30333/ws/p2p/{name}"),
            },
            Arc::clone(provider),
            NodeClients {
                rpc: Arc::new(Arc::clone(chain)),
                metrics: Arc::new(HttpMetricsSource::default()),
            },
        )
        .with_group(group.map(str::to_string))
    }

    fn network(dir: &Path) -> (Network, Arc<FakeProvider>, Arc<FakeChain>) {
        let fake = Arc::new(FakeProvider::new(dir));
        let provider: SharedProvider = fake.clone();
        let chain = Arc::new(FakeChain::default());
        let mut net = Network::new(Arc::clone(&provider), "rococo-local");
        net.add_relay_node(handle(&provider, &chain, "alice", None));
        net.add_relay_node(handle(&provider, &chain, "val-0", Some("val")));
        net.add_relay_node(handle(&provider, &chain, "val-1", Some("val")));
        net.add_collator(2000, handle(&provider, &chain, "collator", None).with_para_id(Some(2000)));
        (net, fake, chain)
    }

    #[test]
    fn test_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let (net, _, _) = network(dir.path());

        assert_eq!(net.get_node_by_name("collator").unwrap().para_id(), Some(2000));
        assert!(net.get_node_by_name("bob").unwrap_err().is_not_found());
        assert_eq!(net.get_nodes("val").unwrap().len(), 2);
        assert_eq!(net.get_nodes("alice").unwrap().len(), 1);
        assert_eq!(net.nodes().count(), 4);
        assert_eq!(net.collators(2000).len(), 1);
        assert!(net.collators(3000).is_empty());
        assert_eq!(net.para_ids().collect::<Vec<_>>(), vec![2000]);
    }

    #[test]
    fn test_reference() {
        let dir = tempfile::tempdir().unwrap();
        let (net, _, _) = network(dir.path());
        assert_eq!(
            net.reference("alice", "multiAddress").as_deref(),
            Some("/ip4/10.0.0.1/tcp/30333/ws/p2p/alice")
        );
        assert_eq!(net.reference("alice", "wsUri").as_deref(), Some("ws://127.0.0.1:9944/alice"));
        assert_eq!(net.reference("alice", "color"), None);
        assert_eq!(net.reference("bob", "name"), None);
    }

    #[tokio::test]
    async fn test_summary_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let (mut net, fake, chain) = network(dir.path());
        net.set_chain_id("rococo_local_testnet");
        net.mark_launched();
        assert!(net.is_launched());

        let path = net.write_summary().await.unwrap();
        let written: serde_json::Value = serde_json::from_str(&tokio::fs::read_to_string(path).await.unwrap()).unwrap();
        assert_eq!(written["namespace"], "zombie-test");
        assert_eq!(written["chainId"], "rococo_local_testnet");
        assert_eq!(written["relay"][0]["wsUri"], "ws://127.0.0.1:9944/alice");
        assert_eq!(written["parachains"]["2000"][0]["name"], "collator");

        assert!(net.node_is_up("alice", Duration::from_secs(1)).await.unwrap());
        assert_eq!(net.dump_logs().await.len(), 4);

        net.stop().await.unwrap();
        assert!(fake.is_destroyed());
        chain.set_down();
        assert!(!net.node_is_up("alice", Duration::from_millis(500)).await.unwrap());
    }
}
