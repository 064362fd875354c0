//! Resolved node definitions.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::{
    DEFAULT_BALANCE, DEFAULT_CHAIN, DEFAULT_COMMAND, DEFAULT_ENV, DEFAULT_IMAGE, DEFAULT_PROMETHEUS_PREFIX,
    P2P_PORT, PROMETHEUS_PORT, RPC_WS_PORT,
};
use crate::error::{OrchestratorError, Result};
use crate::keys::NodeAccounts;

use super::resources::{ContainerImage, Resources};

/// Role of a node in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// Short-lived helper that runs one command and exits.
    Temp,
    /// Relay chain validator or full node.
    Node,
    /// Dedicated relay chain bootnode.
    BootNode,
    /// Collator of a parachain that does not embed a relay node.
    Collator,
    /// Cumulus based collator, embeds a relay chain full node.
    CumulusCollator,
    /// Service watching the network from the side.
    Companion,
}

impl NodeRole {
    /// Returns the label value of this role.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Temp => "temp",
            Self::Node => "node",
            Self::BootNode => "bootnode",
            Self::Collator => "collator",
            Self::CumulusCollator => "cumulus-collator",
            Self::Companion => "companion",
        }
    }

    /// Returns true for both collator flavours.
    pub fn is_collator(&self) -> bool {
        matches!(self, Self::Collator | Self::CumulusCollator)
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Ports a node listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ports {
    /// libp2p port.
    pub p2p: u16,
    /// RPC port (websocket and http share it).
    pub rpc: u16,
    /// Prometheus port.
    pub prometheus: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            p2p: P2P_PORT,
            rpc: RPC_WS_PORT,
            prometheus: PROMETHEUS_PORT,
        }
    }
}

impl Ports {
    /// Reserves three free local ports, for nodes sharing the host network.
    pub fn pick_unused() -> Result<Self> {
        Ok(Self {
            p2p: pick_port()?,
            rpc: pick_port()?,
            prometheus: pick_port()?,
        })
    }
}

/// Returns a free local TCP port.
pub fn pick_port() -> Result<u16> {
    portpicker::pick_unused_port()
        .ok_or_else(|| OrchestratorError::config_validation("no free local port available"))
}

/// A local file injected verbatim into a node's config directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Override {
    /// Resolved local path.
    pub local_path: PathBuf,
    /// File name inside the node's config directory.
    pub remote_name: String,
}

/// A fully resolved node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Globally unique name.
    pub name: String,

    /// Node role.
    pub role: NodeRole,

    /// Container image.
    pub image: ContainerImage,

    /// Binary to run.
    pub command: String,

    /// Complete shell command, bypasses argument generation.
    pub full_command: Option<String>,

    /// User supplied command line, bypasses argument generation.
    pub command_with_args: Option<String>,

    /// Chain name, used to locate the chain spec.
    pub chain: String,

    /// Extra arguments, already sanitized.
    pub args: Vec<String>,

    /// Environment variables.
    pub env: BTreeMap<String, String>,

    /// Whether the node takes part in consensus.
    pub validator: bool,

    /// Whether the node is added to staking invulnerables.
    pub invulnerable: bool,

    /// Genesis balance of the node's stash.
    pub balance: u128,

    /// Bootnode multiaddresses.
    pub bootnodes: Vec<String>,

    /// Hex encoded libp2p secret key.
    pub key: String,

    /// Seed the node's accounts are derived from.
    pub seed: String,

    /// Generated accounts, absent for helper nodes.
    pub accounts: Option<NodeAccounts>,

    /// Files copied into the node.
    pub overrides: Vec<Override>,

    /// Resource requests and limits.
    pub resources: Option<Resources>,

    /// Listening ports.
    pub ports: Ports,

    /// Group the node was expanded from.
    pub group: Option<String>,

    /// Parachain the collator belongs to.
    pub para_id: Option<u32>,

    /// Whether prometheus is exposed.
    pub prometheus: bool,

    /// Telemetry endpoint, telemetry is disabled when unset.
    pub telemetry_url: Option<String>,

    /// Jaeger agent the node sends spans to.
    pub jaeger_agent: Option<String>,

    /// Metric name prefix.
    pub prometheus_prefix: String,

    /// Whether the node's address is published in the chain spec.
    pub add_to_bootnodes: bool,

    /// Keystore key types to generate instead of the defaults.
    pub keystore_key_types: Vec<String>,
}

impl Node {
    /// Creates a new node builder.
    pub fn builder(name: impl Into<String>, role: NodeRole) -> NodeBuilder {
        NodeBuilder::new(name, role)
    }

    /// Role label recorded on the node's resources.
    pub fn role_label(&self) -> &'static str {
        match self.role {
            NodeRole::Node if self.validator => "authority",
            NodeRole::Node => "full-node",
            other => other.name(),
        }
    }

    /// Returns the sr25519 address, if accounts were generated.
    pub fn sr_address(&self) -> Option<&str> {
        self.accounts.as_ref().map(|a| a.sr_account.address.as_str())
    }
}

/// Hex encoded sha256 of the node name, used as its libp2p secret key.
pub fn node_key(name: &str) -> String {
    hex::encode(Sha256::digest(name.as_bytes()))
}

/// Derivation seed for a node name: `//Alice` for `alice`.
pub fn seed_for(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => format!("//{}{}", first.to_uppercase(), chars.as_str()),
        None => "//".to_string(),
    }
}

/// Builder for [`Node`].
#[derive(Debug)]
pub struct NodeBuilder {
    node: Node,
}

impl NodeBuilder {
    /// Creates a new builder with default values.
    pub fn new(name: impl Into<String>, role: NodeRole) -> Self {
        let name = name.into();
        let env = DEFAULT_ENV
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            node: Node {
                key: node_key(&name),
                seed: seed_for(&name),
                name,
                role,
                image: ContainerImage::new(DEFAULT_IMAGE),
                command: DEFAULT_COMMAND.to_string(),
                full_command: None,
                command_with_args: None,
                chain: DEFAULT_CHAIN.to_string(),
                args: Vec::new(),
                env,
                validator: false,
                invulnerable: false,
                balance: DEFAULT_BALANCE,
                bootnodes: Vec::new(),
                accounts: None,
                overrides: Vec::new(),
                resources: None,
                ports: Ports::default(),
                group: None,
                para_id: None,
                prometheus: true,
                telemetry_url: None,
                jaeger_agent: None,
                prometheus_prefix: DEFAULT_PROMETHEUS_PREFIX.to_string(),
                add_to_bootnodes: false,
                keystore_key_types: Vec::new(),
            },
        }
    }

    /// Sets the container image.
    pub fn image(mut self, image: impl Into<ContainerImage>) -> Self {
        self.node.image = image.into();
        self
    }

    /// Sets the binary.
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.node.command = command.into();
        self
    }

    /// Sets a complete shell command.
    pub fn full_command(mut self, command: impl Into<String>) -> Self {
        self.node.full_command = Some(command.into());
        self
    }

    /// Sets a user command line.
    pub fn command_with_args(mut self, command: Option<String>) -> Self {
        self.node.command_with_args = command;
        self
    }

    /// Sets the chain name.
    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.node.chain = chain.into();
        self
    }

    /// Sets the extra arguments.
    pub fn args(mut self, args: Vec<String>) -> Self {
        self.node.args = args;
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.node.env.insert(key.into(), value.into());
        self
    }

    /// Marks the node as a validator.
    pub fn validator(mut self, validator: bool) -> Self {
        self.node.validator = validator;
        self
    }

    /// Marks the node as invulnerable.
    pub fn invulnerable(mut self, invulnerable: bool) -> Self {
        self.node.invulnerable = invulnerable;
        self
    }

    /// Sets the genesis balance.
    pub fn balance(mut self, balance: u128) -> Self {
        self.node.balance = balance;
        self
    }

    /// Sets the bootnodes.
    pub fn bootnodes(mut self, bootnodes: Vec<String>) -> Self {
        self.node.bootnodes = bootnodes;
        self
    }

    /// Sets the generated accounts.
    pub fn accounts(mut self, accounts: NodeAccounts) -> Self {
        self.node.accounts = Some(accounts);
        self
    }

    /// Adds a file override.
    pub fn with_override(mut self, file: Override) -> Self {
        self.node.overrides.push(file);
        self
    }

    /// Sets the resources.
    pub fn resources(mut self, resources: Option<Resources>) -> Self {
        self.node.resources = resources;
        self
    }

    /// Sets the ports.
    pub fn ports(mut self, ports: Ports) -> Self {
        self.node.ports = ports;
        self
    }

    /// Sets the group name.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.node.group = Some(group.into());
        self
    }

    /// Sets the parachain id.
    pub fn para_id(mut self, para_id: u32) -> Self {
        self.node.para_id = Some(para_id);
        self
    }

    /// Enables or disables prometheus.
    pub fn prometheus(mut self, enabled: bool) -> Self {
        self.node.prometheus = enabled;
        self
    }

    /// Sets the telemetry endpoint.
    pub fn telemetry_url(mut self, url: Option<String>) -> Self {
        self.node.telemetry_url = url;
        self
    }

    /// Sets the Jaeger agent.
    pub fn jaeger_agent(mut self, agent: Option<String>) -> Self {
        self.node.jaeger_agent = agent;
        self
    }

    /// Sets the metric prefix.
    pub fn prometheus_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.node.prometheus_prefix = prefix.into();
        self
    }

    /// Publishes the node in the chain spec bootnodes.
    pub fn add_to_bootnodes(mut self, add: bool) -> Self {
        self.node.add_to_bootnodes = add;
        self
    }

    /// Sets the keystore key types.
    pub fn keystore_key_types(mut self, types: Vec<String>) -> Self {
        self.node.keystore_key_types = types;
        self
    }

    /// Builds the node.
    pub fn build(self) -> Node {
        self.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_key_is_sha256_of_name() {
        assert_eq!(
            node_key("alice"),
            "2bd806c97f0e00af1a1fc3328fa763a9269723c8db8fac4f93af71db186d6e90"
        );
        assert_eq!(node_key("alice").len(), 64);
    }

    #[test]
    fn test_seed_for() {
        assert_eq!(seed_for("alice"), "//Alice");
        assert_eq!(seed_for("collator-1"), "//Collator-1");
    }

    #[test]
    fn test_builder_defaults() {
        let node = Node::builder("bob", NodeRole::Node).validator(true).build();
        assert_eq!(node.command, DEFAULT_COMMAND);
        assert_eq!(node.key, node_key("bob"));
        assert_eq!(node.seed, "//Bob");
        assert_eq!(node.ports, Ports::default());
        assert_eq!(node.env.get("RUST_BACKTRACE").map(String::as_str), Some("FULL"));
        assert_eq!(node.role_label(), "authority");
    }

    #[test]
    fn test_role_labels() {
        let full = Node::builder("charlie", NodeRole::Node).build();
        assert_eq!(full.role_label(), "full-node");
        let collator = Node::builder("col", NodeRole::CumulusCollator).build();
        assert_eq!(collator.role_label(), "cumulus-collator");
        assert!(collator.role.is_collator());
    }

    #[test]
    fn test_pick_unused_ports() {
        let ports = Ports::pick_unused().unwrap();
        assert!(ports.p2p > 0);
        assert!(ports.rpc > 0);
    }
}
