//! The compiled launch plan.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{DEFAULT_GLOBAL_TIMEOUT_SECS, DEFAULT_NODE_SPAWN_TIMEOUT_SECS};
use crate::provider::ProviderKind;

use super::node::Node;
use super::resources::{ContainerImage, ImagePullPolicy};

/// Genesis key shape of a chain, picked from its name once at compile time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainFlavor {
    /// Plain session keys.
    #[default]
    Generic,
    /// Ethereum style accounts mapped to session keys (moonbeam family).
    AddressMapping,
    /// ed25519 aura keys (asset hub family).
    AlternateAura,
}

impl ChainFlavor {
    /// Resolves the flavor of a chain by name.
    pub fn from_chain_name(chain: &str) -> Self {
        let chain = chain.to_lowercase();
        if ["moonbase", "moonriver", "moonbeam"].iter().any(|c| chain.contains(c)) {
            Self::AddressMapping
        } else if chain.contains("statemint") || chain.contains("asset-hub-polkadot") {
            Self::AlternateAura
        } else {
            Self::Generic
        }
    }
}

/// Where a chain spec comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainSpecSource {
    /// A file on the local machine.
    Path(PathBuf),
    /// A command printing the plain spec on stdout.
    Command(String),
}

/// Where a parachain genesis artifact comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenesisArtifact {
    /// A file on the local machine.
    File(PathBuf),
    /// A command writing the artifact, run in a helper node.
    Generate(String),
}

/// Global settings of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Launch timeout in seconds.
    pub timeout_secs: u64,
    /// Per-node readiness budget in seconds.
    pub node_spawn_timeout_secs: u64,
    /// Execution backend.
    pub provider: ProviderKind,
    /// Number of nodes spawned in parallel.
    pub spawn_concurrency: usize,
    /// Whether a dedicated bootnode is spawned.
    pub bootnode: bool,
    /// Whether nodes expose prometheus.
    pub prometheus: bool,
    /// Telemetry endpoint handed to every node.
    pub telemetry_url: Option<String>,
    /// Jaeger agent relay nodes report to, set only when tracing is enabled.
    pub jaeger_agent: Option<String>,
    /// Whether the block time monitor companion is spawned.
    pub polkadot_introspector: bool,
    /// Address nodes are reached on, when the backend does not report one.
    pub local_ip: Option<String>,
    /// Pull policy for node images.
    pub image_pull_policy: ImagePullPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_GLOBAL_TIMEOUT_SECS,
            node_spawn_timeout_secs: DEFAULT_NODE_SPAWN_TIMEOUT_SECS,
            provider: ProviderKind::default(),
            spawn_concurrency: 1,
            bootnode: false,
            prometheus: true,
            telemetry_url: None,
            jaeger_agent: None,
            polkadot_introspector: false,
            local_ip: None,
            image_pull_policy: ImagePullPolicy::default(),
        }
    }
}

/// The relay chain section of the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayChain {
    /// Chain name.
    pub chain: String,
    /// Default image.
    pub image: ContainerImage,
    /// Default binary.
    pub command: String,
    /// Chain spec source.
    pub chain_spec: ChainSpecSource,
    /// Genesis key shape.
    pub flavor: ChainFlavor,
    /// Patch merged into the runtime genesis config.
    pub genesis_overrides: Option<Value>,
    /// Number of staking nominators to generate.
    pub random_nominators_count: usize,
    /// Upper bound on targets per nominator.
    pub max_nominations: usize,
    /// Nodes still waiting to be spawned, in order.
    pub nodes: Vec<Node>,
}

impl RelayChain {
    /// Dequeues the next node to spawn.
    pub fn take_first_node(&mut self) -> Option<Node> {
        if self.nodes.is_empty() {
            None
        } else {
            Some(self.nodes.remove(0))
        }
    }
}

/// A parachain of the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parachain {
    /// Parachain id.
    pub id: u32,
    /// Chain name, for parachains with their own chain spec.
    pub chain: Option<String>,
    /// Whether the parachain is registered in the relay genesis.
    pub add_to_genesis: bool,
    /// Whether the collators embed a relay node.
    pub cumulus_based: bool,
    /// Genesis head source.
    pub genesis_state: GenesisArtifact,
    /// Validation code source.
    pub genesis_wasm: GenesisArtifact,
    /// Chain spec source, cumulus parachains only.
    pub chain_spec: Option<ChainSpecSource>,
    /// Genesis key shape.
    pub flavor: ChainFlavor,
    /// Patch merged into the parachain's genesis config.
    pub genesis_overrides: Option<Value>,
    /// Collators, in spawn order.
    pub collators: Vec<Node>,
}

impl Parachain {
    /// Chain name carried by the collators: `<para chain>_<relay chain>`.
    pub fn collator_chain(chain: Option<&str>, relay_chain: &str) -> String {
        match chain {
            Some(chain) => format!("{chain}_{relay_chain}"),
            None => relay_chain.to_string(),
        }
    }

    /// Name of the parachain's chain spec file without extension.
    pub fn spec_name(&self, relay_chain: &str) -> String {
        format!("{}-{}", Self::collator_chain(self.chain.as_deref(), relay_chain), self.id)
    }
}

/// A preopened HRMP channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HrmpChannel {
    /// Sending parachain.
    pub sender: u32,
    /// Receiving parachain.
    pub recipient: u32,
    /// Maximum number of queued messages.
    pub max_capacity: u32,
    /// Maximum message size in bytes.
    pub max_message_size: u32,
}

/// A fully resolved network, ready to be spawned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputedNetwork {
    /// Global settings.
    pub settings: Settings,
    /// Relay chain.
    pub relay: RelayChain,
    /// Parachains.
    pub parachains: Vec<Parachain>,
    /// Preopened HRMP channels.
    pub hrmp_channels: Vec<HrmpChannel>,
    /// Directory the network description was loaded from.
    pub config_base: PathBuf,
}

impl ComputedNetwork {
    /// Relay nodes followed by every collator.
    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> {
        self.relay
            .nodes
            .iter()
            .chain(self.parachains.iter().flat_map(|p| p.collators.iter()))
    }

    /// Returns true if any command refers to another node of the network.
    pub fn uses_network_references(&self) -> bool {
        self.all_nodes().any(|n| {
            let in_args = n.args.iter().any(|a| a.contains(crate::provider::NETWORK_REF_PREFIX));
            let in_cmd = n
                .command_with_args
                .as_deref()
                .is_some_and(|c| c.contains(crate::provider::NETWORK_REF_PREFIX));
            in_args || in_cmd
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flavor_from_chain_name() {
        assert_eq!(ChainFlavor::from_chain_name("moonbase-local"), ChainFlavor::AddressMapping);
        assert_eq!(ChainFlavor::from_chain_name("Moonriver"), ChainFlavor::AddressMapping);
        assert_eq!(ChainFlavor::from_chain_name("statemint-dev"), ChainFlavor::AlternateAura);
        assert_eq!(ChainFlavor::from_chain_name("asset-hub-polkadot-local"), ChainFlavor::AlternateAura);
        assert_eq!(ChainFlavor::from_chain_name("rococo-local"), ChainFlavor::Generic);
    }

    #[test]
    fn test_spec_name() {
        let para = Parachain {
            id: 100,
            chain: None,
            add_to_genesis: true,
            cumulus_based: true,
            genesis_state: GenesisArtifact::Generate("gen".into()),
            genesis_wasm: GenesisArtifact::Generate("gen".into()),
            chain_spec: None,
            flavor: ChainFlavor::Generic,
            genesis_overrides: None,
            collators: Vec::new(),
        };
        assert_eq!(para.spec_name("rococo-local"), "rococo-local-100");
        let named = Parachain {
            chain: Some("asset-hub".into()),
            ..para
        };
        assert_eq!(named.spec_name("rococo-local"), "asset-hub_rococo-local-100");
    }
}
