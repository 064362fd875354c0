//! Declarative network description and its compiler.
//!
//! A [`NetworkConfig`] is what users write (TOML or JSON). It is turned into a
//! [`ComputedNetwork`](crate::topology::ComputedNetwork) by [`compile`], which
//! expands groups, allocates unique names, resolves override files and
//! generates each node's accounts.

mod compiler;
mod context;

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{DEFAULT_GLOBAL_TIMEOUT_SECS, DEFAULT_MAX_NOMINATIONS, DEFAULT_NODE_SPAWN_TIMEOUT_SECS};
use crate::error::{OrchestratorError, Result};
use crate::provider::ProviderKind;
use crate::topology::{ContainerImage, ImagePullPolicy, Resources};

pub use compiler::{compile, sanitize_args};
pub use context::CompilationContext;

/// A user authored network description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Global settings.
    pub settings: SettingsConfig,
    /// Relay chain section.
    pub relaychain: RelayChainConfig,
    /// Parachains.
    pub parachains: Vec<ParachainConfig>,
    /// HRMP channels opened in genesis.
    pub hrmp_channels: Vec<HrmpChannelConfig>,
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Launch timeout in seconds.
    pub timeout: u64,
    /// Per-node readiness budget in seconds.
    pub node_spawn_timeout: u64,
    /// Execution backend.
    pub provider: ProviderKind,
    /// Number of nodes spawned in parallel.
    pub spawn_concurrency: usize,
    /// Spawns a dedicated bootnode.
    pub bootnode: bool,
    /// Exposes prometheus on every node.
    pub prometheus: bool,
    /// Enables telemetry.
    pub telemetry: bool,
    /// Telemetry endpoint, used when telemetry is enabled.
    pub telemetry_url: Option<String>,
    /// Requests tracing collection.
    pub enable_tracing: bool,
    /// Jaeger agent (`host:port`) nodes send spans to when tracing is enabled.
    pub jaeger_agent: Option<String>,
    /// Runs the block time monitor next to the network (container providers only).
    pub polkadot_introspector: bool,
    /// Address nodes are reached on.
    pub local_ip: Option<String>,
    /// Image pull policy.
    pub image_pull_policy: ImagePullPolicy,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_GLOBAL_TIMEOUT_SECS,
            node_spawn_timeout: DEFAULT_NODE_SPAWN_TIMEOUT_SECS,
            provider: ProviderKind::default(),
            spawn_concurrency: 1,
            bootnode: false,
            prometheus: true,
            telemetry: false,
            telemetry_url: None,
            enable_tracing: false,
            jaeger_agent: None,
            polkadot_introspector: false,
            local_ip: None,
            image_pull_policy: ImagePullPolicy::default(),
        }
    }
}

/// Relay chain section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayChainConfig {
    /// Chain name.
    pub chain: Option<String>,
    /// Image used by nodes without one.
    pub default_image: Option<String>,
    /// Binary used by nodes without one.
    pub default_command: Option<String>,
    /// Arguments added to every node.
    pub default_args: Vec<String>,
    /// Resources of nodes without their own.
    pub default_resources: Option<Resources>,
    /// Overrides added to every node.
    pub default_overrides: Vec<OverrideConfig>,
    /// Metric prefix of nodes without their own.
    pub default_prometheus_prefix: Option<String>,
    /// Existing plain or raw chain spec.
    pub chain_spec_path: Option<String>,
    /// Command generating the plain chain spec.
    pub chain_spec_command: Option<String>,
    /// Patch merged into the runtime genesis config.
    pub genesis: Option<Value>,
    /// Number of staking nominators to generate.
    pub random_nominators_count: usize,
    /// Upper bound on targets per nominator.
    pub max_nominations: usize,
    /// Individually declared nodes.
    pub nodes: Vec<NodeConfig>,
    /// Node groups.
    pub node_groups: Vec<NodeGroupConfig>,
}

impl Default for RelayChainConfig {
    fn default() -> Self {
        Self {
            chain: None,
            default_image: None,
            default_command: None,
            default_args: Vec::new(),
            default_resources: None,
            default_overrides: Vec::new(),
            default_prometheus_prefix: None,
            chain_spec_path: None,
            chain_spec_command: None,
            genesis: None,
            random_nominators_count: 0,
            max_nominations: DEFAULT_MAX_NOMINATIONS,
            nodes: Vec::new(),
            node_groups: Vec::new(),
        }
    }
}

/// One node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name.
    pub name: String,
    /// Image.
    pub image: Option<String>,
    /// Binary.
    pub command: Option<String>,
    /// Complete command line, replaces generated arguments.
    pub command_with_args: Option<String>,
    /// Extra arguments.
    pub args: Vec<String>,
    /// Environment variables.
    pub env: Vec<EnvVar>,
    /// Whether the node validates; defaults to true.
    pub validator: Option<bool>,
    /// Added to staking invulnerables.
    pub invulnerable: bool,
    /// Genesis balance.
    pub balance: Option<u128>,
    /// Files injected into the node.
    pub overrides: Vec<OverrideConfig>,
    /// Resources.
    pub resources: Option<Resources>,
    /// Publishes the node in the chain spec bootnodes.
    pub add_to_bootnodes: bool,
    /// Metric prefix.
    pub prometheus_prefix: Option<String>,
    /// Keystore key types.
    pub keystore_key_types: Vec<String>,
    /// Fixed p2p port.
    pub p2p_port: Option<u16>,
    /// Fixed rpc port.
    pub rpc_port: Option<u16>,
    /// Fixed prometheus port.
    pub prometheus_port: Option<u16>,
}

/// A group of identical nodes named `<name>-<index>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeGroupConfig {
    /// Group name.
    pub name: String,
    /// Number of nodes.
    pub count: usize,
    /// Image.
    pub image: Option<String>,
    /// Binary.
    pub command: Option<String>,
    /// Extra arguments.
    pub args: Vec<String>,
    /// Environment variables.
    pub env: Vec<EnvVar>,
    /// Files injected into every node.
    pub overrides: Vec<OverrideConfig>,
    /// Resources.
    pub resources: Option<Resources>,
    /// Metric prefix.
    pub prometheus_prefix: Option<String>,
}

impl NodeGroupConfig {
    /// Expands the group into its nodes; group members always validate.
    pub fn expand(&self) -> Vec<NodeConfig> {
        (0..self.count)
            .map(|i| NodeConfig {
                name: format!("{}-{i}", self.name),
                image: self.image.clone(),
                command: self.command.clone(),
                args: self.args.clone(),
                env: self.env.clone(),
                validator: Some(true),
                overrides: self.overrides.clone(),
                resources: self.resources.clone(),
                prometheus_prefix: self.prometheus_prefix.clone(),
                ..Default::default()
            })
            .collect()
    }
}

/// An environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Name.
    pub name: String,
    /// Value.
    pub value: String,
}

/// A file injected into a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideConfig {
    /// Absolute path, or path relative to the config file.
    pub local_path: String,
    /// File name inside the node's config directory.
    pub remote_name: String,
}

/// A parachain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParachainConfig {
    /// Parachain id.
    pub id: u32,
    /// Chain name.
    pub chain: Option<String>,
    /// Registers the parachain in the relay genesis.
    pub add_to_genesis: bool,
    /// Forces cumulus (or non-cumulus) collators.
    pub cumulus_based: Option<bool>,
    /// Existing genesis head.
    pub genesis_state_path: Option<String>,
    /// Command printing the genesis head.
    pub genesis_state_generator: Option<String>,
    /// Existing validation code.
    pub genesis_wasm_path: Option<String>,
    /// Command printing the validation code.
    pub genesis_wasm_generator: Option<String>,
    /// Existing parachain chain spec.
    pub chain_spec_path: Option<String>,
    /// Patch merged into the parachain's genesis config.
    pub genesis: Option<Value>,
    /// Single collator shorthand.
    pub collator: Option<NodeConfig>,
    /// Collators.
    pub collators: Vec<NodeConfig>,
    /// Collator groups.
    pub collator_groups: Vec<NodeGroupConfig>,
}

impl Default for ParachainConfig {
    fn default() -> Self {
        Self {
            id: 0,
            chain: None,
            add_to_genesis: true,
            cumulus_based: None,
            genesis_state_path: None,
            genesis_state_generator: None,
            genesis_wasm_path: None,
            genesis_wasm_generator: None,
            chain_spec_path: None,
            genesis: None,
            collator: None,
            collators: Vec::new(),
            collator_groups: Vec::new(),
        }
    }
}

impl ParachainConfig {
    /// Every collator declaration, groups expanded, in declaration order.
    pub fn all_collators(&self) -> Vec<NodeConfig> {
        self.collator
            .iter()
            .chain(self.collators.iter())
            .cloned()
            .chain(self.collator_groups.iter().flat_map(NodeGroupConfig::expand))
            .collect()
    }
}

/// An HRMP channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HrmpChannelConfig {
    /// Sending parachain.
    pub sender: u32,
    /// Receiving parachain.
    pub recipient: u32,
    /// Maximum number of queued messages.
    pub max_capacity: u32,
    /// Maximum message size in bytes.
    pub max_message_size: u32,
}

impl NetworkConfig {
    /// Loads a description from a `.toml` or `.json` file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            OrchestratorError::config_validation(format!("can not read {}: {e}", path.display()))
        })?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| OrchestratorError::config_validation(format!("{}: {e}", path.display())))?,
            other => {
                return Err(OrchestratorError::config_validation(format!(
                    "unsupported network file extension {:?}, expected toml or json",
                    other.unwrap_or_default()
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the description for errors that need no file system access.
    pub fn validate(&self) -> Result<()> {
        if self.relaychain.nodes.is_empty() && self.relaychain.node_groups.iter().all(|g| g.count == 0) {
            return Err(OrchestratorError::config_validation(
                "the relay chain needs at least one node",
            ));
        }
        if self.settings.spawn_concurrency == 0 {
            return Err(OrchestratorError::config_validation("spawn_concurrency must be at least 1"));
        }

        let mut images: Vec<String> = self.relaychain.default_image.iter().cloned().collect();
        images.extend(self.relaychain.nodes.iter().filter_map(|n| n.image.clone()));
        images.extend(self.relaychain.node_groups.iter().filter_map(|g| g.image.clone()));
        for para in &self.parachains {
            images.extend(para.all_collators().into_iter().filter_map(|c| c.image));
        }
        for image in images {
            ContainerImage::new(image).validate()?;
        }

        for node in self.relaychain.nodes.iter() {
            if node.name.is_empty() {
                return Err(OrchestratorError::config_validation("every relay chain node needs a name"));
            }
        }

        let mut para_ids = std::collections::HashSet::new();
        for para in &self.parachains {
            if !para_ids.insert(para.id) {
                return Err(OrchestratorError::config_validation(format!(
                    "parachain id {} declared twice",
                    para.id
                )));
            }
            if para.all_collators().is_empty() {
                return Err(OrchestratorError::config_validation(format!(
                    "no collator defined for parachain {}",
                    para.id
                )));
            }
        }

        for channel in &self.hrmp_channels {
            for id in [channel.sender, channel.recipient] {
                if !para_ids.contains(&id) {
                    return Err(OrchestratorError::config_validation(format!(
                        "hrmp channel refers to unknown parachain {id}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOML_NETWORK: &str = r#"
[settings]
provider = "native"
timeout = 600

[relaychain]
chain = "rococo-local"
default_command = "polkadot"

[[relaychain.nodes]]
name = "alice"

[[relaychain.nodes]]
name = "bob"
validator = false

[[relaychain.node_groups]]
name = "extra"
count = 2

[[parachains]]
id = 100

[parachains.collator]
name = "collator"
command = "polkadot-parachain"

[[hrmp_channels]]
sender = 100
recipient = 100
max_capacity = 8
max_message_size = 512
"#;

    #[tokio::test]
    async fn test_load_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.toml");
        tokio::fs::write(&path, TOML_NETWORK).await.unwrap();

        let config = NetworkConfig::load(&path).await.unwrap();
        assert_eq!(config.settings.provider, ProviderKind::Native);
        assert_eq!(config.settings.timeout, 600);
        assert_eq!(config.settings.spawn_concurrency, 1);
        assert_eq!(config.relaychain.nodes.len(), 2);
        assert_eq!(config.relaychain.nodes[1].validator, Some(false));
        assert_eq!(config.relaychain.max_nominations, DEFAULT_MAX_NOMINATIONS);
        assert!(config.parachains[0].add_to_genesis);
        assert_eq!(config.parachains[0].all_collators().len(), 1);
    }

    #[tokio::test]
    async fn test_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.json");
        let json = r#"{"relaychain":{"nodes":[{"name":"alice","balance":123456789012345678901234}]}}"#;
        tokio::fs::write(&path, json).await.unwrap();

        let config = NetworkConfig::load(&path).await.unwrap();
        assert_eq!(config.relaychain.nodes[0].balance, Some(123456789012345678901234));
    }

    #[tokio::test]
    async fn test_load_rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network.yaml");
        tokio::fs::write(&path, "relaychain: {}").await.unwrap();
        let err = NetworkConfig::load(&path).await.unwrap_err();
        assert!(err.is_pre_spawn());
    }

    #[test]
    fn test_validate_requires_relay_nodes() {
        let err = NetworkConfig::default().validate().unwrap_err();
        assert!(matches!(err, OrchestratorError::ConfigValidation(_)));
    }

    #[test]
    fn test_validate_requires_collators() {
        let mut config = NetworkConfig::default();
        config.relaychain.nodes.push(NodeConfig {
            name: "alice".into(),
            ..Default::default()
        });
        config.parachains.push(ParachainConfig {
            id: 100,
            ..Default::default()
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("no collator defined for parachain 100"));
    }

    #[test]
    fn test_group_expansion() {
        let group = NodeGroupConfig {
            name: "val".into(),
            count: 3,
            ..Default::default()
        };
        let nodes = group.expand();
        let names: Vec<_> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["val-0", "val-1", "val-2"]);
        assert!(nodes.iter().all(|n| n.validator == Some(true)));
    }
}
