//! The spawn orchestrator.
//!
//! A launch walks a fixed sequence of [`LaunchState`]s. Any error, including
//! the global timeout firing, dumps the logs of the nodes spawned so far and
//! destroys the namespace before the error is returned.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, error, info, warn};

use crate::bootnode::bootnode_address;
use crate::chain_spec::{ChainSpecBuilder, ParachainFiles};
use crate::command::{WRAPPER_SCRIPT, WRAPPER_SCRIPT_NAME};
use crate::config::CompilationContext;
use crate::constants::{
    render_uri, INTROSPECTOR_IMAGE, INTROSPECTOR_NAME, INTROSPECTOR_PORT, LOCALHOST, METRICS_URI_PATTERN, WS_URI_PATTERN,
};
use crate::error::{OrchestratorError, Result};
use crate::genesis::{add_boot_nodes, add_parachain_to_genesis, customize_relay_spec, ChainSpec};
use crate::keys::{keystore_entries, write_keystore, KeyGenerator};
use crate::network::Network;
use crate::node::{NetworkNode, NodeClients, NodeUris};
use crate::provider::{replace_network_refs, FileTransfer, ProviderKind, SharedProvider};
use crate::topology::{ChainFlavor, ComputedNetwork, Node, NodeRole, Parachain, Ports};

/// Seed of the account signing parachain registrations.
const REGISTRAR_SEED: &str = "//Alice";

/// Steps of a launch, in order. No step is ever revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LaunchState {
    /// Nothing done yet.
    Init,
    /// The namespace exists.
    NamespaceCreated,
    /// Namespace-wide resources exist.
    StaticResourcesReady,
    /// The relay chain's plain spec is on disk.
    ChainSpecMaterialized,
    /// The plain spec carries this network's genesis. Skipped for raw specs.
    GenesisCustomized,
    /// The raw relay spec is on disk.
    RawChainSpecReady,
    /// The first relay node is ready.
    FirstRelayNodeSpawned,
    /// The first relay node's address is in the raw spec.
    BootnodeAddressKnown,
    /// Every relay node is ready.
    RemainingRelayNodesSpawned,
    /// Every parachain has its spec and genesis artifacts.
    ParachainArtifactsGenerated,
    /// Parachains outside genesis are registered and first cumulus collators are ready.
    ParachainsRegisteredOrFirstCollatorSpawned,
    /// Every collator is ready.
    RemainingCollatorsSpawned,
    /// The network is up.
    Launched,
}

impl LaunchState {
    /// Returns the state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::NamespaceCreated => "namespace-created",
            Self::StaticResourcesReady => "static-resources-ready",
            Self::ChainSpecMaterialized => "chain-spec-materialized",
            Self::GenesisCustomized => "genesis-customized",
            Self::RawChainSpecReady => "raw-chain-spec-ready",
            Self::FirstRelayNodeSpawned => "first-relay-node-spawned",
            Self::BootnodeAddressKnown => "bootnode-address-known",
            Self::RemainingRelayNodesSpawned => "remaining-relay-nodes-spawned",
            Self::ParachainArtifactsGenerated => "parachain-artifacts-generated",
            Self::ParachainsRegisteredOrFirstCollatorSpawned => "parachains-registered-or-first-collator-spawned",
            Self::RemainingCollatorsSpawned => "remaining-collators-spawned",
            Self::Launched => "launched",
        }
    }
}

impl fmt::Display for LaunchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Spawns computed networks on one provider.
pub struct Orchestrator {
    provider: SharedProvider,
    keys: Arc<dyn KeyGenerator>,
    clients: NodeClients,
}

impl Orchestrator {
    /// Creates an orchestrator.
    pub fn new(provider: SharedProvider, keys: Arc<dyn KeyGenerator>, clients: NodeClients) -> Self {
        Self { provider, keys, clients }
    }

    /// Returns the provider.
    pub fn provider(&self) -> &SharedProvider {
        &self.provider
    }

    /// Spawns `plan` and returns the running network.
    ///
    /// `ctx` must be the context `plan` was compiled with.
    ///
    /// # Errors
    ///
    /// Returns the first error hit, or `GlobalTimeout` if the network is not
    /// launched within the configured timeout. In both cases the namespace
    /// has been torn down. A plan with parachains outside genesis is refused
    /// up front when the RPC connector can not register them.
    pub async fn launch(&self, plan: ComputedNetwork, ctx: CompilationContext) -> Result<Network> {
        if !self.clients.rpc.can_register_parachains() {
            if let Some(para) = plan.parachains.iter().find(|p| !p.add_to_genesis) {
                return Err(OrchestratorError::config_validation(format!(
                    "parachain {} is not in genesis and the RPC client can not register parachains",
                    para.id
                )));
            }
        }

        let secs = plan.settings.timeout_secs;
        let mut launch = Launch {
            orchestrator: self,
            ctx,
            state: LaunchState::Init,
            network: Network::new(Arc::clone(&self.provider), plan.relay.chain.clone()),
            raw_spec: None,
            relay_flavor: plan.relay.flavor,
            para_files: HashMap::new(),
            para_chain_ids: HashMap::new(),
            para_flavors: plan.parachains.iter().map(|p| (p.id, p.flavor)).collect(),
        };
        info!(namespace = %self.provider.namespace(), provider = %self.provider.kind(), "Launching network");

        let outcome = tokio::time::timeout(Duration::from_secs(secs), launch.run(plan)).await;
        let err = match outcome {
            Ok(Ok(())) => return Ok(launch.network),
            Ok(Err(e)) => e,
            Err(_) => OrchestratorError::GlobalTimeout { secs },
        };
        launch.abort(&err).await;
        Err(err)
    }
}

/// Where a spawned node is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Relay,
    Parachain(u32),
}

/// A node ready to be handed to the provider.
struct SpawnJob {
    node: Node,
    scope: Scope,
    files: Vec<FileTransfer>,
    keystore: Option<(String, ChainFlavor)>,
}

/// State of one launch.
struct Launch<'a> {
    orchestrator: &'a Orchestrator,
    ctx: CompilationContext,
    state: LaunchState,
    network: Network,
    raw_spec: Option<ChainSpec>,
    relay_flavor: ChainFlavor,
    para_files: HashMap<u32, ParachainFiles>,
    para_chain_ids: HashMap<u32, String>,
    para_flavors: HashMap<u32, ChainFlavor>,
}

impl<'a> Launch<'a> {
    fn provider(&self) -> &'a SharedProvider {
        &self.orchestrator.provider
    }

    fn advance(&mut self, next: LaunchState) {
        debug_assert!(next > self.state, "launch can not go from {} to {next}", self.state);
        info!(from = %self.state, to = %next, "Launch state changed");
        self.state = next;
    }

    async fn run(&mut self, mut plan: ComputedNetwork) -> Result<()> {
        let provider = self.provider();
        let settings = plan.settings.clone();
        let builder = ChainSpecBuilder::new(provider.as_ref(), Duration::from_secs(settings.node_spawn_timeout_secs));
        let concurrency = if plan.uses_network_references() {
            1
        } else {
            settings.spawn_concurrency.max(1)
        };

        tokio::fs::create_dir_all(provider.tmp_dir()).await?;
        provider.validate_access().await?;
        provider.create_namespace().await?;
        self.advance(LaunchState::NamespaceCreated);

        provider.static_setup().await?;
        if provider.kind() != ProviderKind::Native {
            tokio::fs::write(self.wrapper_path(), WRAPPER_SCRIPT).await?;
        }
        self.advance(LaunchState::StaticResourcesReady);

        let plain = builder.relay_plain(&plan.relay, &mut self.ctx).await?;
        self.advance(LaunchState::ChainSpecMaterialized);

        if !plain.is_raw().await? {
            let relay_chain_id = plain.chain_id().await?;
            for para in plan.parachains.iter().filter(|p| p.add_to_genesis) {
                self.generate_parachain(&builder, para, &plan.relay.chain, &relay_chain_id).await?;
            }
            customize_relay_spec(&plain, &plan.relay, &plan.hrmp_channels, self.orchestrator.keys.as_ref(), &mut self.ctx)
                .await?;
            for para in plan.parachains.iter().filter(|p| p.add_to_genesis) {
                let (head, wasm) = self.files_of(para.id)?.read_genesis().await?;
                add_parachain_to_genesis(&plain, para.id, &head, &wasm).await?;
            }
            self.advance(LaunchState::GenesisCustomized);
        } else if plan.parachains.iter().any(|p| p.add_to_genesis) {
            warn!("Relay chain spec is raw, parachains can not be added to its genesis");
        }

        let raw = builder.relay_raw(&plan.relay, &plain, &mut self.ctx).await?;
        let chain_id = raw.chain_id().await?;
        self.network.set_chain_id(&chain_id);
        self.raw_spec = Some(raw.clone());
        self.advance(LaunchState::RawChainSpecReady);

        let first = plan
            .relay
            .take_first_node()
            .ok_or_else(|| OrchestratorError::config_validation("relay chain has no nodes"))?;
        let job = self.job(first, Scope::Relay)?;
        let handle = spawn_node(self.orchestrator, job).await?;
        self.advance(LaunchState::FirstRelayNodeSpawned);

        add_boot_nodes(&raw, &[handle.multi_address()]).await?;
        info!(bootnode = %handle.multi_address(), "Bootnode address added to chain spec");
        self.network.add_relay_node(handle);
        self.advance(LaunchState::BootnodeAddressKnown);

        let relay_nodes = std::mem::take(&mut plan.relay.nodes);
        self.spawn_pool(relay_nodes.into_iter().map(|n| (n, Scope::Relay)).collect(), concurrency)
            .await?;
        self.advance(LaunchState::RemainingRelayNodesSpawned);

        for para in &plan.parachains {
            if !self.para_files.contains_key(&para.id) {
                self.generate_parachain(&builder, para, &plan.relay.chain, &chain_id).await?;
            }
        }
        self.advance(LaunchState::ParachainArtifactsGenerated);

        let mut remaining = Vec::new();
        for mut para in std::mem::take(&mut plan.parachains) {
            if !para.add_to_genesis {
                self.register_parachain(&para).await?;
            }
            let mut collators = std::mem::take(&mut para.collators).into_iter();
            if para.cumulus_based {
                if let Some(first) = collators.next() {
                    self.spawn_first_collator(first, para.id).await?;
                }
            }
            remaining.extend(collators.map(|n| (n, Scope::Parachain(para.id))));
        }
        self.advance(LaunchState::ParachainsRegisteredOrFirstCollatorSpawned);

        self.spawn_pool(remaining, concurrency).await?;
        if settings.polkadot_introspector {
            self.spawn_introspector().await?;
        }
        self.advance(LaunchState::RemainingCollatorsSpawned);

        self.network.write_summary().await?;
        self.network.mark_launched();
        self.advance(LaunchState::Launched);
        info!(
            namespace = %self.network.namespace(),
            nodes = self.network.nodes().count(),
            "Network launched"
        );
        Ok(())
    }

    async fn generate_parachain(
        &mut self,
        builder: &ChainSpecBuilder<'_>,
        para: &Parachain,
        relay_chain: &str,
        relay_chain_id: &str,
    ) -> Result<()> {
        let files = builder.parachain(para, relay_chain, relay_chain_id, &mut self.ctx).await?;
        if let Some(spec) = &files.spec {
            self.para_chain_ids.insert(para.id, spec.chain_id().await?);
        }
        self.para_files.insert(para.id, files);
        Ok(())
    }

    fn files_of(&self, para_id: u32) -> Result<&ParachainFiles> {
        self.para_files
            .get(&para_id)
            .ok_or_else(|| OrchestratorError::genesis_schedule(format!("no genesis artifacts for parachain {para_id}")))
    }

    async fn register_parachain(&self, para: &Parachain) -> Result<()> {
        let (head, wasm) = self.files_of(para.id)?.read_genesis().await?;
        let relay = self
            .network
            .relay_nodes()
            .first()
            .ok_or_else(|| OrchestratorError::rpc("no relay node to register parachains with"))?;
        relay.rpc().await?.register_parachain(para.id, &head, &wasm, REGISTRAR_SEED).await?;
        info!(para_id = para.id, "Registered parachain");
        Ok(())
    }

    async fn spawn_first_collator(&mut self, node: Node, para_id: u32) -> Result<()> {
        let node = self.resolve_refs(node)?;
        let job = self.job(node, Scope::Parachain(para_id))?;
        let handle = spawn_node(self.orchestrator, job).await?;
        if let Some(spec) = self.para_files.get(&para_id).and_then(|f| f.spec.as_ref()) {
            add_boot_nodes(spec, &[handle.multi_address()]).await?;
        }
        self.network.add_collator(para_id, handle);
        Ok(())
    }

    /// Spawns `nodes` at most `concurrency` at a time, in submission order.
    async fn spawn_pool(&mut self, nodes: Vec<(Node, Scope)>, concurrency: usize) -> Result<()> {
        let orchestrator = self.orchestrator;
        let mut queue = nodes.into_iter();
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < concurrency {
                let Some((node, scope)) = queue.next() else {
                    break;
                };
                // References resolve against the nodes already registered.
                let node = self.resolve_refs(node)?;
                let job = self.job(node, scope)?;
                in_flight.push(async move {
                    let scope = job.scope;
                    spawn_node(orchestrator, job).await.map(|handle| (scope, handle))
                });
            }
            match in_flight.next().await {
                Some(result) => {
                    let (scope, handle) = result?;
                    match scope {
                        Scope::Relay => self.network.add_relay_node(handle),
                        Scope::Parachain(id) => self.network.add_collator(id, handle),
                    };
                }
                None => return Ok(()),
            }
        }
    }

    /// Starts the block time monitor against the first relay node and
    /// registers it as a companion. Native runs skip it.
    async fn spawn_introspector(&mut self) -> Result<()> {
        let provider = self.provider();
        if provider.kind() == ProviderKind::Native {
            warn!("The introspector needs a container provider, not spawning it");
            return Ok(());
        }
        let relay = self
            .network
            .relay_nodes()
            .first()
            .cloned()
            .ok_or_else(|| OrchestratorError::config_validation("relay chain has no nodes"))?;
        let (ip, port) = provider.node_address(relay.name(), relay.ports().rpc).await?;

        let name = self.ctx.unique_name(INTROSPECTOR_NAME);
        let node = Node::builder(&name, NodeRole::Companion)
            .image(INTROSPECTOR_IMAGE)
            .full_command(format!(
                "polkadot-introspector block-time-monitor --ws={} prometheus --port {INTROSPECTOR_PORT}",
                render_uri(WS_URI_PATTERN, &ip, port)
            ))
            .ports(Ports {
                prometheus: INTROSPECTOR_PORT,
                ..Ports::default()
            })
            .build();
        let def = provider.generate_resource_definition(&node)?;
        provider.spawn(&def, &[]).await?;

        let prometheus = provider.start_port_forwarding(INTROSPECTOR_PORT, &name).await?;
        let uris = NodeUris {
            ws_uri: String::new(),
            prometheus_uri: render_uri(METRICS_URI_PATTERN, LOCALHOST, prometheus),
            multi_address: String::new(),
        };
        info!(companion = %name, metrics = %uris.prometheus_uri, "Introspector ready");
        self.network.add_companion(NetworkNode::new(
            name,
            node.ports,
            uris,
            Arc::clone(provider),
            self.orchestrator.clients.clone(),
        ));
        Ok(())
    }

    fn resolve_refs(&self, mut node: Node) -> Result<Node> {
        let resolve = |name: &str, field: &str| self.network.reference(name, field);
        for arg in node.args.iter_mut() {
            *arg = replace_network_refs(arg, resolve)?;
        }
        if let Some(cmd) = node.command_with_args.take() {
            node.command_with_args = Some(replace_network_refs(&cmd, resolve)?);
        }
        if let Some(cmd) = node.full_command.take() {
            node.full_command = Some(replace_network_refs(&cmd, resolve)?);
        }
        Ok(node)
    }

    fn wrapper_path(&self) -> PathBuf {
        self.provider().tmp_dir().join(WRAPPER_SCRIPT_NAME)
    }

    /// Collects the files `node` needs inside its environment.
    fn job(&self, node: Node, scope: Scope) -> Result<SpawnJob> {
        let provider = self.provider();
        let paths = provider.remote_paths(&node.name);
        let raw = self
            .raw_spec
            .as_ref()
            .ok_or_else(|| OrchestratorError::chain_spec_invalid("raw relay chain spec is not ready"))?;
        let relay_chain_id = self.network.chain_id().unwrap_or_default().to_string();

        let mut files = Vec::new();
        if provider.kind() != ProviderKind::Native {
            files.push(FileTransfer::new(self.wrapper_path(), format!("{}/{WRAPPER_SCRIPT_NAME}", paths.cfg)));
        }

        let keystore = match scope {
            Scope::Relay => {
                files.push(FileTransfer::new(raw.path(), format!("{}/{}.json", paths.cfg, node.chain)));
                Some((relay_chain_id, self.relay_flavor))
            }
            Scope::Parachain(id) if node.role == NodeRole::CumulusCollator => {
                files.push(FileTransfer::new(
                    raw.path(),
                    format!("{}/{}.json", paths.cfg, self.network.relay_chain()),
                ));
                if let Some(spec) = self.para_files.get(&id).and_then(|f| f.spec.as_ref()) {
                    files.push(FileTransfer::new(spec.path(), format!("{}/{}-{id}.json", paths.cfg, node.chain)));
                }
                let flavor = self.para_flavors.get(&id).copied().unwrap_or_default();
                self.para_chain_ids.get(&id).map(|chain_id| (chain_id.clone(), flavor))
            }
            Scope::Parachain(_) => {
                files.push(FileTransfer::new(raw.path(), format!("{}/{}.json", paths.cfg, node.chain)));
                None
            }
        };

        for file in &node.overrides {
            files.push(FileTransfer::new(&file.local_path, format!("{}/{}", paths.cfg, file.remote_name)));
        }

        Ok(SpawnJob {
            node,
            scope,
            files,
            keystore,
        })
    }

    async fn abort(&self, err: &OrchestratorError) {
        error!(state = %self.state, error = %err, "Launch failed, tearing down the network");
        let dumped = self.network.dump_logs().await;
        debug!(files = dumped.len(), "Dumped node logs");
        if let Err(e) = self.provider().destroy_namespace().await {
            warn!(error = %e, "Teardown failed");
        }
    }
}

/// Spawns one node and builds its handle.
async fn spawn_node(orchestrator: &Orchestrator, job: SpawnJob) -> Result<NetworkNode> {
    let SpawnJob {
        node,
        mut files,
        keystore,
        ..
    } = job;
    let provider = &orchestrator.provider;
    let paths = provider.remote_paths(&node.name);

    if let (Some((chain_id, flavor)), Some(accounts)) = (keystore, node.accounts.as_ref()) {
        let entries = keystore_entries(accounts, flavor, &node.keystore_key_types);
        let dir = provider.tmp_dir().join(&node.name);
        for path in write_keystore(&dir, &entries).await? {
            let file = path.file_name().and_then(|f| f.to_str()).unwrap_or_default().to_string();
            files.push(FileTransfer::new(
                &path,
                format!("{}/chains/{chain_id}/keystore/{file}", paths.data),
            ));
        }
    }

    let def = provider.generate_resource_definition(&node)?;
    debug!(node = %node.name, role = %node.role, files = files.len(), "Spawning node");
    provider.spawn(&def, &files).await?;

    let rpc = provider.start_port_forwarding(node.ports.rpc, &node.name).await?;
    let prometheus = if node.prometheus {
        provider.start_port_forwarding(node.ports.prometheus, &node.name).await?
    } else {
        node.ports.prometheus
    };
    let (ip, p2p) = provider.node_address(&node.name, node.ports.p2p).await?;
    let multi_address = bootnode_address(&node, &ip, p2p, orchestrator.keys.as_ref()).await?;

    let uris = NodeUris {
        ws_uri: render_uri(WS_URI_PATTERN, LOCALHOST, rpc),
        prometheus_uri: render_uri(METRICS_URI_PATTERN, LOCALHOST, prometheus),
        multi_address,
    };
    info!(node = %node.name, ws_uri = %uris.ws_uri, "Node ready");

    Ok(
        NetworkNode::new(&node.name, node.ports, uris, Arc::clone(provider), orchestrator.clients.clone())
            .with_para_id(node.para_id)
            .with_group(node.group.clone()),
    )
}
