//! Compiles a [`NetworkConfig`] into a [`ComputedNetwork`].

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::constants::{
    ARGS_TO_REMOVE, CLIENT_REMOTE_DIR_PLACEHOLDER, DEFAULT_ADDER_COLLATOR_BIN, DEFAULT_BALANCE, DEFAULT_CHAIN,
    DEFAULT_CHAIN_SPEC_COMMAND, DEFAULT_COLLATOR_IMAGE, DEFAULT_COMMAND, DEFAULT_CUMULUS_COLLATOR_BIN,
    DEFAULT_GENESIS_GENERATE_SUBCOMMAND, DEFAULT_IMAGE, DEFAULT_PROMETHEUS_PREFIX, DEFAULT_WASM_GENERATE_SUBCOMMAND,
    GENESIS_STATE_FILENAME, GENESIS_WASM_FILENAME, UNDYING_COLLATOR_BIN,
};
use crate::error::{OrchestratorError, Result};
use crate::keys::KeyGenerator;
use crate::provider::ProviderKind;
use crate::topology::{
    pick_port, seed_for, ChainFlavor, ChainSpecSource, ComputedNetwork, GenesisArtifact, HrmpChannel, Node,
    NodeRole, Override, Parachain, Ports, RelayChain, Settings,
};

use super::{CompilationContext, NetworkConfig, NodeConfig, OverrideConfig, ParachainConfig};

const DEFAULT_TELEMETRY_URL: &str = "ws://telemetry:8000/submit 0";
const JAEGER_URL_ENV: &str = "ZOMBIE_JAEGER_URL";
const BOOTNODE_KEY: &str = "0000000000000000000000000000000000000000000000000000000000000001";

/// Drops the flags the orchestrator sets itself, and everything after `--`.
///
/// `extra` adds flags to drop, with the number of tokens each consumes.
pub fn sanitize_args(args: &[String], extra: &[(&str, usize)]) -> Vec<String> {
    let end = args.iter().position(|a| a == "--").unwrap_or(args.len());
    let mut out = Vec::with_capacity(end);
    let mut skip = 0;

    for arg in &args[..end] {
        if skip > 0 {
            skip -= 1;
            continue;
        }
        let flag = if arg == "-d" { "d" } else { arg.trim_start_matches("--") };
        match ARGS_TO_REMOVE.iter().chain(extra.iter()).find(|(name, _)| *name == flag) {
            Some((_, arity)) => skip = arity - 1,
            None => out.push(arg.clone()),
        }
    }
    out
}

fn dedup_preserving_order(args: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    args.into_iter().filter(|a| seen.insert(a.clone())).collect()
}

async fn resolve_local_path(base: &Path, local: &str) -> Result<PathBuf> {
    let direct = PathBuf::from(local);
    if tokio::fs::metadata(&direct).await.is_ok() {
        return Ok(direct);
    }
    let relative = base.join(local);
    if tokio::fs::metadata(&relative).await.is_ok() {
        return Ok(relative);
    }
    Err(OrchestratorError::config_validation(format!(
        "invalid path '{local}', only full paths or paths relative to the config are allowed"
    )))
}

async fn resolve_overrides(base: &Path, overrides: &[OverrideConfig]) -> Result<Vec<Override>> {
    let mut resolved = Vec::with_capacity(overrides.len());
    for o in overrides {
        resolved.push(Override {
            local_path: resolve_local_path(base, &o.local_path).await?,
            remote_name: o.remote_name.clone(),
        });
    }
    Ok(resolved)
}

fn ports_for(provider: ProviderKind, node: &NodeConfig) -> Result<Ports> {
    if provider != ProviderKind::Native {
        return Ok(Ports::default());
    }
    Ok(Ports {
        p2p: node.p2p_port.map(Ok).unwrap_or_else(pick_port)?,
        rpc: node.rpc_port.map(Ok).unwrap_or_else(pick_port)?,
        prometheus: node.prometheus_port.map(Ok).unwrap_or_else(pick_port)?,
    })
}

fn binary_of(command_with_args: Option<&str>, command: Option<&str>, default: &str) -> String {
    command_with_args
        .and_then(|c| c.split(' ').next())
        .or(command)
        .unwrap_or(default)
        .to_string()
}

/// Resolves the Jaeger agent for a run. The environment wins over the
/// configured agent, and nothing is resolved unless tracing is enabled.
fn tracing_agent(enabled: bool, configured: Option<String>, env: Option<String>) -> Option<String> {
    if !enabled {
        return None;
    }
    let agent = env.filter(|url| !url.is_empty()).or(configured);
    if agent.is_none() {
        warn!("Tracing enabled without a jaeger agent, nodes will not report spans");
    }
    agent
}

/// Compiles `config` into a launch plan.
///
/// `base_dir` is the directory of the config file, used to resolve relative
/// paths. Names and bonds are recorded in `ctx`.
pub async fn compile(
    config: &NetworkConfig,
    base_dir: &Path,
    keys: &dyn KeyGenerator,
    ctx: &mut CompilationContext,
) -> Result<ComputedNetwork> {
    config.validate()?;

    let s = &config.settings;
    let settings = Settings {
        timeout_secs: s.timeout,
        node_spawn_timeout_secs: s.node_spawn_timeout,
        provider: s.provider,
        spawn_concurrency: s.spawn_concurrency.max(1),
        bootnode: s.bootnode,
        prometheus: s.prometheus,
        telemetry_url: s
            .telemetry
            .then(|| s.telemetry_url.clone().unwrap_or_else(|| DEFAULT_TELEMETRY_URL.to_string())),
        jaeger_agent: tracing_agent(s.enable_tracing, s.jaeger_agent.clone(), std::env::var(JAEGER_URL_ENV).ok()),
        polkadot_introspector: s.polkadot_introspector,
        local_ip: s.local_ip.clone(),
        image_pull_policy: s.image_pull_policy,
    };

    let rc = &config.relaychain;
    let chain = rc.chain.clone().unwrap_or_else(|| DEFAULT_CHAIN.to_string());
    let command = rc.default_command.clone().unwrap_or_else(|| DEFAULT_COMMAND.to_string());
    let image = rc.default_image.clone().unwrap_or_else(|| DEFAULT_IMAGE.to_string());

    let chain_spec = match &rc.chain_spec_path {
        Some(path) => ChainSpecSource::Path(resolve_local_path(base_dir, path).await?),
        None => ChainSpecSource::Command(
            rc.chain_spec_command
                .as_deref()
                .unwrap_or(DEFAULT_CHAIN_SPEC_COMMAND)
                .replace("{{chainName}}", &chain)
                .replace("{{DEFAULT_COMMAND}}", &command),
        ),
    };

    let flavor = ChainFlavor::from_chain_name(&chain);
    let global_overrides = resolve_overrides(base_dir, &rc.default_overrides).await?;
    let default_args = sanitize_args(&rc.default_args, &[]);

    let mut relay = RelayChain {
        chain: chain.clone(),
        image: image.clone().into(),
        command: command.clone(),
        chain_spec,
        flavor,
        genesis_overrides: rc.genesis.clone(),
        random_nominators_count: rc.random_nominators_count,
        max_nominations: rc.max_nominations,
        nodes: Vec::new(),
    };

    if settings.bootnode {
        let name = ctx.unique_name("bootnode");
        let mut node = Node::builder(name, NodeRole::BootNode)
            .image(image.clone())
            .command(command.clone())
            .chain(chain.clone())
            .ports(ports_for(settings.provider, &NodeConfig::default())?)
            .prometheus(settings.prometheus)
            .build();
        node.key = BOOTNODE_KEY.to_string();
        relay.nodes.push(node);
    }

    let declared = rc
        .nodes
        .iter()
        .map(|n| (n.clone(), None))
        .chain(
            rc.node_groups
                .iter()
                .flat_map(|g| g.expand().into_iter().map(move |n| (n, Some(g.name.clone())))),
        );

    for (node_cfg, group) in declared {
        let name = ctx.unique_name(&node_cfg.name);
        let seed = seed_for(&name);
        let accounts = keys.accounts_for(&seed).await?;

        let mut args = default_args.clone();
        args.extend(sanitize_args(&node_cfg.args, &[]));

        let mut builder = Node::builder(name, NodeRole::Node)
            .image(node_cfg.image.clone().unwrap_or_else(|| image.clone()))
            .command(node_cfg.command.clone().unwrap_or_else(|| command.clone()))
            .command_with_args(node_cfg.command_with_args.clone())
            .chain(chain.clone())
            .args(dedup_preserving_order(args))
            .validator(node_cfg.validator.unwrap_or(true))
            .invulnerable(node_cfg.invulnerable)
            .balance(node_cfg.balance.unwrap_or(DEFAULT_BALANCE))
            .accounts(accounts)
            .resources(node_cfg.resources.clone().or_else(|| rc.default_resources.clone()))
            .ports(ports_for(settings.provider, &node_cfg)?)
            .prometheus(settings.prometheus)
            .telemetry_url(settings.telemetry_url.clone())
            .jaeger_agent(settings.jaeger_agent.clone())
            .prometheus_prefix(
                node_cfg
                    .prometheus_prefix
                    .clone()
                    .or_else(|| rc.default_prometheus_prefix.clone())
                    .unwrap_or_else(|| DEFAULT_PROMETHEUS_PREFIX.to_string()),
            )
            .add_to_bootnodes(node_cfg.add_to_bootnodes)
            .keystore_key_types(node_cfg.keystore_key_types.clone());

        for env in &node_cfg.env {
            builder = builder.env(env.name.clone(), env.value.clone());
        }
        for file in global_overrides
            .iter()
            .cloned()
            .chain(resolve_overrides(base_dir, &node_cfg.overrides).await?)
        {
            builder = builder.with_override(file);
        }
        if let Some(group) = group {
            builder = builder.group(group);
        }

        relay.nodes.push(builder.build());
    }

    if relay.nodes.iter().all(|n| n.role == NodeRole::BootNode) {
        return Err(OrchestratorError::config_validation("the relay chain needs at least one node"));
    }

    let mut parachains = Vec::with_capacity(config.parachains.len());
    for para_cfg in &config.parachains {
        parachains.push(compile_parachain(para_cfg, &relay, &settings, base_dir, keys, ctx, rc).await?);
    }

    let hrmp_channels = config
        .hrmp_channels
        .iter()
        .map(|c| HrmpChannel {
            sender: c.sender,
            recipient: c.recipient,
            max_capacity: c.max_capacity,
            max_message_size: c.max_message_size,
        })
        .collect();

    info!(
        chain = %relay.chain,
        nodes = relay.nodes.len(),
        parachains = parachains.len(),
        provider = %settings.provider,
        "Compiled network"
    );

    Ok(ComputedNetwork {
        settings,
        relay,
        parachains,
        hrmp_channels,
        config_base: base_dir.to_path_buf(),
    })
}

async fn compile_parachain(
    cfg: &ParachainConfig,
    relay: &RelayChain,
    settings: &Settings,
    base_dir: &Path,
    keys: &dyn KeyGenerator,
    ctx: &mut CompilationContext,
    rc: &super::RelayChainConfig,
) -> Result<Parachain> {
    let first_binary = cfg
        .all_collators()
        .first()
        .map(|c| binary_of(c.command_with_args.as_deref(), c.command.as_deref(), DEFAULT_CUMULUS_COLLATOR_BIN))
        .unwrap_or_else(|| DEFAULT_CUMULUS_COLLATOR_BIN.to_string());
    let first_binary_name = first_binary.rsplit('/').next().unwrap_or(&first_binary).to_string();

    let cumulus_based = cfg
        .cumulus_based
        .unwrap_or_else(|| ![DEFAULT_ADDER_COLLATOR_BIN, UNDYING_COLLATOR_BIN].contains(&first_binary_name.as_str()));

    let flavor = ChainFlavor::from_chain_name(cfg.chain.as_deref().unwrap_or_default());
    let collator_chain = Parachain::collator_chain(cfg.chain.as_deref(), &relay.chain);
    let role = if cumulus_based {
        NodeRole::CumulusCollator
    } else {
        NodeRole::Collator
    };

    let declared = cfg
        .collator
        .iter()
        .chain(cfg.collators.iter())
        .map(|c| (c.clone(), None))
        .chain(
            cfg.collator_groups
                .iter()
                .flat_map(|g| g.expand().into_iter().map(move |n| (n, Some(g.name.clone())))),
        );

    let mut collators = Vec::new();
    for (col, group) in declared {
        let base_name = if col.name.is_empty() { "collator" } else { col.name.as_str() };
        let name = ctx.unique_name(base_name);
        let accounts = keys.accounts_for(&seed_for(&name)).await?;

        // relay node arguments after `--` are kept untouched
        let mut args = sanitize_args(&col.args, &[("listen-addr", 2)]);
        if let Some(idx) = col.args.iter().position(|a| a == "--") {
            args.extend(col.args[idx..].iter().cloned());
        }

        let mut builder = Node::builder(name, role)
            .image(col.image.clone().unwrap_or_else(|| DEFAULT_COLLATOR_IMAGE.to_string()))
            .command(binary_of(
                col.command_with_args.as_deref(),
                col.command.as_deref(),
                DEFAULT_CUMULUS_COLLATOR_BIN,
            ))
            .command_with_args(col.command_with_args.clone())
            .chain(collator_chain.clone())
            .args(args)
            .validator(col.validator.unwrap_or(true))
            .invulnerable(col.invulnerable)
            .balance(col.balance.unwrap_or(DEFAULT_BALANCE))
            .accounts(accounts)
            .resources(col.resources.clone().or_else(|| rc.default_resources.clone()))
            .ports(ports_for(settings.provider, &col)?)
            .para_id(cfg.id)
            .prometheus(settings.prometheus)
            .prometheus_prefix(col.prometheus_prefix.clone().unwrap_or_else(|| DEFAULT_PROMETHEUS_PREFIX.to_string()))
            .keystore_key_types(col.keystore_key_types.clone());

        for env in &col.env {
            builder = builder.env(env.name.clone(), env.value.clone());
        }
        for file in resolve_overrides(base_dir, &col.overrides).await? {
            builder = builder.with_override(file);
        }
        if let Some(group) = group {
            builder = builder.group(group);
        }
        collators.push(builder.build());
    }

    if collators.is_empty() {
        return Err(OrchestratorError::config_validation(format!(
            "no collator defined for parachain {}",
            cfg.id
        )));
    }

    let genesis_state = match &cfg.genesis_state_path {
        Some(path) => GenesisArtifact::File(resolve_local_path(base_dir, path).await?),
        None => GenesisArtifact::Generate(generator_command(
            cfg.genesis_state_generator.as_deref(),
            &first_binary,
            DEFAULT_GENESIS_GENERATE_SUBCOMMAND,
            GENESIS_STATE_FILENAME,
        )),
    };
    let genesis_wasm = match &cfg.genesis_wasm_path {
        Some(path) => GenesisArtifact::File(resolve_local_path(base_dir, path).await?),
        None => GenesisArtifact::Generate(generator_command(
            cfg.genesis_wasm_generator.as_deref(),
            &first_binary,
            DEFAULT_WASM_GENERATE_SUBCOMMAND,
            GENESIS_WASM_FILENAME,
        )),
    };

    let chain_spec = match &cfg.chain_spec_path {
        Some(path) => Some(ChainSpecSource::Path(resolve_local_path(base_dir, path).await?)),
        None if cumulus_based => Some(ChainSpecSource::Command(match &cfg.chain {
            Some(chain) => format!("{first_binary} build-spec --chain {chain} --disable-default-bootnode"),
            None => format!("{first_binary} build-spec --disable-default-bootnode"),
        })),
        None => None,
    };

    debug!(para_id = cfg.id, cumulus_based, collators = collators.len(), "Compiled parachain");

    Ok(Parachain {
        id: cfg.id,
        chain: cfg.chain.clone(),
        add_to_genesis: cfg.add_to_genesis,
        cumulus_based,
        genesis_state,
        genesis_wasm,
        chain_spec,
        flavor,
        genesis_overrides: cfg.genesis.clone(),
        collators,
    })
}

fn generator_command(custom: Option<&str>, binary: &str, subcommand: &str, file: &str) -> String {
    let base = custom.map(str::to_string).unwrap_or_else(|| format!("{binary} {subcommand}"));
    format!("{base} > {CLIENT_REMOTE_DIR_PLACEHOLDER}/{file}")
}
