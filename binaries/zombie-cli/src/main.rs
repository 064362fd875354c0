//! Zombie - launcher for ephemeral relay-chain/parachain test networks.
//!
//! Loads a network description, spawns it on the selected provider, prints
//! the network summary and keeps the network up until Ctrl-C or SIGTERM, then
//! tears the namespace down.
//!
//! # Usage
//!
//! ```bash
//! # Spawn a network described in TOML
//! zombie network.toml
//!
//! # Run it as local processes with two spawns in flight
//! zombie network.toml --provider native --spawn-concurrency 2
//!
//! # Use a launcher configuration file
//! zombie network.toml --config zombie.toml
//! ```

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::LauncherConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use zombie_orchestrator::{
    compile, generate_namespace, provider, CompilationContext, HttpMetricsSource, HttpRpcConnector, KeyGenerator,
    NetworkConfig, NodeClients, Orchestrator, ProviderKind, ProviderOptions, SubkeyKeyGenerator,
};

/// CLI arguments for the launcher.
#[derive(Parser, Debug)]
#[command(
    name = "zombie",
    about = "Spawn ephemeral relay-chain/parachain test networks",
    version,
    author
)]
pub struct CliArgs {
    /// Network description (`.toml` or `.json`).
    #[arg(value_name = "NETWORK", required_unless_present = "print_config")]
    network: Option<PathBuf>,

    /// Path to the launcher configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Provider to spawn on (kubernetes, podman, native).
    #[arg(short, long, value_name = "PROVIDER")]
    provider: Option<ProviderKind>,

    /// Number of nodes spawned at the same time.
    #[arg(long, value_name = "N")]
    spawn_concurrency: Option<usize>,

    /// Parent of the run's working directory.
    #[arg(short, long, value_name = "DIR")]
    dir: Option<PathBuf>,

    /// Key helper binary.
    #[arg(long, value_name = "BIN")]
    keys_bin: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Enable JSON log output.
    #[arg(long)]
    json_logs: bool,

    /// Print the default launcher configuration and exit.
    #[arg(long)]
    print_config: bool,
}

/// Applies launcher overrides to the network description.
fn apply_overrides(network: &mut NetworkConfig, config: &LauncherConfig) {
    if let Some(provider) = config.spawn.provider {
        network.settings.provider = provider;
    }
    if let Some(concurrency) = config.spawn.spawn_concurrency {
        network.settings.spawn_concurrency = concurrency;
    }
}

async fn run(network_path: &Path, config: &LauncherConfig) -> Result<()> {
    let mut network_config = NetworkConfig::load(network_path)
        .await
        .with_context(|| format!("Failed to load network from {:?}", network_path))?;
    apply_overrides(&mut network_config, config);

    let keys: Arc<dyn KeyGenerator> = Arc::new(SubkeyKeyGenerator::new(config.keys.program.clone()));
    let base_dir = network_path.parent().unwrap_or_else(|| Path::new("."));
    let mut ctx = CompilationContext::new();
    let plan = compile(&network_config, base_dir, keys.as_ref(), &mut ctx)
        .await
        .context("Invalid network description")?;

    let kind = plan.settings.provider;
    let namespace = generate_namespace(kind);
    let mut options = ProviderOptions::new(&namespace, config.spawn.run_dir(&namespace));
    options.spawn_timeout = Duration::from_secs(plan.settings.node_spawn_timeout_secs);
    options.image_pull_policy = plan.settings.image_pull_policy;
    let provider = provider::connect(kind, options)
        .await
        .with_context(|| format!("Provider {kind} is not usable"))?;

    let clients = NodeClients {
        rpc: Arc::new(HttpRpcConnector::default()),
        metrics: Arc::new(HttpMetricsSource::default()),
    };
    let orchestrator = Orchestrator::new(provider, keys, clients);
    let network = orchestrator.launch(plan, ctx).await.context("Launch failed")?;

    println!("{}", serde_json::to_string_pretty(&network.summary())?);
    info!(namespace = %network.namespace(), "Network is up, press Ctrl-C to stop");

    shutdown_signal().await;
    info!("Shutdown signal received");
    if let Err(e) = network.stop().await {
        warn!(error = %e, "Teardown failed");
        return Err(e.into());
    }
    Ok(())
}

/// Initialize tracing/logging.
fn init_tracing(config: &config::LoggingConfig, json_logs: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Failed to parse log filter")?;

    let format = if json_logs || config.format == "json" {
        "json"
    } else {
        &config.format
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
        "compact" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact())
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty())
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
    }

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    if args.print_config {
        let config = LauncherConfig::default();
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let mut config = if let Some(ref config_path) = args.config {
        LauncherConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        LauncherConfig::default()
    };
    config.merge_cli_args(&args);
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.logging, args.json_logs)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Zombie launcher starting");

    let network_path = args.network.context("No network description given")?;
    if let Err(e) = run(&network_path, &config).await {
        error!(error = %e, "Launcher failed");
        return Err(e);
    }

    info!("Network stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_args_parsing() {
        let args = CliArgs::parse_from(["zombie", "network.toml"]);
        assert_eq!(args.network, Some(PathBuf::from("network.toml")));
        assert!(args.config.is_none());
        assert!(args.provider.is_none());
        assert!(!args.json_logs);
    }

    #[test]
    fn test_network_is_required() {
        assert!(CliArgs::try_parse_from(["zombie"]).is_err());
        let args = CliArgs::parse_from(["zombie", "--print-config"]);
        assert!(args.print_config);
    }

    #[test]
    fn test_cli_args_with_options() {
        let args = CliArgs::parse_from([
            "zombie",
            "net.json",
            "--provider",
            "native",
            "--spawn-concurrency",
            "3",
            "--log-level",
            "debug",
            "--json-logs",
        ]);

        assert_eq!(args.provider, Some(ProviderKind::Native));
        assert_eq!(args.spawn_concurrency, Some(3));
        assert_eq!(args.log_level, Some("debug".to_string()));
        assert!(args.json_logs);
        assert!(CliArgs::try_parse_from(["zombie", "net.json", "--provider", "docker"]).is_err());
    }

    #[test]
    fn test_config_merge() {
        let mut config = LauncherConfig::default();
        let args = CliArgs::parse_from([
            "zombie",
            "net.toml",
            "--provider",
            "podman",
            "--dir",
            "/tmp/runs",
            "--keys-bin",
            "polkadot",
        ]);

        config.merge_cli_args(&args);

        assert_eq!(config.spawn.provider, Some(ProviderKind::Podman));
        assert_eq!(config.spawn.work_dir, Some(PathBuf::from("/tmp/runs")));
        assert_eq!(config.keys.program, "polkadot");
    }

    #[test]
    fn test_overrides_reach_network_settings() {
        let mut network = NetworkConfig::default();
        let mut config = LauncherConfig::default();
        config.spawn.provider = Some(ProviderKind::Native);
        config.spawn.spawn_concurrency = Some(4);

        apply_overrides(&mut network, &config);

        assert_eq!(network.settings.provider, ProviderKind::Native);
        assert_eq!(network.settings.spawn_concurrency, 4);
    }
}
