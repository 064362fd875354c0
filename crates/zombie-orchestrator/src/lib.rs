//! # zombie-orchestrator
//!
//! Spawns ephemeral relay-chain/parachain test networks.
//!
//! A declarative [`NetworkConfig`] is compiled into a [`ComputedNetwork`],
//! whose chain specs are then built and customized before every node is
//! started through a [`Provider`]: Kubernetes pods, Podman containers or
//! local processes. The result is a [`Network`] of [`NetworkNode`] handles
//! that tests query for liveness, metrics and parachain progress.
//!
//! ## Architecture
//!
//! - **Config**: the user-facing network description and its compiler
//! - **Topology**: the fully-resolved plan of nodes, ports and accounts
//! - **Genesis**: chain spec document edits (authorities, balances, parachains)
//! - **Chain spec**: building plain and raw specs inside helper nodes
//! - **Provider**: the execution backends
//! - **Orchestrator**: the launch state machine
//! - **Network**: running node handles, metrics and RPC queries
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use zombie_orchestrator::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = NetworkConfig::load("network.toml").await?;
//!     let keys: Arc<dyn KeyGenerator> = Arc::new(SubkeyKeyGenerator::default());
//!     let mut ctx = CompilationContext::new();
//!     let plan = compile(&config, std::path::Path::new("."), keys.as_ref(), &mut ctx).await?;
//!
//!     let kind = plan.settings.provider;
//!     let provider = provider::connect(kind, ProviderOptions::new(generate_namespace(kind), "/tmp/zombie")).await?;
//!     let clients = NodeClients {
//!         rpc: Arc::new(HttpRpcConnector::default()),
//!         metrics: Arc::new(HttpMetricsSource::default()),
//!     };
//!     let network = Orchestrator::new(provider, keys, clients).launch(plan, ctx).await?;
//!     network.stop().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod bootnode;
pub mod chain_spec;
pub mod command;
pub mod config;
pub mod constants;
pub mod error;
pub mod genesis;
pub mod keys;
pub mod metrics;
pub mod network;
pub mod node;
pub mod orchestrator;
pub mod provider;
pub mod rpc;
pub mod topology;

pub use config::{compile, CompilationContext, NetworkConfig};
pub use error::{OrchestratorError, Result};
pub use keys::{KeyGenerator, SubkeyKeyGenerator};
pub use metrics::{Comparator, HttpMetricsSource, Metrics, MetricsSource};
pub use network::{Network, NetworkSummary};
pub use node::{NetworkNode, NodeClients, NodeUris};
pub use orchestrator::{LaunchState, Orchestrator};
pub use provider::{generate_namespace, Provider, ProviderKind, ProviderOptions, SharedProvider};
pub use rpc::{HttpRpcConnector, RpcClient, RpcConnector};
pub use topology::ComputedNetwork;
