//! Network topology definitions.
//!
//! This module holds the resolved launch plan produced by the compiler: the
//! relay chain, its parachains, every concrete node and the container
//! resources they run with.

mod node;
mod plan;
mod resources;

pub use node::{node_key, pick_port, seed_for, Node, NodeBuilder, NodeRole, Override, Ports};
pub use plan::{
    ChainFlavor, ChainSpecSource, ComputedNetwork, GenesisArtifact, HrmpChannel, Parachain, RelayChain, Settings,
};
pub use resources::{
    parse_cpu_quantity, parse_memory_quantity, ContainerImage, ImagePullPolicy, ResourceQuantities, Resources,
};
