//! Command line generation for nodes.

use crate::constants::{DEFAULT_DATA_DIR, DEFAULT_RELAY_DATA_DIR, DEFAULT_REMOTE_DIR, P2P_PORT, RPC_HTTP_PORT, RPC_WS_PORT};
use crate::error::Result;
use crate::topology::{pick_port, Node, NodeRole};

/// Wrapper script every container node runs under; it lets the
/// orchestrator pause, resume and restart the node process.
pub const WRAPPER_SCRIPT_NAME: &str = "zombie-wrapper.sh";

/// Body of [`WRAPPER_SCRIPT_NAME`].
pub const WRAPPER_SCRIPT: &str = r#"#!/bin/bash
set -uo pipefail

PIPE=/tmp/zombiepipe
rm -f "$PIPE"
mkfifo "$PIPE"

child_pid=""

start() {
    bash -c "$1" &
    child_pid=$!
}

start "$1"

while true; do
    if ! kill -0 "$child_pid" 2>/dev/null; then
        wait "$child_pid"
        exit $?
    fi
    if read -t 1 line <> "$PIPE"; then
        case "$line" in
            pause) kill -STOP "$child_pid" ;;
            resume) kill -CONT "$child_pid" ;;
            restart*)
                kill -9 "$child_pid"
                wait "$child_pid" 2>/dev/null
                secs="${line#restart}"
                if [ -n "${secs// /}" ]; then sleep $secs; fi
                start "$1"
                ;;
        esac
    fi
done
"#;

/// Locations of the node directories inside the execution environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePaths {
    /// Configuration directory (chain specs, overrides).
    pub cfg: String,
    /// Node base path.
    pub data: String,
    /// Base path of the relay node embedded in a cumulus collator.
    pub relay_data: String,
}

impl Default for RemotePaths {
    fn default() -> Self {
        Self {
            cfg: DEFAULT_REMOTE_DIR.to_string(),
            data: DEFAULT_DATA_DIR.to_string(),
            relay_data: DEFAULT_RELAY_DATA_DIR.to_string(),
        }
    }
}

/// A generated node command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCommand {
    /// A script run by an explicit shell; never wrapped.
    Shell {
        /// `bash` or `ash`.
        shell: String,
        /// The script.
        script: String,
    },
    /// A command line run through the wrapper.
    Line(String),
}

impl NodeCommand {
    /// Arguments for a container, running lines under the wrapper script.
    pub fn container_args(&self, cfg_dir: &str) -> Vec<String> {
        match self {
            Self::Shell { shell, script } => vec![shell.clone(), "-c".into(), script.clone()],
            Self::Line(line) => vec!["bash".into(), format!("{cfg_dir}/{WRAPPER_SCRIPT_NAME}"), line.clone()],
        }
    }

    /// Arguments for a local process.
    pub fn native_args(&self) -> Vec<String> {
        match self {
            Self::Shell { shell, script } => vec![shell.clone(), "-c".into(), script.clone()],
            Self::Line(line) => vec!["bash".into(), "-c".into(), line.clone()],
        }
    }

    /// The command as one string.
    pub fn as_line(&self) -> &str {
        match self {
            Self::Shell { script, .. } => script,
            Self::Line(line) => line,
        }
    }
}

/// Generates the command of `node`.
pub fn generate_command(node: &Node, paths: &RemotePaths) -> Result<NodeCommand> {
    if let Some(full) = &node.full_command {
        return Ok(NodeCommand::Shell {
            shell: "bash".into(),
            script: full.clone(),
        });
    }
    if let Some(cmd) = &node.command_with_args {
        return Ok(parse_command_with_args(cmd));
    }
    match node.role {
        NodeRole::CumulusCollator => cumulus_collator_command(node, paths),
        _ => Ok(node_command(node, paths)),
    }
}

fn parse_command_with_args(cmd: &str) -> NodeCommand {
    let parts: Vec<&str> = cmd.split(' ').collect();
    match parts.first() {
        Some(&shell) if shell == "bash" || shell == "ash" => {
            let start = if parts.get(1) == Some(&"-c") { 2 } else { 1 };
            NodeCommand::Shell {
                shell: shell.to_string(),
                script: parts[start..].join(" "),
            }
        }
        _ => NodeCommand::Line(cmd.to_string()),
    }
}

fn port_flags(node: &Node) -> [(&'static str, u16); 2] {
    [("--prometheus-port", node.ports.prometheus), ("--rpc-port", node.ports.rpc)]
}

fn node_command(node: &Node, paths: &RemotePaths) -> NodeCommand {
    let mut args = node.args.clone();
    args.push("--no-mdns".into());
    args.extend(["--node-key".into(), node.key.clone()]);

    match &node.telemetry_url {
        Some(url) => args.extend(["--telemetry-url".into(), url.clone()]),
        None => args.push("--no-telemetry".into()),
    }

    if node.prometheus && !args.iter().any(|a| a == "--prometheus-external") {
        args.push("--prometheus-external".into());
    }
    if node.validator && !args.iter().any(|a| a == "--validator") {
        args.push("--validator".into());
    }
    if let (NodeRole::Node, Some(agent)) = (node.role, &node.jaeger_agent) {
        args.extend(["--jaeger-agent".into(), agent.clone()]);
    }

    if node.role == NodeRole::Collator {
        if let Some(para_id) = node.para_id {
            args.retain(|a| !a.contains("--parachain-id"));
            args.extend(["--parachain-id".into(), para_id.to_string()]);
        }
    }

    if !node.bootnodes.is_empty() {
        args.extend(["--bootnodes".into(), node.bootnodes.join(" ")]);
    }

    for (flag, port) in port_flags(node) {
        args.extend([flag.to_string(), port.to_string()]);
    }

    match args.iter().position(|a| a == "--listen-addr") {
        Some(idx) if idx + 1 < args.len() => {
            let mut parts: Vec<String> = args[idx + 1].split('/').map(str::to_string).collect();
            if parts.len() > 4 {
                parts[4] = node.ports.p2p.to_string();
            }
            args[idx + 1] = parts.join("/");
        }
        _ => args.extend([
            "--listen-addr".into(),
            format!("/ip4/0.0.0.0/tcp/{}/ws", node.ports.p2p),
        ]),
    }

    if let Some(idx) = args.iter().position(|a| a == "--base-path") {
        let end = (idx + 2).min(args.len());
        args.drain(idx..end);
    }
    args.extend(["--base-path".into(), paths.data.clone()]);

    let mut line = vec![
        node.command.clone(),
        "--chain".into(),
        format!("{}/{}.json", paths.cfg, node.chain),
        "--name".into(),
        node.name.clone(),
        "--rpc-cors".into(),
        "all".into(),
        "--unsafe-rpc-external".into(),
        "--rpc-methods".into(),
        "unsafe".into(),
    ];
    line.extend(args);
    NodeCommand::Line(line.join(" "))
}

// Flags the parachain side of a collator gets from us, with their arity.
const COLLATOR_OWNED_FLAGS: [(&str, usize); 8] = [
    ("--name", 2),
    ("--collator", 1),
    ("--base-path", 2),
    ("--port", 2),
    ("--ws-port", 2),
    ("--rpc-port", 2),
    ("--chain", 2),
    ("--prometheus-port", 2),
];

const RELAY_PORT_FLAGS: [&str; 2] = ["--port", "--rpc-port"];

fn cumulus_collator_command(node: &Node, paths: &RemotePaths) -> Result<NodeCommand> {
    let mut cmd = vec![
        node.command.clone(),
        "--name".into(),
        node.name.clone(),
        "--node-key".into(),
        node.key.clone(),
        "--chain".into(),
        format!("{}/{}-{}.json", paths.cfg, node.chain, node.para_id.unwrap_or_default()),
        "--base-path".into(),
        paths.data.clone(),
        "--listen-addr".into(),
        format!("/ip4/0.0.0.0/tcp/{}/ws", node.ports.p2p),
        "--prometheus-external".into(),
        "--rpc-cors all".into(),
        "--unsafe-rpc-external".into(),
        "--rpc-methods unsafe".into(),
    ];
    for (flag, port) in port_flags(node) {
        cmd.extend([flag.to_string(), port.to_string()]);
    }
    if node.validator {
        cmd.push("--collator".into());
    }

    let relay_chain = node.chain.rsplit('_').next().unwrap_or(&node.chain);
    let (para_args, relay_args) = match node.args.iter().position(|a| a == "--") {
        Some(idx) => (&node.args[..idx], node.args[idx + 1..].to_vec()),
        None => (&node.args[..], Vec::new()),
    };

    let mut i = 0;
    while i < para_args.len() {
        match COLLATOR_OWNED_FLAGS.iter().find(|(flag, _)| *flag == para_args[i]) {
            Some((_, arity)) => i += arity,
            None => {
                cmd.push(para_args[i].clone());
                i += 1;
            }
        }
    }

    cmd.extend([
        "--".into(),
        "--base-path".into(),
        paths.relay_data.clone(),
        "--chain".into(),
        format!("{}/{relay_chain}.json", paths.cfg),
        "--execution wasm".into(),
    ]);
    cmd.extend(relay_node_args(node, relay_args)?);

    Ok(NodeCommand::Line(cmd.join(" ")))
}

// The embedded relay node must not collide with the ports of the parachain
// side, so default ports are swapped for random free ones.
fn relay_node_args(node: &Node, mut args: Vec<String>) -> Result<Vec<String>> {
    let reserved = [P2P_PORT, RPC_HTTP_PORT, RPC_WS_PORT, node.ports.p2p, node.ports.rpc];
    let mut seen = Vec::new();

    for idx in 0..args.len() {
        if !RELAY_PORT_FLAGS.contains(&args[idx].as_str()) {
            continue;
        }
        seen.push(args[idx].clone());
        if let Some(value) = args.get(idx + 1) {
            let clashes = value.parse::<u16>().map(|p| reserved.contains(&p)).unwrap_or(true);
            if clashes {
                args[idx + 1] = pick_port()?.to_string();
            }
        }
    }

    for flag in RELAY_PORT_FLAGS {
        if !seen.iter().any(|s| s == flag) {
            args.extend([flag.to_string(), pick_port()?.to_string()]);
        }
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Ports;

    fn relay_node() -> Node {
        Node::builder("alice", NodeRole::Node)
            .validator(true)
            .chain("rococo-local")
            .build()
    }

    #[test]
    fn test_relay_node_command() {
        let cmd = generate_command(&relay_node(), &RemotePaths::default()).unwrap();
        let line = cmd.as_line().to_string();
        assert!(line.starts_with(
            "polkadot --chain /cfg/rococo-local.json --name alice --rpc-cors all --unsafe-rpc-external --rpc-methods unsafe"
        ));
        assert!(line.contains("--no-mdns"));
        assert!(line.contains("--no-telemetry"));
        assert!(line.contains("--validator"));
        assert!(line.contains("--prometheus-external"));
        assert!(line.contains("--listen-addr /ip4/0.0.0.0/tcp/30333/ws"));
        assert!(line.ends_with("--base-path /data"));
        assert_eq!(
            cmd.container_args("/cfg"),
            vec!["bash".to_string(), "/cfg/zombie-wrapper.sh".to_string(), line.clone()]
        );
        assert_eq!(cmd.native_args()[..2], ["bash".to_string(), "-c".to_string()]);
    }

    #[test]
    fn test_jaeger_agent_only_on_relay_nodes() {
        let mut node = relay_node();
        assert!(!generate_command(&node, &RemotePaths::default()).unwrap().as_line().contains("--jaeger-agent"));

        node.jaeger_agent = Some("10.0.0.7:6831".into());
        let cmd = generate_command(&node, &RemotePaths::default()).unwrap();
        assert!(cmd.as_line().contains("--jaeger-agent 10.0.0.7:6831"));

        let collator = Node::builder("adder", NodeRole::Collator)
            .para_id(100)
            .jaeger_agent(Some("10.0.0.7:6831".into()))
            .build();
        let cmd = generate_command(&collator, &RemotePaths::default()).unwrap();
        assert!(!cmd.as_line().contains("--jaeger-agent"));
    }

    #[test]
    fn test_user_listen_addr_and_base_path() {
        let node = Node::builder("bob", NodeRole::Node)
            .args(vec![
                "--listen-addr".into(),
                "/ip4/0.0.0.0/tcp/1234".into(),
                "--base-path".into(),
                "/elsewhere".into(),
            ])
            .ports(Ports {
                p2p: 40000,
                rpc: 40001,
                prometheus: 40002,
            })
            .build();
        let line = generate_command(&node, &RemotePaths::default()).unwrap().as_line().to_string();
        assert!(line.contains("--listen-addr /ip4/0.0.0.0/tcp/40000"));
        assert!(!line.contains("/elsewhere"));
        assert!(line.contains("--rpc-port 40001"));
        assert!(line.contains("--prometheus-port 40002"));
    }

    #[test]
    fn test_full_command_and_command_with_args() {
        let temp = Node::builder("temp", NodeRole::Temp).full_command("polkadot build-spec > /cfg/x.json").build();
        assert_eq!(
            generate_command(&temp, &RemotePaths::default()).unwrap(),
            NodeCommand::Shell {
                shell: "bash".into(),
                script: "polkadot build-spec > /cfg/x.json".into()
            }
        );

        let custom = Node::builder("c", NodeRole::Node)
            .command_with_args(Some("ash -c echo hi".into()))
            .build();
        assert_eq!(
            generate_command(&custom, &RemotePaths::default()).unwrap().native_args(),
            vec!["ash".to_string(), "-c".into(), "echo hi".into()]
        );

        let plain = Node::builder("p", NodeRole::Node)
            .command_with_args(Some("polkadot --dev".into()))
            .build();
        assert_eq!(
            generate_command(&plain, &RemotePaths::default()).unwrap(),
            NodeCommand::Line("polkadot --dev".into())
        );
    }

    #[test]
    fn test_adder_collator_parachain_id() {
        let node = Node::builder("adder", NodeRole::Collator)
            .command("adder-collator")
            .para_id(100)
            .args(vec!["--parachain-id=1".into()])
            .build();
        let line = generate_command(&node, &RemotePaths::default()).unwrap().as_line().to_string();
        assert!(line.contains("--parachain-id 100"));
        assert!(!line.contains("--parachain-id=1"));
    }

    #[test]
    fn test_cumulus_collator_command() {
        let node = Node::builder("collator", NodeRole::CumulusCollator)
            .command("polkadot-parachain")
            .chain("rococo-local")
            .para_id(2000)
            .validator(true)
            .args(vec![
                "--force-authoring".into(),
                "--name".into(),
                "ignored".into(),
                "--".into(),
                "--port".into(),
                "30333".into(),
            ])
            .build();
        let line = generate_command(&node, &RemotePaths::default()).unwrap().as_line().to_string();
        assert!(line.starts_with("polkadot-parachain --name collator --node-key"));
        assert!(line.contains("--chain /cfg/rococo-local-2000.json"));
        assert!(line.contains("--collator"));
        assert!(line.contains("--force-authoring"));
        assert!(!line.contains("ignored"));
        assert!(line.contains("-- --base-path /relay-data --chain /cfg/rococo-local.json --execution wasm"));

        let relay_part = line.split(" -- ").nth(1).unwrap();
        assert!(!relay_part.contains("--port 30333"));
        assert!(relay_part.contains("--port "));
        assert!(relay_part.contains("--rpc-port "));
    }

    #[test]
    fn test_cumulus_relay_chain_from_para_chain_name() {
        let node = Node::builder("col", NodeRole::CumulusCollator)
            .chain("asset-hub_rococo-local")
            .para_id(1000)
            .build();
        let line = generate_command(&node, &RemotePaths::default()).unwrap().as_line().to_string();
        assert!(line.contains("--chain /cfg/asset-hub_rococo-local-1000.json"));
        assert!(line.contains("--chain /cfg/rococo-local.json"));
    }
}
