//! Well-known ports, defaults, file names and command templates.

use std::time::Duration;

/// Port the node serves prometheus metrics on.
pub const PROMETHEUS_PORT: u16 = 9615;
/// Websocket RPC port.
pub const RPC_WS_PORT: u16 = 9944;
/// HTTP RPC port.
pub const RPC_HTTP_PORT: u16 = 9933;
/// libp2p port.
pub const P2P_PORT: u16 = 30333;

/// Global launch timeout in seconds.
pub const DEFAULT_GLOBAL_TIMEOUT_SECS: u64 = 1200;
/// Default timeout for one assertion against a running node, in seconds.
pub const DEFAULT_INDIVIDUAL_TEST_TIMEOUT_SECS: u64 = 10;
/// Default per-node readiness budget, in seconds.
pub const DEFAULT_NODE_SPAWN_TIMEOUT_SECS: u64 = 300;

/// Relay chain binary.
pub const DEFAULT_COMMAND: &str = "polkadot";
/// Relay chain image.
pub const DEFAULT_IMAGE: &str = "parity/polkadot:latest";
/// Relay chain name.
pub const DEFAULT_CHAIN: &str = "rococo-local";
/// Collator image.
pub const DEFAULT_COLLATOR_IMAGE: &str = "parity/polkadot-parachain:latest";
/// Cumulus collator binary.
pub const DEFAULT_CUMULUS_COLLATOR_BIN: &str = "polkadot-parachain";
/// Test collator binaries that are not cumulus based.
pub const DEFAULT_ADDER_COLLATOR_BIN: &str = "adder-collator";
/// See [`DEFAULT_ADDER_COLLATOR_BIN`].
pub const UNDYING_COLLATOR_BIN: &str = "undying-collator";

/// Starting balance for generated accounts.
pub const DEFAULT_BALANCE: u128 = 2_000_000_000_000;
/// Bond used when the chain spec carries no staker to copy it from.
pub const FALLBACK_STAKING_BOND: u128 = 1_000_000_000_000;
/// Upper bound on nominations per generated nominator.
pub const DEFAULT_MAX_NOMINATIONS: usize = 24;
/// Metric name prefix.
pub const DEFAULT_PROMETHEUS_PREFIX: &str = "substrate";

/// Remote directory holding configuration files.
pub const DEFAULT_REMOTE_DIR: &str = "/cfg";
/// Remote directory holding chain data.
pub const DEFAULT_DATA_DIR: &str = "/data";
/// Remote directory holding the relay chain data of a collator.
pub const DEFAULT_RELAY_DATA_DIR: &str = "/relay-data";

/// Plain chain spec file name template.
pub const DEFAULT_CHAIN_SPEC: &str = "{{chainName}}-plain.json";
/// Raw chain spec file name template.
pub const DEFAULT_CHAIN_SPEC_RAW: &str = "{{chainName}}-raw.json";
/// Default command generating a plain chain spec.
pub const DEFAULT_CHAIN_SPEC_COMMAND: &str =
    "{{DEFAULT_COMMAND}} build-spec --chain {{chainName}} --disable-default-bootnode";
/// Subcommand exporting a parachain's genesis head.
pub const DEFAULT_GENESIS_GENERATE_SUBCOMMAND: &str = "export-genesis-state";
/// Subcommand exporting a parachain's validation code.
pub const DEFAULT_WASM_GENERATE_SUBCOMMAND: &str = "export-genesis-wasm";
/// Genesis head file name.
pub const GENESIS_STATE_FILENAME: &str = "genesis-state";
/// Validation code file name.
pub const GENESIS_WASM_FILENAME: &str = "genesis-wasm";
/// Placeholder for the provider's remote dir inside generator commands.
pub const CLIENT_REMOTE_DIR_PLACEHOLDER: &str = "{{CLIENT_REMOTE_DIR}}";

/// File whose presence releases a waiting container.
pub const FINISH_MAGIC_FILE: &str = "/tmp/finished.txt";
/// Init container used to receive files before the node starts.
pub const TRANSFER_CONTAINER_NAME: &str = "transfer-files-container";
/// Log line printed by the transfer container while it waits.
pub const TRANSFER_CONTAINER_WAIT_LOG: &str = "waiting for tar to finish";
/// Log line printed by a helper container once its command completed.
pub const NODE_CONTAINER_WAIT_LOG: &str = "waiting for copy files to finish";

/// Shell suffix that keeps a helper container alive until released.
pub fn wait_until_script_suffix() -> String {
    format!(
        "until [ -f {FINISH_MAGIC_FILE} ]; do echo {NODE_CONTAINER_WAIT_LOG}; sleep 1; done; echo copy files has finished"
    )
}

/// Name of the block time monitor companion.
pub const INTROSPECTOR_NAME: &str = "introspector";
/// Image of the block time monitor companion.
pub const INTROSPECTOR_IMAGE: &str = "docker.io/paritytech/polkadot-introspector:latest";
/// Prometheus port of the block time monitor.
pub const INTROSPECTOR_PORT: u16 = 65432;

/// Websocket URI template.
pub const WS_URI_PATTERN: &str = "ws://{{IP}}:{{PORT}}";
/// Metrics URI template.
pub const METRICS_URI_PATTERN: &str = "http://{{IP}}:{{PORT}}/metrics";
/// Loopback address.
pub const LOCALHOST: &str = "127.0.0.1";

/// Fills one of the URI templates.
pub fn render_uri(pattern: &str, ip: &str, port: u16) -> String {
    pattern.replace("{{IP}}", ip).replace("{{PORT}}", &port.to_string())
}

/// Well-known development accounts.
pub const DEV_ACCOUNTS: [&str; 8] = ["alice", "bob", "charlie", "dave", "eve", "ferdie", "one", "two"];

/// Flags owned by the orchestrator and the number of tokens each consumes.
pub const ARGS_TO_REMOVE: [(&str, usize); 16] = [
    ("alice", 1),
    ("bob", 1),
    ("charlie", 1),
    ("dave", 1),
    ("eve", 1),
    ("ferdie", 1),
    ("one", 1),
    ("two", 1),
    ("port", 2),
    ("prometheus-external", 1),
    ("ws-port", 2),
    ("rpc-port", 2),
    ("prometheus-port", 2),
    ("node-key", 2),
    ("d", 2),
    ("base-path", 2),
];

/// Environment every node starts with.
pub const DEFAULT_ENV: [(&str, &str); 2] = [("COLORBT_SHOW_HIDDEN", "1"), ("RUST_BACKTRACE", "FULL")];

/// Polling interval for container readiness.
pub const CONTAINER_READY_POLL: Duration = Duration::from_secs(3);
/// Polling interval for metrics and chain queries.
pub const METRIC_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Polling interval for parachain registration.
pub const PARACHAIN_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Pause after the first relay node and the first collator.
pub const BOOTNODE_SETTLE_DELAY: Duration = Duration::from_secs(2);
/// Timeout for a single metrics scrape.
pub const METRICS_FETCH_TIMEOUT: Duration = Duration::from_secs(2);
/// Polling interval for local process readiness.
pub const NATIVE_READY_POLL: Duration = Duration::from_secs(1);
/// Log line a node prints once its RPC server accepts connections.
pub const NATIVE_READY_MARKER: &str = "Listening for new connections";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_uri() {
        assert_eq!(render_uri(WS_URI_PATTERN, LOCALHOST, 9944), "ws://127.0.0.1:9944");
        assert_eq!(
            render_uri(METRICS_URI_PATTERN, "10.0.0.4", PROMETHEUS_PORT),
            "http://10.0.0.4:9615/metrics"
        );
    }

    #[test]
    fn test_wait_suffix_mentions_magic_file() {
        let suffix = wait_until_script_suffix();
        assert!(suffix.contains(FINISH_MAGIC_FILE));
        assert!(suffix.contains(NODE_CONTAINER_WAIT_LOG));
    }
}
