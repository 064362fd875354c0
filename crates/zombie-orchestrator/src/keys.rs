//! Account generation and keystore files.
//!
//! Key derivation itself is delegated to a [`KeyGenerator`]. The default
//! implementation shells out to `subkey` (or `polkadot key`), which every
//! node image and most developer machines already ship.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::topology::ChainFlavor;

/// Key types written to the keystore when a node does not pick its own.
pub const DEFAULT_KEYSTORE_KEY_TYPES: [&str; 11] = [
    "aura", "babe", "imon", "gran", "audi", "asgn", "para", "beef", "nmbs", "rand", "rate",
];

/// An address and its public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// SS58 (or hex for ethereum accounts) address.
    pub address: String,
    /// `0x` prefixed public key.
    pub public_key: String,
}

/// Every account generated for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAccounts {
    /// Derivation seed, e.g. `//Alice`.
    pub seed: String,
    /// sr25519 account.
    pub sr_account: Account,
    /// sr25519 stash account (`<seed>//stash`).
    pub sr_stash: Account,
    /// ed25519 account.
    pub ed_account: Account,
    /// ecdsa account.
    pub ec_account: Account,
    /// Ethereum account, for address mapping chains.
    pub eth_account: Option<Account>,
}

/// Derives accounts and peer ids.
#[async_trait]
pub trait KeyGenerator: Send + Sync {
    /// Derives every account of a node from its seed.
    async fn accounts_for(&self, seed: &str) -> Result<NodeAccounts>;

    /// Derives a single sr25519 account.
    async fn account_from_seed(&self, seed: &str) -> Result<Account>;

    /// Returns the libp2p peer id of a hex encoded node key.
    async fn peer_id(&self, node_key: &str) -> Result<String>;
}

/// [`KeyGenerator`] backed by the `subkey` CLI.
#[derive(Debug, Clone)]
pub struct SubkeyKeyGenerator {
    program: String,
    prefix_args: Vec<String>,
}

impl Default for SubkeyKeyGenerator {
    fn default() -> Self {
        Self::new("subkey")
    }
}

impl SubkeyKeyGenerator {
    /// Uses the given binary. `polkadot` is invoked through its `key` subcommand.
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        let prefix_args = if program.ends_with("subkey") {
            Vec::new()
        } else {
            vec!["key".to_string()]
        };
        Self { program, prefix_args }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!(program = %self.program, ?args, "Running key helper");
        let output = Command::new(&self.program)
            .args(&self.prefix_args)
            .args(args)
            .output()
            .await
            .map_err(|e| OrchestratorError::key_generation(format!("can not run {}: {e}", self.program)))?;

        if !output.status.success() {
            return Err(OrchestratorError::key_generation(format!(
                "{} {} failed: {}",
                self.program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn inspect(&self, scheme: &str, uri: &str) -> Result<Account> {
        let out = self
            .run(&["inspect", "--scheme", scheme, "--output-type", "json", uri])
            .await?;
        parse_inspect_output(&out, scheme == "ecdsa")
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InspectOutput {
    public_key: String,
    ss58_address: String,
    #[serde(default)]
    ss58_public_key: Option<String>,
}

fn parse_inspect_output(out: &str, prefer_public_key_address: bool) -> Result<Account> {
    let parsed: InspectOutput = serde_json::from_str(out)
        .map_err(|e| OrchestratorError::key_generation(format!("unexpected inspect output: {e}")))?;
    let address = match parsed.ss58_public_key {
        Some(pk) if prefer_public_key_address => pk,
        _ => parsed.ss58_address,
    };
    Ok(Account {
        address,
        public_key: parsed.public_key,
    })
}

#[async_trait]
impl KeyGenerator for SubkeyKeyGenerator {
    async fn accounts_for(&self, seed: &str) -> Result<NodeAccounts> {
        Ok(NodeAccounts {
            seed: seed.to_string(),
            sr_account: self.inspect("sr25519", seed).await?,
            sr_stash: self.inspect("sr25519", &format!("{seed}//stash")).await?,
            ed_account: self.inspect("ed25519", seed).await?,
            ec_account: self.inspect("ecdsa", seed).await?,
            eth_account: None,
        })
    }

    async fn account_from_seed(&self, seed: &str) -> Result<Account> {
        self.inspect("sr25519", seed).await
    }

    async fn peer_id(&self, node_key: &str) -> Result<String> {
        let mut file = tempfile::NamedTempFile::new()?;
        std::io::Write::write_all(&mut file, node_key.as_bytes())?;
        let path = file.path().to_string_lossy().to_string();
        self.run(&["inspect-node-key", "--file", &path]).await
    }
}

/// One keystore file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeystoreEntry {
    /// `hex(key_type)` followed by the public key without `0x`.
    pub file_name: String,
    /// The quoted seed.
    pub content: String,
}

/// Computes the keystore files of a node.
///
/// When `key_types` names none of the known types every default type is used.
pub fn keystore_entries(accounts: &NodeAccounts, flavor: ChainFlavor, key_types: &[String]) -> Vec<KeystoreEntry> {
    let selected: Vec<&str> = DEFAULT_KEYSTORE_KEY_TYPES
        .iter()
        .copied()
        .filter(|t| key_types.iter().any(|k| k == t))
        .collect();
    let selected = if selected.is_empty() {
        DEFAULT_KEYSTORE_KEY_TYPES.to_vec()
    } else {
        selected
    };

    selected
        .into_iter()
        .map(|key_type| {
            let account = match key_type {
                "aura" if flavor == ChainFlavor::AlternateAura => &accounts.ed_account,
                "gran" | "rate" => &accounts.ed_account,
                "beef" => &accounts.ec_account,
                _ => &accounts.sr_account,
            };
            KeystoreEntry {
                file_name: format!(
                    "{}{}",
                    hex::encode(key_type),
                    account.public_key.trim_start_matches("0x")
                ),
                content: format!("\"{}\"", accounts.seed),
            }
        })
        .collect()
}

/// Writes the keystore files of a node under `<dir>/keystore`.
pub async fn write_keystore(dir: &Path, entries: &[KeystoreEntry]) -> Result<Vec<PathBuf>> {
    let keystore = dir.join("keystore");
    tokio::fs::create_dir_all(&keystore).await?;

    let mut paths = Vec::with_capacity(entries.len());
    for entry in entries {
        let path = keystore.join(&entry.file_name);
        tokio::fs::write(&path, &entry.content).await?;
        paths.push(path);
    }
    Ok(paths)
}
