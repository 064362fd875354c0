//! Node RPC facade.
//!
//! The orchestrator only needs a handful of chain queries. They sit behind
//! [`RpcClient`] so node handles and the orchestrator can be driven by an
//! in-memory client in tests, or by a richer client that understands chain
//! storage.

use std::sync::Arc;

use async_trait::async_trait;
use parity_scale_codec::{Compact, Decode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{OrchestratorError, Result};

/// Queries against one running node.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Returns the node implementation name (`system_name`).
    async fn system_name(&self) -> Result<String>;

    /// Returns the ids of the parachains registered on the relay chain.
    async fn parachains(&self) -> Result<Vec<u32>>;

    /// Returns the block number of the latest head of `para_id`, if any.
    async fn para_block_height(&self, para_id: u32) -> Result<Option<u64>>;

    /// Registers a parachain through a sudo call signed by `seed`.
    async fn register_parachain(&self, para_id: u32, genesis_head: &str, validation_code: &str, seed: &str) -> Result<()>;
}

/// Opens [`RpcClient`]s by address.
#[async_trait]
pub trait RpcConnector: Send + Sync {
    /// Connects to the node at `uri` (`ws://` or `http://`).
    async fn connect(&self, uri: &str) -> Result<Arc<dyn RpcClient>>;

    /// Whether the clients handed out can register parachains.
    fn can_register_parachains(&self) -> bool {
        true
    }
}

/// A connector shared by every node handle.
pub type SharedRpcConnector = Arc<dyn RpcConnector>;

/// `Paras.Parachains`: twox128("Paras") ++ twox128("Parachains").
const PARAS_PARACHAINS_KEY: &str = "0xcd710b30bd2eab0352ddcc26417aa1940b76934f4cc08dee01012d059e1b83ee";

/// Prefix of the `Paras.Heads` map. Entries are keyed by
/// twox64(para_id) ++ para_id, so the id is readable from the key's tail.
const PARAS_HEADS_PREFIX: &str = "0xcd710b30bd2eab0352ddcc26417aa1941b3c252fcb29d88eff4f3de5de4476c3";

const KEYS_PAGE_SIZE: usize = 512;

/// JSON-RPC over HTTP.
///
/// Nodes serve HTTP and websocket RPC on the same port, so `ws://` URIs are
/// rewritten to `http://`. Parachain queries read relay chain storage
/// directly. Signed calls are not available through this client.
#[derive(Debug, Clone)]
pub struct HttpRpcClient {
    client: reqwest::Client,
    uri: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

impl HttpRpcClient {
    /// Creates a client for the node at `uri`.
    pub fn new(client: reqwest::Client, uri: &str) -> Self {
        Self {
            client,
            uri: http_uri(uri),
        }
    }

    /// Returns the HTTP endpoint.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Calls `method` and decodes its result.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        debug!(uri = %self.uri, method = %method, "RPC call");
        let body = json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params});
        let response: RpcResponse = self.client.post(&self.uri).json(&body).send().await?.json().await?;
        match (response.result, response.error) {
            (_, Some(err)) => Err(OrchestratorError::rpc(format!("{method}: {} ({})", err.message, err.code))),
            // A `null` result is a valid answer for optional values.
            (result, None) => serde_json::from_value(result.unwrap_or(Value::Null))
                .map_err(|e| OrchestratorError::rpc(format!("{method}: unexpected result: {e}"))),
        }
    }

    /// Reads the raw storage value under `key` at the best block.
    pub async fn storage(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value: Option<String> = self.call("state_getStorage", json!([key])).await?;
        value.as_deref().map(decode_hex).transpose()
    }

    /// Returns the `Paras.Heads` key of `para_id`, if the parachain has a head.
    async fn head_key(&self, para_id: u32) -> Result<Option<String>> {
        let mut start: Option<String> = None;
        loop {
            let keys: Vec<String> = self
                .call("state_getKeysPaged", json!([PARAS_HEADS_PREFIX, KEYS_PAGE_SIZE, start]))
                .await?;
            if let Some(key) = keys.iter().find(|k| is_head_key_of(k, para_id)) {
                return Ok(Some(key.clone()));
            }
            if keys.len() < KEYS_PAGE_SIZE {
                return Ok(None);
            }
            start = keys.last().cloned();
        }
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn system_name(&self) -> Result<String> {
        self.call("system_name", json!([])).await
    }

    async fn parachains(&self) -> Result<Vec<u32>> {
        match self.storage(PARAS_PARACHAINS_KEY).await? {
            Some(value) => decode_parachains(&value),
            None => Ok(Vec::new()),
        }
    }

    async fn para_block_height(&self, para_id: u32) -> Result<Option<u64>> {
        let Some(key) = self.head_key(para_id).await? else {
            return Ok(None);
        };
        match self.storage(&key).await? {
            Some(value) => head_block_number(&value).map(Some),
            None => Ok(None),
        }
    }

    async fn register_parachain(&self, _para_id: u32, _head: &str, _code: &str, _seed: &str) -> Result<()> {
        Err(OrchestratorError::capability_not_supported("signed extrinsics over HTTP RPC"))
    }
}

/// Connector producing [`HttpRpcClient`]s.
#[derive(Debug, Clone, Default)]
pub struct HttpRpcConnector {
    client: reqwest::Client,
}

impl HttpRpcConnector {
    /// Creates a connector sharing `client`.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RpcConnector for HttpRpcConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn RpcClient>> {
        Ok(Arc::new(HttpRpcClient::new(self.client.clone(), uri)))
    }

    fn can_register_parachains(&self) -> bool {
        false
    }
}

fn decode_hex(value: &str) -> Result<Vec<u8>> {
    hex::decode(value.trim_start_matches("0x")).map_err(|e| OrchestratorError::rpc(format!("storage value is not hex: {e}")))
}

fn scale_error(what: &str, e: parity_scale_codec::Error) -> OrchestratorError {
    OrchestratorError::rpc(format!("undecodable {what}: {e}"))
}

/// Decodes the SCALE `Vec<u32>` stored in `Paras.Parachains`.
fn decode_parachains(value: &[u8]) -> Result<Vec<u32>> {
    Vec::<u32>::decode(&mut &value[..]).map_err(|e| scale_error("parachain list", e))
}

/// Reads the block number out of a `Paras.Heads` value: the head data bytes
/// hold a header starting with the parent hash and the compact number.
fn head_block_number(value: &[u8]) -> Result<u64> {
    let head = Vec::<u8>::decode(&mut &value[..]).map_err(|e| scale_error("head data", e))?;
    let input = &mut &head[..];
    <[u8; 32]>::decode(input).map_err(|e| scale_error("parent hash", e))?;
    let number = <Compact<u32>>::decode(input).map_err(|e| scale_error("block number", e))?;
    Ok(u64::from(number.0))
}

fn is_head_key_of(key: &str, para_id: u32) -> bool {
    let id = hex::encode(para_id.to_le_bytes());
    key.len() == PARAS_HEADS_PREFIX.len() + 16 + id.len() && key.starts_with(PARAS_HEADS_PREFIX) && key.ends_with(&id)
}

fn http_uri(uri: &str) -> String {
    if let Some(rest) = uri.strip_prefix("ws://") {
        format!("http://{rest}")
    } else if let Some(rest) = uri.strip_prefix("wss://") {
        format!("https://{rest}")
    } else {
        uri.to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::provider::fake::FakeProvider;
    use crate::provider::Provider;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// In-memory chain state shared by every client it hands out.
    ///
    /// A chain hosted by a fake provider stops answering once that
    /// provider's namespace is destroyed.
    #[derive(Default)]
    pub(crate) struct FakeChain {
        pub parachains: Mutex<Vec<u32>>,
        pub heights: Mutex<HashMap<u32, u64>>,
        pub registrations: Mutex<Vec<(u32, String, String)>>,
        pub down: AtomicBool,
        /// Makes parachain queries fail as unsupported.
        pub no_storage: AtomicBool,
        host: Option<Arc<FakeProvider>>,
    }

    impl FakeChain {
        pub(crate) fn hosted_by(provider: Arc<FakeProvider>) -> Self {
            Self {
                host: Some(provider),
                ..Default::default()
            }
        }

        pub(crate) fn set_down(&self) {
            self.down.store(true, Ordering::SeqCst);
        }

        fn is_down(&self) -> bool {
            self.down.load(Ordering::SeqCst) || self.host.as_ref().is_some_and(|p| p.is_destroyed())
        }
    }

    pub(crate) struct FakeRpc(pub Arc<FakeChain>);

    #[async_trait]
    impl RpcClient for FakeRpc {
        async fn system_name(&self) -> Result<String> {
            if self.0.is_down() {
                return Err(OrchestratorError::rpc("connection refused"));
            }
            Ok("Parity Polkadot".to_string())
        }

        async fn parachains(&self) -> Result<Vec<u32>> {
            if self.0.no_storage.load(Ordering::SeqCst) {
                return Err(OrchestratorError::capability_not_supported("storage queries"));
            }
            if self.0.is_down() {
                return Err(OrchestratorError::rpc("connection refused"));
            }
            Ok(self.0.parachains.lock().unwrap().clone())
        }

        async fn para_block_height(&self, para_id: u32) -> Result<Option<u64>> {
            Ok(self.0.heights.lock().unwrap().get(&para_id).copied())
        }

        async fn register_parachain(&self, para_id: u32, head: &str, code: &str, _seed: &str) -> Result<()> {
            self.0.registrations.lock().unwrap().push((para_id, head.to_string(), code.to_string()));
            self.0.parachains.lock().unwrap().push(para_id);
            Ok(())
        }
    }

    #[async_trait]
    impl RpcConnector for Arc<FakeChain> {
        async fn connect(&self, _uri: &str) -> Result<Arc<dyn RpcClient>> {
            if self.is_down() {
                return Err(OrchestratorError::rpc("connection refused"));
            }
            Ok(Arc::new(FakeRpc(Arc::clone(self))))
        }
    }

    #[test]
    fn test_http_uri() {
        assert_eq!(http_uri("ws://127.0.0.1:9944"), "http://127.0.0.1:9944");
        assert_eq!(http_uri("wss://rpc.example.com"), "https://rpc.example.com");
        assert_eq!(http_uri("http://127.0.0.1:9933"), "http://127.0.0.1:9933");
    }

    #[tokio::test]
    async fn test_registration_is_not_supported_over_http() {
        let connector = HttpRpcConnector::default();
        assert!(!connector.can_register_parachains());
        assert!(chain_connector().can_register_parachains());

        let client = connector.connect("ws://127.0.0.1:9944").await.unwrap();
        let err = client.register_parachain(100, "0x1", "0x2", "//Alice").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::CapabilityNotSupported(_)));
    }

    fn chain_connector() -> Arc<FakeChain> {
        Arc::new(FakeChain::default())
    }

    #[test]
    fn test_decode_parachains() {
        use parity_scale_codec::Encode;

        let stored = vec![100u32, 2000].encode();
        assert_eq!(decode_parachains(&stored).unwrap(), vec![100, 2000]);
        assert_eq!(decode_parachains(&Vec::<u32>::new().encode()).unwrap(), Vec::<u32>::new());
        assert!(decode_parachains(&[0x08, 0x01]).is_err());
    }

    #[test]
    fn test_head_block_number() {
        use parity_scale_codec::Encode;

        let mut header = vec![7u8; 32];
        header.extend(Compact(1234u32).encode());
        header.extend([0u8; 64]);
        assert_eq!(head_block_number(&header.encode()).unwrap(), 1234);

        let genesis: Vec<u8> = [[0u8; 32].as_slice(), &Compact(0u32).encode()].concat();
        assert_eq!(head_block_number(&genesis.encode()).unwrap(), 0);
        assert!(head_block_number(&vec![1u8; 10].encode()).is_err());
    }

    #[test]
    fn test_head_key_matching() {
        let key = format!("{PARAS_HEADS_PREFIX}4213c2713e48b45264000000");
        assert!(is_head_key_of(&key, 100));
        assert!(!is_head_key_of(&key, 101));
        assert!(!is_head_key_of(&format!("{PARAS_PARACHAINS_KEY}4213c2713e48b45264000000"), 100));
        assert!(!is_head_key_of(&format!("{key}00"), 100));
        assert_eq!(decode_hex("0x0a0b").unwrap(), vec![10, 11]);
    }

    #[tokio::test]
    async fn test_fake_chain_registration() {
        let chain = Arc::new(FakeChain::default());
        let rpc = chain.connect("ws://x").await.unwrap();
        rpc.register_parachain(2000, "0x1", "0x2", "//Alice").await.unwrap();
        assert_eq!(rpc.parachains().await.unwrap(), vec![2000]);

        chain.set_down();
        assert!(chain.connect("ws://x").await.is_err());
    }

    #[tokio::test]
    async fn test_hosted_chain_goes_down_with_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeProvider::new(dir.path()));
        let chain = Arc::new(FakeChain::hosted_by(Arc::clone(&provider)));
        let rpc = chain.connect("ws://x").await.unwrap();
        assert!(rpc.system_name().await.is_ok());

        provider.destroy_namespace().await.unwrap();
        assert!(rpc.system_name().await.is_err());
        assert!(chain.connect("ws://x").await.is_err());
    }
}
