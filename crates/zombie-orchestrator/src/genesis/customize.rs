//! Relay chain and parachain genesis customization sequences.

use serde_json::{json, Value};
use tracing::{info, warn};

use super::mutator::{
    add_aura_authority, add_authority, add_balances, add_collator_selection, add_grandpa_authority, add_hrmp_channels,
    add_para_custom, add_staking, change_genesis_config, clear_authorities, generate_nominators,
};
use super::{has_session_keys, runtime_config, ChainSpec};
use crate::config::CompilationContext;
use crate::error::Result;
use crate::keys::KeyGenerator;
use crate::topology::{HrmpChannel, Parachain, RelayChain};

/// Turns the relay chain's plain spec into the genesis of this network.
///
/// Overrides are applied first, then the spec's own authorities are replaced
/// by the validators of `relay`.
pub async fn customize_relay_spec(
    spec: &ChainSpec,
    relay: &RelayChain,
    hrmp_channels: &[HrmpChannel],
    keys: &dyn KeyGenerator,
    ctx: &mut CompilationContext,
) -> Result<()> {
    let doc = spec.read().await?;
    let session = runtime_config(&doc).map(has_session_keys).unwrap_or(false);

    if let Some(overrides) = &relay.genesis_overrides {
        change_genesis_config(spec, overrides).await?;
    }

    clear_authorities(spec, relay.flavor, ctx).await?;
    add_balances(spec, &relay.nodes, ctx).await?;

    for node in relay.nodes.iter().filter(|n| n.validator) {
        if session {
            add_authority(spec, node, relay.flavor, true).await?;
        } else {
            add_aura_authority(spec, node).await?;
            add_grandpa_authority(spec, node).await?;
        }
        add_staking(spec, node, ctx).await?;
    }

    if relay.random_nominators_count > 0 {
        generate_nominators(spec, relay.random_nominators_count, relay.max_nominations, keys, ctx).await?;
    }

    if !hrmp_channels.is_empty() {
        add_hrmp_channels(spec, hrmp_channels).await?;
    }

    info!(chain = %relay.chain, "Customized relay chain spec");
    Ok(())
}

/// Turns a parachain's plain spec into the genesis of this network.
///
/// Raw specs are left untouched. `relay_chain_id` is the `id` of the relay
/// chain spec the parachain attaches to.
pub async fn customize_parachain_spec(
    spec: &ChainSpec,
    para: &Parachain,
    relay_chain_id: &str,
    ctx: &mut CompilationContext,
) -> Result<()> {
    if spec.is_raw().await? {
        warn!(para_id = para.id, "Parachain chain spec is raw, can not customize");
        return Ok(());
    }

    let para_id = para.id;
    spec.update(|doc| {
        set_para_id(doc, para_id);
        if let Some(relay) = doc.get_mut("relay_chain") {
            *relay = Value::String(relay_chain_id.to_string());
        }
        Ok(())
    })
    .await?;
    let session = spec
        .update_runtime(|runtime| {
            if let Some(id) = runtime.pointer_mut("/parachainInfo/parachainId") {
                *id = json!(para_id);
            }
            Ok(has_session_keys(runtime))
        })
        .await?;

    clear_authorities(spec, para.flavor, ctx).await?;

    for node in para.collators.iter().filter(|n| n.validator) {
        if session {
            add_authority(spec, node, para.flavor, false).await?;
        } else {
            add_aura_authority(spec, node).await?;
        }
        add_collator_selection(spec, node).await?;
        add_para_custom(spec, node, para.flavor, ctx).await?;
    }

    if let Some(overrides) = &para.genesis_overrides {
        change_genesis_config(spec, overrides).await?;
    }

    info!(para_id, "Customized parachain chain spec");
    Ok(())
}

/// Rewrites the top-level para id of a (possibly raw) parachain spec.
pub async fn fix_para_id(spec: &ChainSpec, para_id: u32) -> Result<()> {
    spec.update(|doc| {
        set_para_id(doc, para_id);
        Ok(())
    })
    .await
}

fn set_para_id(doc: &mut Value, para_id: u32) {
    for key in ["para_id", "paraId"] {
        if let Some(id) = doc.get_mut(key) {
            *id = json!(para_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::value_as_u128;
    use crate::keys::tests::FakeKeyGenerator;
    use crate::topology::{ChainFlavor, ChainSpecSource, GenesisArtifact, Node, NodeRole};

    async fn validator(name: &str, role: NodeRole) -> Node {
        let accounts = FakeKeyGenerator.accounts_for(&format!("//{name}")).await.unwrap();
        Node::builder(name, role)
            .validator(true)
            .balance(2_000_000_000_000)
            .accounts(accounts)
            .build()
    }

    async fn write_spec(dir: &std::path::Path, name: &str, doc: Value) -> ChainSpec {
        let spec = ChainSpec::new(dir.join(name));
        spec.write(&doc).await.unwrap();
        spec
    }

    #[tokio::test]
    async fn test_customize_relay_spec() {
        let dir = tempfile::tempdir().unwrap();
        let spec = write_spec(
            dir.path(),
            "rococo-local-plain.json",
            json!({
                "id": "rococo_local_testnet",
                "genesis": {"runtime": {
                    "session": {"keys": [["x", "x", {}]]},
                    "balances": {"balances": [["x", 1]]},
                    "staking": {"stakers": [["x", "x", 1_000_000_000_000_000u64, "Validator"]], "invulnerables": [], "validatorCount": 1},
                    "configuration": {"config": {"max_validators": 10}},
                    "hrmp": {"preopenHrmpChannels": []}
                }}
            }),
        )
        .await;

        let relay = RelayChain {
            chain: "rococo-local".to_string(),
            image: "parity/polkadot:latest".into(),
            command: "polkadot".to_string(),
            chain_spec: ChainSpecSource::Command("polkadot build-spec".to_string()),
            flavor: ChainFlavor::Generic,
            genesis_overrides: Some(json!({"runtime": {"configuration": {"config": {"max_validators": 2}}}})),
            random_nominators_count: 0,
            max_nominations: 24,
            nodes: vec![validator("alice", NodeRole::Node).await, validator("bob", NodeRole::Node).await],
        };
        let channels = [HrmpChannel { sender: 100, recipient: 101, max_capacity: 8, max_message_size: 512 }];
        let mut ctx = CompilationContext::new();

        customize_relay_spec(&spec, &relay, &channels, &FakeKeyGenerator, &mut ctx).await.unwrap();

        assert_eq!(ctx.default_bond, Some(1_000_000_000_000_000));
        let doc = spec.read().await.unwrap();
        let runtime = &doc["genesis"]["runtime"];
        assert_eq!(runtime["session"]["keys"].as_array().unwrap().len(), 2);
        assert_eq!(runtime["staking"]["validatorCount"], json!(2));
        assert_eq!(runtime["configuration"]["config"]["max_validators"], json!(2));
        assert_eq!(runtime["hrmp"]["preopenHrmpChannels"], json!([[100, 101, 8, 512]]));

        let balances = runtime["balances"]["balances"].as_array().unwrap();
        assert_eq!(balances.len(), 3);
        assert_eq!(value_as_u128(&balances[1][1]), Some(1_000_000_000_000_001));
    }

    #[tokio::test]
    async fn test_customize_parachain_spec() {
        let dir = tempfile::tempdir().unwrap();
        let spec = write_spec(
            dir.path(),
            "asset-hub_rococo-local-1000.json",
            json!({
                "id": "asset-hub",
                "para_id": 1,
                "relay_chain": "polkadot",
                "genesis": {"runtime": {
                    "parachainInfo": {"parachainId": 1},
                    "aura": {"authorities": ["x"]},
                    "collatorSelection": {"invulnerables": ["x"]}
                }}
            }),
        )
        .await;

        let collator = validator("collator", NodeRole::CumulusCollator).await;
        let sr = collator.accounts.as_ref().unwrap().sr_account.address.clone();
        let para = Parachain {
            id: 1000,
            chain: Some("asset-hub".to_string()),
            add_to_genesis: true,
            cumulus_based: true,
            genesis_state: GenesisArtifact::Generate("polkadot-parachain export-genesis-state".to_string()),
            genesis_wasm: GenesisArtifact::Generate("polkadot-parachain export-genesis-wasm".to_string()),
            chain_spec: None,
            flavor: ChainFlavor::Generic,
            genesis_overrides: None,
            collators: vec![collator],
        };
        let mut ctx = CompilationContext::new();

        customize_parachain_spec(&spec, &para, "rococo_local_testnet", &mut ctx).await.unwrap();

        let doc = spec.read().await.unwrap();
        assert_eq!(doc["para_id"], json!(1000));
        assert_eq!(doc["relay_chain"], json!("rococo_local_testnet"));
        assert_eq!(doc["genesis"]["runtime"]["parachainInfo"]["parachainId"], json!(1000));
        assert_eq!(doc["genesis"]["runtime"]["aura"]["authorities"], json!([sr.clone()]));
        assert_eq!(doc["genesis"]["runtime"]["collatorSelection"]["invulnerables"], json!([sr]));
    }

    #[tokio::test]
    async fn test_raw_parachain_spec_is_copied_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let raw = json!({"id": "p", "para_id": 5, "genesis": {"raw": {"top": {}}}});
        let spec = write_spec(dir.path(), "raw.json", raw.clone()).await;
        let para = Parachain {
            id: 2000,
            chain: None,
            add_to_genesis: true,
            cumulus_based: true,
            genesis_state: GenesisArtifact::Generate(String::new()),
            genesis_wasm: GenesisArtifact::Generate(String::new()),
            chain_spec: None,
            flavor: ChainFlavor::Generic,
            genesis_overrides: None,
            collators: vec![],
        };
        customize_parachain_spec(&spec, &para, "r", &mut CompilationContext::new()).await.unwrap();
        assert_eq!(spec.read().await.unwrap(), raw);

        fix_para_id(&spec, 2000).await.unwrap();
        assert_eq!(spec.read().await.unwrap()["para_id"], json!(2000));
    }
}
