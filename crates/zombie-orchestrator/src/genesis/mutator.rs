//! Operations over the runtime genesis config of a plain chain spec.
//!
//! Each public operation reads the whole document, applies one change and
//! writes it back through [`ChainSpec::update_runtime`]. The document edits
//! themselves are plain functions over the runtime `Value` so they compose
//! in tests without touching the filesystem.

use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::{number_from_u128, runtime_config_mut, value_as_u128, ChainSpec};
use crate::config::CompilationContext;
use crate::constants::FALLBACK_STAKING_BOND;
use crate::error::{OrchestratorError, Result};
use crate::keys::{Account, KeyGenerator, NodeAccounts};
use crate::topology::{ChainFlavor, HrmpChannel, Node};

/// Removes every authority, staker and invulnerable from the genesis config.
///
/// The bond of the first relay staker (and, for address-mapping chains, of the
/// first parachain staking candidate) is recorded in `ctx` so authorities added
/// afterwards bond the same amount.
pub async fn clear_authorities(spec: &ChainSpec, flavor: ChainFlavor, ctx: &mut CompilationContext) -> Result<()> {
    spec.update_runtime(|runtime| {
        clear(runtime, flavor, ctx);
        Ok(())
    })
    .await?;
    info!(spec = %spec.path().display(), "Cleared authorities");
    Ok(())
}

/// Appends `node`'s session keys (or author mapping) to the genesis config.
///
/// `use_stash` selects the stash account as the controller address, which is
/// what relay chains expect; parachains use the plain sr25519 account.
pub async fn add_authority(spec: &ChainSpec, node: &Node, flavor: ChainFlavor, use_stash: bool) -> Result<()> {
    let accounts = accounts_of(node)?;
    spec.update_runtime(|runtime| push_authority(runtime, accounts, flavor, use_stash)).await?;
    info!(node = %node.name, "Added genesis authority");
    Ok(())
}

/// Appends `node`'s sr25519 address to `aura.authorities`.
pub async fn add_aura_authority(spec: &ChainSpec, node: &Node) -> Result<()> {
    let accounts = accounts_of(node)?;
    spec.update_runtime(|runtime| {
        let address = Value::String(accounts.sr_account.address.clone());
        if !push_at(runtime, &["aura", "authorities"], address) {
            warn!(node = %node.name, "No aura authorities in genesis, skipping");
        }
        Ok(())
    })
    .await
}

/// Appends `node`'s ed25519 address to `grandpa.authorities`.
pub async fn add_grandpa_authority(spec: &ChainSpec, node: &Node) -> Result<()> {
    let accounts = accounts_of(node)?;
    spec.update_runtime(|runtime| {
        let entry = json!([accounts.ed_account.address, 1]);
        if !push_at(runtime, &["grandpa", "authorities"], entry) {
            warn!(node = %node.name, "No grandpa authorities in genesis, skipping");
        }
        Ok(())
    })
    .await
}

/// Adds `node` as a staking validator, bonding the recorded default bond.
pub async fn add_staking(spec: &ChainSpec, node: &Node, ctx: &CompilationContext) -> Result<()> {
    let accounts = accounts_of(node)?;
    let bond = ctx.default_bond.unwrap_or(FALLBACK_STAKING_BOND);
    spec.update_runtime(|runtime| {
        push_staker(runtime, accounts, bond, node.invulnerable);
        Ok(())
    })
    .await
}

/// Adds `node` to `collatorSelection.invulnerables` when that list exists.
pub async fn add_collator_selection(spec: &ChainSpec, node: &Node) -> Result<()> {
    let accounts = accounts_of(node)?;
    spec.update_runtime(|runtime| {
        let address = Value::String(accounts.sr_account.address.clone());
        if push_at(runtime, &["collatorSelection", "invulnerables"], address) {
            debug!(node = %node.name, "Added collator selection invulnerable");
        }
        Ok(())
    })
    .await
}

/// Adds `node` as a parachain staking candidate on address-mapping chains.
pub async fn add_para_custom(spec: &ChainSpec, node: &Node, flavor: ChainFlavor, ctx: &CompilationContext) -> Result<()> {
    if flavor != ChainFlavor::AddressMapping {
        return Ok(());
    }
    let accounts = accounts_of(node)?;
    let bond = ctx.para_bond.unwrap_or(FALLBACK_STAKING_BOND);
    spec.update_runtime(|runtime| push_candidate(runtime, accounts, bond)).await
}

/// Funds every node carrying a non-zero balance.
///
/// Validators are funded with at least the recorded bond plus one so they can
/// cover their own stake.
pub async fn add_balances(spec: &ChainSpec, nodes: &[Node], ctx: &CompilationContext) -> Result<()> {
    let funded = spec
        .update_runtime(|runtime| Ok(push_balances(runtime, nodes, ctx.default_bond)))
        .await?;
    info!(accounts = funded, "Added genesis balances");
    Ok(())
}

/// Generates `count` funded nominators, each backing a random subset of the
/// current staking validators.
pub async fn generate_nominators(
    spec: &ChainSpec,
    count: usize,
    max_nominations: usize,
    keys: &dyn KeyGenerator,
    ctx: &CompilationContext,
) -> Result<()> {
    let mut nominators = Vec::with_capacity(count);
    for i in 0..count {
        nominators.push(keys.account_from_seed(&format!("nom-{i}")).await?);
    }
    let bond = ctx.default_bond.unwrap_or(FALLBACK_STAKING_BOND);
    spec.update_runtime(|runtime| {
        push_nominators(runtime, &nominators, bond, max_nominations, &mut rand::thread_rng());
        Ok(())
    })
    .await?;
    info!(count, "Added random nominators");
    Ok(())
}

/// Merges `patch` into the genesis by existing keys only.
///
/// Objects are merged recursively, any other value overwrites the target.
/// Keys the document lacks are logged and skipped. Top-level keys missing
/// from `genesis` are also looked up in the runtime genesis config.
pub async fn change_genesis_config(spec: &ChainSpec, patch: &Value) -> Result<()> {
    let path = spec.path().display().to_string();
    spec.update(|doc| {
        if super::is_raw(doc) {
            return Err(OrchestratorError::chain_spec_invalid(format!(
                "{path} is a raw chain spec and can not be customized"
            )));
        }
        apply_genesis_patch(doc, patch);
        Ok(())
    })
    .await
}

/// Registers a parachain in the relay chain genesis.
pub async fn add_parachain_to_genesis(spec: &ChainSpec, para_id: u32, head: &str, wasm: &str) -> Result<()> {
    spec.update_runtime(|runtime| {
        let entry = json!([para_id, [head.trim(), wasm.trim(), true]]);
        if push_at(runtime, &["paras", "paras"], entry.clone())
            || push_at(runtime, &["parachainsParas", "paras"], entry)
        {
            Ok(())
        } else {
            Err(OrchestratorError::genesis_schedule(format!(
                "can not register parachain {para_id}: no paras in genesis"
            )))
        }
    })
    .await?;
    info!(para_id, "Added parachain to genesis");
    Ok(())
}

/// Pre-opens HRMP channels in the relay chain genesis.
pub async fn add_hrmp_channels(spec: &ChainSpec, channels: &[HrmpChannel]) -> Result<()> {
    spec.update_runtime(|runtime| {
        for ch in channels {
            let entry = json!([ch.sender, ch.recipient, ch.max_capacity, ch.max_message_size]);
            if !push_at(runtime, &["hrmp", "preopenHrmpChannels"], entry.clone())
                && !push_at(runtime, &["parachainsHrmp", "preopenHrmpChannels"], entry)
            {
                return Err(OrchestratorError::genesis_schedule(
                    "can not open hrmp channels: no hrmp in genesis",
                ));
            }
        }
        Ok(())
    })
    .await?;
    info!(channels = channels.len(), "Added hrmp channels");
    Ok(())
}

/// Replaces the document's boot nodes with the de-duplicated `addresses`.
///
/// Boot nodes live outside the genesis, so raw documents are accepted.
pub async fn add_boot_nodes(spec: &ChainSpec, addresses: &[String]) -> Result<()> {
    spec.update(|doc| {
        let mut unique: Vec<Value> = Vec::with_capacity(addresses.len());
        for addr in addresses {
            let addr = Value::String(addr.clone());
            if !unique.contains(&addr) {
                unique.push(addr);
            }
        }
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("bootNodes".to_string(), Value::Array(unique));
        }
        Ok(())
    })
    .await?;
    info!(count = addresses.len(), "Updated chain spec boot nodes");
    Ok(())
}

/// Builds the session key entry registered for one authority.
pub fn session_key(accounts: &NodeAccounts, flavor: ChainFlavor, use_stash: bool) -> Value {
    let address = if use_stash {
        &accounts.sr_stash.address
    } else {
        &accounts.sr_account.address
    };
    let sr = &accounts.sr_account.address;
    let aura = match flavor {
        ChainFlavor::AlternateAura => &accounts.ed_account.address,
        _ => sr,
    };
    json!([
        address,
        address,
        {
            "grandpa": accounts.ed_account.address,
            "babe": sr,
            "im_online": sr,
            "parachain_validator": sr,
            "authority_discovery": sr,
            "para_validator": sr,
            "para_assignment": sr,
            "beefy": accounts.ec_account.address,
            "aura": aura,
        }
    ])
}

fn accounts_of(node: &Node) -> Result<&NodeAccounts> {
    node.accounts
        .as_ref()
        .ok_or_else(|| OrchestratorError::key_generation(format!("node {} has no generated accounts", node.name)))
}

// Walks `path` through nested objects.
fn lookup_mut<'a>(value: &'a mut Value, path: &[&str]) -> Option<&'a mut Value> {
    path.iter().try_fold(value, |v, key| v.get_mut(*key))
}

fn set_at(runtime: &mut Value, path: &[&str], value: Value) {
    if let Some(target) = lookup_mut(runtime, path) {
        *target = value;
    }
}

// Pushes onto the array at `path`; false when the array does not exist.
fn push_at(runtime: &mut Value, path: &[&str], value: Value) -> bool {
    match lookup_mut(runtime, path).and_then(Value::as_array_mut) {
        Some(list) => {
            list.push(value);
            true
        }
        None => false,
    }
}

fn session_keys_mut(runtime: &mut Value) -> Option<&mut Vec<Value>> {
    let section = if runtime.get("session").is_some() { "session" } else { "palletSession" };
    lookup_mut(runtime, &[section, "keys"]).and_then(Value::as_array_mut)
}

pub(super) fn clear(runtime: &mut Value, flavor: ChainFlavor, ctx: &mut CompilationContext) {
    if let Some(keys) = session_keys_mut(runtime) {
        keys.clear();
    }
    set_at(runtime, &["aura", "authorities"], json!([]));
    set_at(runtime, &["grandpa", "authorities"], json!([]));
    set_at(runtime, &["collatorSelection", "invulnerables"], json!([]));

    if let Some(staking) = runtime.get_mut("staking").and_then(Value::as_object_mut) {
        if let Some(bond) = staking.get("stakers").and_then(|s| s.pointer("/0/2")).and_then(value_as_u128) {
            ctx.default_bond = Some(bond);
        }
        staking.insert("stakers".to_string(), json!([]));
        staking.insert("invulnerables".to_string(), json!([]));
        staking.insert("validatorCount".to_string(), json!(0));
    }

    if flavor == ChainFlavor::AddressMapping {
        set_at(runtime, &["authorMapping", "mappings"], json!([]));
        if let Some(staking) = runtime.get_mut("parachainStaking").and_then(Value::as_object_mut) {
            if let Some(bond) = staking.get("candidates").and_then(|c| c.pointer("/0/1")).and_then(value_as_u128) {
                ctx.para_bond = Some(bond);
            }
            staking.insert("candidates".to_string(), json!([]));
            staking.insert("delegations".to_string(), json!([]));
        }
    }
}

pub(super) fn push_authority(
    runtime: &mut Value,
    accounts: &NodeAccounts,
    flavor: ChainFlavor,
    use_stash: bool,
) -> Result<()> {
    if flavor == ChainFlavor::AddressMapping {
        let eth = accounts
            .eth_account
            .as_ref()
            .ok_or_else(|| OrchestratorError::key_generation("author mapping needs an ethereum account"))?;
        let entry = json!([accounts.sr_account.address, eth.address]);
        if !push_at(runtime, &["authorMapping", "mappings"], entry) {
            warn!("No author mapping in genesis, skipping");
        }
        return Ok(());
    }

    match session_keys_mut(runtime) {
        Some(keys) => keys.push(session_key(accounts, flavor, use_stash)),
        None => warn!("No session keys in genesis, skipping"),
    }
    Ok(())
}

pub(super) fn push_staker(runtime: &mut Value, accounts: &NodeAccounts, bond: u128, invulnerable: bool) {
    let Some(staking) = runtime.get_mut("staking").and_then(Value::as_object_mut) else {
        return;
    };
    let stash = &accounts.sr_stash.address;
    if let Some(stakers) = staking.get_mut("stakers").and_then(Value::as_array_mut) {
        stakers.push(json!([stash, accounts.sr_account.address, number_from_u128(bond), "Validator"]));
    }
    let count = staking.get("validatorCount").and_then(Value::as_u64).unwrap_or(0);
    staking.insert("validatorCount".to_string(), json!(count + 1));
    if invulnerable {
        if let Some(list) = staking.get_mut("invulnerables").and_then(Value::as_array_mut) {
            list.push(Value::String(stash.clone()));
        }
    }
}

fn push_candidate(runtime: &mut Value, accounts: &NodeAccounts, bond: u128) -> Result<()> {
    let eth = accounts
        .eth_account
        .as_ref()
        .ok_or_else(|| OrchestratorError::key_generation("parachain staking needs an ethereum account"))?;
    push_at(
        runtime,
        &["parachainStaking", "candidates"],
        json!([eth.address, number_from_u128(bond)]),
    );
    Ok(())
}

pub(super) fn push_balances(runtime: &mut Value, nodes: &[Node], default_bond: Option<u128>) -> usize {
    let Some(balances) = lookup_mut(runtime, &["balances", "balances"]).and_then(Value::as_array_mut) else {
        warn!("No balances in genesis, skipping");
        return 0;
    };
    let mut funded = 0;
    for node in nodes.iter().filter(|n| n.balance > 0) {
        let Some(accounts) = node.accounts.as_ref() else {
            continue;
        };
        let amount = match default_bond {
            Some(bond) if node.validator => node.balance.max(bond.saturating_add(1)),
            _ => node.balance,
        };
        balances.push(json!([accounts.sr_stash.address, number_from_u128(amount)]));
        funded += 1;
    }
    funded
}

pub(super) fn push_nominators(
    runtime: &mut Value,
    nominators: &[Account],
    bond: u128,
    max_nominations: usize,
    rng: &mut impl Rng,
) {
    let validators: Vec<Value> = runtime
        .pointer("/staking/stakers")
        .and_then(Value::as_array)
        .map(|stakers| stakers.iter().filter_map(|s| s.get(0).cloned()).collect())
        .unwrap_or_default();
    if validators.is_empty() || runtime.get("staking").is_none() {
        return;
    }

    let funded = number_from_u128(bond.saturating_add(1));
    for nominator in nominators {
        let mut count = if max_nominations == 0 { 0 } else { rng.gen_range(0..max_nominations) };
        if count == 0 {
            count = 1;
        }
        let targets: Vec<Value> = validators.choose_multiple(rng, count).cloned().collect();
        push_at(runtime, &["balances", "balances"], json!([nominator.address, funded]));
        push_at(
            runtime,
            &["staking", "stakers"],
            json!([nominator.address, nominator.address, number_from_u128(bond), {"Nominator": targets}]),
        );
    }
}

pub(super) fn apply_genesis_patch(doc: &mut Value, patch: &Value) {
    let Some(patch) = patch.as_object() else {
        warn!("Genesis override is not an object, skipping");
        return;
    };
    for (key, value) in patch {
        let in_genesis = doc.get("genesis").and_then(|g| g.get(key)).is_some();
        let target = if in_genesis {
            doc.get_mut("genesis")
        } else {
            runtime_config_mut(doc).filter(|r| r.get(key).is_some())
        };
        match target.and_then(Value::as_object_mut) {
            Some(target) => merge_existing(target, key, value),
            None => warn!(key = %key, "Genesis key not found in chain spec, skipping"),
        }
    }
}

fn merge_existing(target: &mut Map<String, Value>, key: &str, value: &Value) {
    let Some(current) = target.get_mut(key) else {
        warn!(key = %key, "Genesis key not found in chain spec, skipping");
        return;
    };
    match (current.as_object_mut(), value.as_object()) {
        (Some(current), Some(patch)) => {
            for (k, v) in patch {
                merge_existing(current, k, v);
            }
        }
        _ => {
            debug!(key = %key, "Overriding genesis value");
            *current = value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::tests::FakeKeyGenerator;
    use crate::topology::NodeRole;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    async fn node(name: &str, validator: bool) -> Node {
        let accounts = FakeKeyGenerator.accounts_for(&format!("//{name}")).await.unwrap();
        Node::builder(name, NodeRole::Node)
            .validator(validator)
            .accounts(accounts)
            .build()
    }

    fn relay_runtime() -> Value {
        json!({
            "session": {"keys": [["old", "old", {}], ["older", "older", {}]]},
            "grandpa": {"authorities": [["x", 1]]},
            "balances": {"balances": [], "totalIssuance": 10},
            "staking": {
                "stakers": [["a", "b", 5000, "Validator"]],
                "invulnerables": ["a"],
                "validatorCount": 1
            }
        })
    }

    #[tokio::test]
    async fn test_clear_then_add_keeps_only_added_authorities() {
        let mut runtime = relay_runtime();
        let mut ctx = CompilationContext::new();
        clear(&mut runtime, ChainFlavor::Generic, &mut ctx);
        assert_eq!(ctx.default_bond, Some(5000));
        assert_eq!(runtime["staking"]["validatorCount"], json!(0));
        assert_eq!(runtime["grandpa"]["authorities"], json!([]));

        let alice = node("alice", true).await;
        let bob = node("bob", true).await;
        for n in [&alice, &bob] {
            push_authority(&mut runtime, n.accounts.as_ref().unwrap(), ChainFlavor::Generic, true).unwrap();
        }

        let keys = runtime["session"]["keys"].as_array().unwrap();
        assert_eq!(keys.len(), 2);
        let alice_stash = &alice.accounts.as_ref().unwrap().sr_stash.address;
        let bob_stash = &bob.accounts.as_ref().unwrap().sr_stash.address;
        assert_eq!(keys[0][0], json!(alice_stash));
        assert_eq!(keys[1][0], json!(bob_stash));
        assert_eq!(
            keys[0][2]["grandpa"],
            json!(alice.accounts.as_ref().unwrap().ed_account.address)
        );
    }

    #[tokio::test]
    async fn test_alternate_aura_uses_ed25519() {
        let alice = node("alice", true).await;
        let accounts = alice.accounts.as_ref().unwrap();
        let key = session_key(accounts, ChainFlavor::AlternateAura, false);
        assert_eq!(key[0], json!(accounts.sr_account.address));
        assert_eq!(key[2]["aura"], json!(accounts.ed_account.address));

        let key = session_key(accounts, ChainFlavor::Generic, false);
        assert_eq!(key[2]["aura"], json!(accounts.sr_account.address));
    }

    #[tokio::test]
    async fn test_address_mapping_authorities() {
        let mut runtime = json!({
            "authorMapping": {"mappings": [["x", "y"]]},
            "parachainStaking": {"candidates": [["0xabc", 7000]], "delegations": [["d"]]}
        });
        let mut ctx = CompilationContext::new();
        clear(&mut runtime, ChainFlavor::AddressMapping, &mut ctx);
        assert_eq!(ctx.para_bond, Some(7000));
        assert_eq!(runtime["parachainStaking"]["delegations"], json!([]));

        let collator = node("collator", true).await;
        let accounts = collator.accounts.as_ref().unwrap();
        push_authority(&mut runtime, accounts, ChainFlavor::AddressMapping, false).unwrap();
        push_candidate(&mut runtime, accounts, 7000).unwrap();

        let eth = accounts.eth_account.as_ref().unwrap();
        assert_eq!(
            runtime["authorMapping"]["mappings"],
            json!([[accounts.sr_account.address, eth.address]])
        );
        assert_eq!(runtime["parachainStaking"]["candidates"][0][0], json!(eth.address));
        assert!(crate::genesis::has_session_keys(&runtime));
    }

    #[tokio::test]
    async fn test_staking_and_invulnerables() {
        let mut runtime = relay_runtime();
        let mut ctx = CompilationContext::new();
        clear(&mut runtime, ChainFlavor::Generic, &mut ctx);

        let mut alice = node("alice", true).await;
        alice.invulnerable = true;
        push_staker(&mut runtime, alice.accounts.as_ref().unwrap(), 5000, alice.invulnerable);

        let stash = &alice.accounts.as_ref().unwrap().sr_stash.address;
        assert_eq!(runtime["staking"]["validatorCount"], json!(1));
        assert_eq!(runtime["staking"]["invulnerables"], json!([stash]));
        assert_eq!(runtime["staking"]["stakers"][0][3], json!("Validator"));
        assert_eq!(value_as_u128(&runtime["staking"]["stakers"][0][2]), Some(5000));
    }

    #[tokio::test]
    async fn test_validator_balance_covers_bond() {
        let mut runtime = relay_runtime();
        let mut alice = node("alice", true).await;
        alice.balance = 10;
        let mut bob = node("bob", false).await;
        bob.balance = 10;
        let mut charlie = node("charlie", false).await;
        charlie.balance = 0;

        let funded = push_balances(&mut runtime, &[alice, bob, charlie], Some(5000));
        assert_eq!(funded, 2);
        let balances = runtime["balances"]["balances"].as_array().unwrap();
        assert_eq!(value_as_u128(&balances[0][1]), Some(5001));
        assert_eq!(value_as_u128(&balances[1][1]), Some(10));
    }

    #[tokio::test]
    async fn test_nominators_back_existing_validators() {
        let mut runtime = relay_runtime();
        let nominators = vec![
            FakeKeyGenerator.account_from_seed("nom-0").await.unwrap(),
            FakeKeyGenerator.account_from_seed("nom-1").await.unwrap(),
        ];
        let mut rng = StdRng::seed_from_u64(7);
        push_nominators(&mut runtime, &nominators, 5000, 24, &mut rng);

        let stakers = runtime["staking"]["stakers"].as_array().unwrap();
        assert_eq!(stakers.len(), 3);
        assert_eq!(stakers[1][3]["Nominator"], json!(["a"]));
        assert_eq!(runtime["balances"]["balances"].as_array().unwrap().len(), 2);
        assert_eq!(value_as_u128(&runtime["balances"]["balances"][0][1]), Some(5001));
    }

    #[test]
    fn test_genesis_patch_only_touches_existing_keys() {
        let mut doc = json!({"genesis": {"runtime": {"balances": {"totalIssuance": 1}}}});
        apply_genesis_patch(&mut doc, &json!({"balances": {"totalIssuance": 42}}));
        assert_eq!(doc["genesis"]["runtime"]["balances"]["totalIssuance"], json!(42));

        let mut doc = json!({"genesis": {"runtime": {"system": {}}}});
        let before = doc.clone();
        apply_genesis_patch(&mut doc, &json!({"balances": {"totalIssuance": 42}}));
        assert_eq!(doc, before);

        let mut doc = json!({"genesis": {"runtime": {"configuration": {"config": {"a": 1, "b": [1]}}}}});
        apply_genesis_patch(
            &mut doc,
            &json!({"runtime": {"configuration": {"config": {"b": [2, 3], "missing": true}}}}),
        );
        assert_eq!(
            doc["genesis"]["runtime"]["configuration"]["config"],
            json!({"a": 1, "b": [2, 3]})
        );
    }

    #[tokio::test]
    async fn test_parachain_registration_locations() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ChainSpec::new(dir.path().join("spec.json"));
        tokio::fs::write(spec.path(), r#"{"id":"r","genesis":{"runtime":{"parachainsParas":{"paras":[]}}}}"#)
            .await
            .unwrap();
        add_parachain_to_genesis(&spec, 100, "0xhead\n", "0xwasm").await.unwrap();
        let doc = spec.read().await.unwrap();
        assert_eq!(
            doc["genesis"]["runtime"]["parachainsParas"]["paras"],
            json!([[100, ["0xhead", "0xwasm", true]]])
        );

        let channel = HrmpChannel { sender: 100, recipient: 200, max_capacity: 8, max_message_size: 512 };
        let err = add_hrmp_channels(&spec, &[channel]).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::GenesisSchedule(_)));
    }

    #[tokio::test]
    async fn test_boot_nodes_are_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ChainSpec::new(dir.path().join("raw.json"));
        tokio::fs::write(spec.path(), r#"{"id":"r","bootNodes":["old"],"genesis":{"raw":{"top":{}}}}"#)
            .await
            .unwrap();
        let addrs = vec!["/ip4/a".to_string(), "/ip4/b".to_string(), "/ip4/a".to_string()];
        add_boot_nodes(&spec, &addrs).await.unwrap();
        let doc = spec.read().await.unwrap();
        assert_eq!(doc["bootNodes"], json!(["/ip4/a", "/ip4/b"]));
    }

    #[tokio::test]
    async fn test_missing_accounts_is_key_error() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ChainSpec::new(dir.path().join("spec.json"));
        tokio::fs::write(spec.path(), r#"{"id":"r","genesis":{"runtime":{"session":{"keys":[]}}}}"#)
            .await
            .unwrap();
        let bare = Node::builder("bare", NodeRole::Node).build();
        let err = add_authority(&spec, &bare, ChainFlavor::Generic, true).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::KeyGeneration(_)));
    }
}
