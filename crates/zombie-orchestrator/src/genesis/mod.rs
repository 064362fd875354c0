//! Chain spec (genesis document) access and customization.
//!
//! Every operation reads and parses the whole file, applies its change and
//! writes the file back. Numbers keep their exact digits: the JSON codec
//! runs with arbitrary precision and exponent notation is expanded to plain
//! digits before writing.

mod customize;
mod mutator;

use std::path::{Path, PathBuf};

use serde_json::{Number, Value};
use tracing::debug;

use crate::error::{OrchestratorError, Result};

pub use customize::{customize_parachain_spec, customize_relay_spec, fix_para_id};
pub use mutator::{
    add_authority, add_aura_authority, add_balances, add_boot_nodes, add_collator_selection, add_grandpa_authority,
    add_hrmp_channels, add_para_custom, add_parachain_to_genesis, add_staking, change_genesis_config,
    clear_authorities, generate_nominators, session_key,
};

// Locations of the runtime genesis config, newest layout last.
const RUNTIME_CONFIG_PATHS: [&str; 4] = [
    "/runtime/runtime_genesis_config",
    "/runtime",
    "/runtimeGenesis/patch",
    "/runtimeGenesis/config",
];

/// A chain spec file on the local machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSpec {
    path: PathBuf,
}

impl ChainSpec {
    /// Wraps the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and parses the document.
    pub async fn read(&self) -> Result<Value> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            OrchestratorError::chain_spec_invalid(format!("can not read {}: {e}", self.path.display()))
        })?;
        parse_chain_spec(&content).map_err(|e| {
            OrchestratorError::chain_spec_invalid(format!("{}: {e}", self.path.display()))
        })
    }

    /// Serializes and writes the document.
    pub async fn write(&self, doc: &Value) -> Result<()> {
        let mut doc = doc.clone();
        expand_exponents(&mut doc);
        let data = serde_json::to_string_pretty(&doc)?;
        tokio::fs::write(&self.path, data).await?;
        Ok(())
    }

    /// Returns true if the document is in raw form.
    pub async fn is_raw(&self) -> Result<bool> {
        Ok(is_raw(&self.read().await?))
    }

    /// Returns the chain id.
    pub async fn chain_id(&self) -> Result<String> {
        let doc = self.read().await?;
        doc.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| OrchestratorError::chain_spec_invalid(format!("{} has no id", self.path.display())))
    }

    /// Applies `f` to the whole document and writes it back.
    pub async fn update<T>(&self, f: impl FnOnce(&mut Value) -> Result<T>) -> Result<T> {
        let mut doc = self.read().await?;
        let out = f(&mut doc)?;
        self.write(&doc).await?;
        Ok(out)
    }

    /// Applies `f` to the runtime genesis config and writes the document back.
    ///
    /// Raw documents are refused: their genesis can only be copied.
    pub async fn update_runtime<T>(&self, f: impl FnOnce(&mut Value) -> Result<T>) -> Result<T> {
        let path = self.path.display().to_string();
        self.update(|doc| {
            if is_raw(doc) {
                return Err(OrchestratorError::chain_spec_invalid(format!(
                    "{path} is a raw chain spec and can not be customized"
                )));
            }
            let runtime = runtime_config_mut(doc)
                .ok_or_else(|| OrchestratorError::chain_spec_invalid(format!("{path} has no runtime genesis config")))?;
            f(runtime)
        })
        .await
    }
}

/// Parses a chain spec document.
pub fn parse_chain_spec(content: &str) -> std::result::Result<Value, String> {
    if content.trim().is_empty() {
        return Err("empty chain spec".to_string());
    }
    let doc: Value = serde_json::from_str(content).map_err(|e| e.to_string())?;
    if !doc.is_object() {
        return Err("chain spec is not a JSON object".to_string());
    }
    Ok(doc)
}

/// Returns true if the document carries raw storage.
pub fn is_raw(doc: &Value) -> bool {
    doc.pointer("/genesis/raw").is_some()
}

/// Returns the runtime genesis config of a plain document.
pub fn runtime_config(doc: &Value) -> Option<&Value> {
    let genesis = doc.get("genesis")?;
    RUNTIME_CONFIG_PATHS.iter().find_map(|p| genesis.pointer(p))
}

/// Mutable variant of [`runtime_config`].
pub fn runtime_config_mut(doc: &mut Value) -> Option<&mut Value> {
    let genesis = doc.get_mut("genesis")?;
    let path = RUNTIME_CONFIG_PATHS.iter().find(|p| genesis.pointer(p).is_some())?;
    genesis.pointer_mut(path)
}

/// Returns true if the runtime uses session keys (or an author mapping).
pub fn has_session_keys(runtime: &Value) -> bool {
    ["session", "palletSession", "authorMapping"]
        .iter()
        .any(|k| runtime.get(k).is_some())
}

/// Reads an integer that may be stored as a number, an exponent or a string.
pub fn value_as_u128(value: &Value) -> Option<u128> {
    match value {
        Value::Number(n) => {
            let text = n.to_string();
            text.parse().ok().or_else(|| expand_exponent(&text)?.parse().ok())
        }
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Builds a JSON number from a `u128` without losing digits.
pub fn number_from_u128(value: u128) -> Value {
    serde_json::from_str::<Number>(&value.to_string())
        .map(Value::Number)
        .unwrap_or_else(|_| Value::String(value.to_string()))
}

/// Rewrites every integral number written with an exponent as plain digits.
pub fn expand_exponents(value: &mut Value) {
    match value {
        Value::Number(n) => {
            let text = n.to_string();
            if let Some(expanded) = expand_exponent(&text) {
                if let Ok(number) = serde_json::from_str::<Number>(&expanded) {
                    debug!(from = %text, to = %expanded, "Expanded exponent");
                    *n = number;
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(expand_exponents),
        Value::Object(map) => map.values_mut().for_each(expand_exponents),
        _ => {}
    }
}

/// Widest integer a runtime stores (u256).
const MAX_EXPANDED_DIGITS: usize = 78;

// `1.5e3` -> `1500`; `None` when there is no exponent, the value is not integral,
// or it would expand past `MAX_EXPANDED_DIGITS`.
fn expand_exponent(text: &str) -> Option<String> {
    let (mantissa, exponent) = text.split_once(['e', 'E'])?;
    let exponent: i64 = exponent.parse().ok()?;
    let (negative, mantissa) = match mantissa.strip_prefix('-') {
        Some(m) => (true, m),
        None => (false, mantissa),
    };
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let frac_part = frac_part.trim_end_matches('0');
    let shift = exponent - frac_part.len() as i64;
    if shift < 0 || shift > MAX_EXPANDED_DIGITS as i64 {
        return None;
    }

    let mut digits = format!("{int_part}{frac_part}{}", "0".repeat(shift as usize));
    let trimmed = digits.trim_start_matches('0');
    digits = if trimmed.is_empty() { "0".to_string() } else { trimmed.to_string() };
    if digits.len() > MAX_EXPANDED_DIGITS {
        return None;
    }
    if negative && digits != "0" {
        digits.insert(0, '-');
    }
    Some(digits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expand_exponent() {
        assert_eq!(expand_exponent("1e21").as_deref(), Some("1000000000000000000000"));
        assert_eq!(expand_exponent("1.5E+3").as_deref(), Some("1500"));
        assert_eq!(expand_exponent("-2.50e2").as_deref(), Some("-250"));
        assert_eq!(expand_exponent("1.25e1"), None);
        assert_eq!(expand_exponent("42"), None);
    }

    #[test]
    fn test_huge_exponents_are_left_alone() {
        assert_eq!(expand_exponent("1e4000000000"), None);
        assert_eq!(expand_exponent("1e78"), None);
        assert_eq!(expand_exponent("1e77").map(|d| d.len()), Some(78));

        let mut doc = json!({"totalIssuance": serde_json::from_str::<Value>("1e4000000000").unwrap()});
        expand_exponents(&mut doc);
        assert_eq!(doc["totalIssuance"].to_string(), "1e4000000000");
    }

    #[tokio::test]
    async fn test_big_integers_survive_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ChainSpec::new(dir.path().join("spec.json"));
        tokio::fs::write(
            spec.path(),
            r#"{"id":"x","genesis":{"runtime":{"balances":{"balances":[["a",123456789012345678901234567890]],"totalIssuance":1e21}}}}"#,
        )
        .await
        .unwrap();

        let doc = spec.read().await.unwrap();
        spec.write(&doc).await.unwrap();

        let text = tokio::fs::read_to_string(spec.path()).await.unwrap();
        assert!(text.contains("123456789012345678901234567890"));
        assert!(text.contains("1000000000000000000000"));
        assert!(!text.contains("e+"));
        assert!(!text.contains("1e21"));

        let doc = spec.read().await.unwrap();
        let balance = doc.pointer("/genesis/runtime/balances/balances/0/1").unwrap();
        assert_eq!(value_as_u128(balance), Some(123456789012345678901234567890));
    }

    #[test]
    fn test_runtime_config_locations() {
        let legacy = json!({"genesis": {"runtime": {"runtime_genesis_config": {"session": {}}}}});
        assert!(runtime_config(&legacy).unwrap().get("session").is_some());

        let current = json!({"genesis": {"runtime": {"aura": {}}}});
        assert!(runtime_config(&current).unwrap().get("aura").is_some());

        let patch = json!({"genesis": {"runtimeGenesis": {"patch": {"balances": {}}}}});
        assert!(runtime_config(&patch).unwrap().get("balances").is_some());

        let raw = json!({"genesis": {"raw": {"top": {}}}});
        assert!(is_raw(&raw));
        assert!(runtime_config(&raw).is_none());
    }

    #[tokio::test]
    async fn test_raw_spec_is_never_mutated() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ChainSpec::new(dir.path().join("raw.json"));
        let raw = r#"{"id":"x","genesis":{"raw":{"top":{"0x01":"0x02"}}}}"#;
        tokio::fs::write(spec.path(), raw).await.unwrap();

        let err = spec.update_runtime(|_| Ok(())).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ChainSpecInvalid(_)));
        assert_eq!(tokio::fs::read_to_string(spec.path()).await.unwrap(), raw);
    }

    #[tokio::test]
    async fn test_invalid_documents() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ChainSpec::new(dir.path().join("empty.json"));
        tokio::fs::write(spec.path(), "").await.unwrap();
        assert!(matches!(spec.read().await, Err(OrchestratorError::ChainSpecInvalid(_))));

        let missing = ChainSpec::new(dir.path().join("missing.json"));
        assert!(matches!(missing.read().await, Err(OrchestratorError::ChainSpecInvalid(_))));
    }

    #[test]
    fn test_value_as_u128() {
        assert_eq!(value_as_u128(&json!(1000)), Some(1000));
        assert_eq!(value_as_u128(&json!("5000")), Some(5000));
        assert_eq!(value_as_u128(&number_from_u128(u128::MAX)), Some(u128::MAX));
        assert_eq!(value_as_u128(&json!(null)), None);
    }
}
