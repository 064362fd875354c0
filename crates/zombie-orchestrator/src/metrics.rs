//! Prometheus text-format scraping.
//!
//! Metrics are grouped by namespace, the part of the metric name before the
//! first `_` (`substrate_block_height` lives in `substrate` as
//! `block_height`), so a lookup works regardless of the node's prometheus
//! prefix. Every sample is also kept under its full name in [`RAW_NAMESPACE`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::METRICS_FETCH_TIMEOUT;
use crate::error::{OrchestratorError, Result};

/// Namespace holding every sample under its full name.
pub const RAW_NAMESPACE: &str = "_raw";

/// How a fetched metric value is compared with a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Comparator {
    /// `value == target`
    #[default]
    Equal,
    /// `value > target`
    IsAbove,
    /// `value >= target`
    IsAtLeast,
    /// `value < target`
    IsBelow,
}

impl Comparator {
    /// Applies the comparison.
    pub fn holds(&self, value: f64, target: f64) -> bool {
        match self {
            Self::Equal => value == target,
            Self::IsAbove => value > target,
            Self::IsAtLeast => value >= target,
            Self::IsBelow => value < target,
        }
    }
}

impl FromStr for Comparator {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "equal" | "equals" | "==" => Ok(Self::Equal),
            "isAbove" | ">" => Ok(Self::IsAbove),
            "isAtLeast" | ">=" => Ok(Self::IsAtLeast),
            "isBelow" | "<" => Ok(Self::IsBelow),
            other => Err(OrchestratorError::config_validation(format!("unknown comparator {other}"))),
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Equal => "equal",
            Self::IsAbove => "isAbove",
            Self::IsAtLeast => "isAtLeast",
            Self::IsBelow => "isBelow",
        };
        f.write_str(s)
    }
}

/// Maps the human aliases used in test scripts to metric keys.
pub fn metric_name(alias: &str) -> &str {
    match alias {
        "blockheight" | "block height" | "best block" => "block_height{status=\"best\"}",
        "finalised height" | "finalised block" => "block_height{status=\"finalized\"}",
        "peers count" | "peers" => "sub_libp2p_peers_count",
        other => other,
    }
}

/// One sample line.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Metric name.
    pub name: String,
    /// Labels in line order.
    pub labels: Vec<(String, String)>,
    /// Value.
    pub value: f64,
}

#[derive(Clone, Copy, PartialEq)]
enum State {
    Name,
    AfterName,
    LabelStart,
    LabelName,
    BeforeEquals,
    BeforeQuote,
    LabelValue,
    Escape,
    AfterLabel,
    AfterLabels,
    Value,
    Timestamp,
}

/// Parses one `name{label="value",...} value [timestamp]` line.
pub fn parse_line(line: &str) -> std::result::Result<Sample, String> {
    let mut name = String::new();
    let mut label = String::new();
    let mut label_value = String::new();
    let mut value = String::new();
    let mut labels = Vec::new();
    let mut state = State::Name;

    for c in line.chars() {
        let blank = c == ' ' || c == '\t';
        state = match (state, c) {
            (State::Name, '{') | (State::AfterName, '{') => State::LabelStart,
            (State::Name, _) if blank => State::AfterName,
            (State::Name, _) => {
                name.push(c);
                State::Name
            }
            (State::AfterName, _) | (State::AfterLabels, _) if blank => state,
            (State::AfterName, _) | (State::AfterLabels, _) => {
                value.push(c);
                State::Value
            }
            (State::LabelStart, _) if blank => state,
            (State::LabelStart, '}') | (State::LabelName, '}') => State::AfterLabels,
            (State::LabelStart, _) => {
                label.push(c);
                State::LabelName
            }
            (State::LabelName, '=') | (State::BeforeEquals, '=') => State::BeforeQuote,
            (State::LabelName, _) if blank => State::BeforeEquals,
            (State::LabelName, _) => {
                label.push(c);
                State::LabelName
            }
            (State::BeforeEquals, _) | (State::BeforeQuote, _) | (State::AfterLabel, _) if blank => state,
            (State::BeforeQuote, '"') => State::LabelValue,
            (State::LabelValue, '\\') => State::Escape,
            (State::LabelValue, '"') => {
                labels.push((std::mem::take(&mut label), std::mem::take(&mut label_value)));
                State::AfterLabel
            }
            (State::LabelValue, _) => {
                label_value.push(c);
                State::LabelValue
            }
            (State::Escape, _) => {
                match c {
                    '\\' => label_value.push('\\'),
                    'n' => label_value.push('\n'),
                    '"' => label_value.push('"'),
                    other => {
                        label_value.push('\\');
                        label_value.push(other);
                    }
                }
                State::LabelValue
            }
            (State::AfterLabel, ',') => State::LabelStart,
            (State::AfterLabel, '}') => State::AfterLabels,
            (State::Value, _) if blank => State::Timestamp,
            (State::Value, _) => {
                value.push(c);
                State::Value
            }
            (State::Timestamp, _) => State::Timestamp,
            _ => return Err(format!("invalid metric line: {line}")),
        };
    }

    let value = value
        .parse::<f64>()
        .map_err(|_| format!("invalid metric value in line: {line}"))?;
    Ok(Sample { name, labels, value })
}

/// A scraped metrics snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metrics {
    namespaces: BTreeMap<String, HashMap<String, f64>>,
}

impl Metrics {
    /// Parses a text exposition. Comments, blank and malformed lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut metrics = Self::default();
        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line) {
                Ok(sample) => metrics.insert(sample),
                Err(e) => debug!(error = %e, "Skipping metric line"),
            }
        }
        metrics
    }

    fn insert(&mut self, sample: Sample) {
        let (ns, short) = match sample.name.split_once('_') {
            Some((ns, rest)) => (ns.to_string(), rest.to_string()),
            None => (sample.name.clone(), String::new()),
        };
        let render = |name: &str, with_chain: bool| {
            let labels: Vec<String> = sample
                .labels
                .iter()
                .filter(|(k, _)| with_chain || k != "chain")
                .map(|(k, v)| format!("{k}=\"{v}\""))
                .collect();
            if labels.is_empty() {
                name.to_string()
            } else {
                format!("{name}{{{}}}", labels.join(","))
            }
        };

        for with_chain in [true, false] {
            let keyed = render(&short, with_chain);
            let raw = render(&sample.name, with_chain);
            self.namespaces.entry(ns.clone()).or_default().insert(keyed, sample.value);
            self.namespaces
                .entry(RAW_NAMESPACE.to_string())
                .or_default()
                .insert(raw, sample.value);
        }
    }

    /// Looks `name` up in every namespace, resolving aliases first.
    pub fn get(&self, name: &str) -> Option<f64> {
        let key = metric_name(name);
        self.namespaces.values().find_map(|metrics| metrics.get(key).copied())
    }

    /// Returns the metrics of one namespace.
    pub fn namespace(&self, ns: &str) -> Option<&HashMap<String, f64>> {
        self.namespaces.get(ns)
    }

    /// Returns true if nothing was parsed.
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }
}

/// Scrapes `uri` once.
///
/// # Errors
///
/// Returns `MetricFetch` on connection errors, timeouts and non-success
/// status codes.
pub async fn fetch_metrics(client: &reqwest::Client, uri: &str) -> Result<Metrics> {
    fetch_text(client, uri).await.map(|text| Metrics::parse(&text))
}

/// Where node handles read metrics from.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Scrapes `uri` once.
    async fn fetch(&self, uri: &str) -> Result<Metrics>;
}

/// Scrapes the metrics endpoint over HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpMetricsSource {
    client: reqwest::Client,
}

impl HttpMetricsSource {
    /// Creates a source sharing `client`.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MetricsSource for HttpMetricsSource {
    async fn fetch(&self, uri: &str) -> Result<Metrics> {
        fetch_metrics(&self.client, uri).await
    }
}

pub(crate) async fn fetch_text(client: &reqwest::Client, uri: &str) -> Result<String> {
    debug!(uri = %uri, "Fetching metrics");
    let response = client
        .get(uri)
        .timeout(METRICS_FETCH_TIMEOUT)
        .send()
        .await
        .map_err(|e| OrchestratorError::metric_fetch(uri, e.to_string()))?;
    if !response.status().is_success() {
        return Err(OrchestratorError::metric_fetch(uri, format!("status {}", response.status())));
    }
    response
        .text()
        .await
        .map_err(|e| OrchestratorError::metric_fetch(uri, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPOSITION: &str = r#"# HELP substrate_block_height Block height info of the chain
# TYPE substrate_block_height gauge
substrate_block_height{status="best",chain="rococo_local_testnet"} 42
substrate_block_height{status="finalized",chain="rococo_local_testnet"} 40
substrate_sub_libp2p_peers_count{chain="rococo_local_testnet"} 3
polkadot_parachain_candidate_backing_votes 7 1700000000000
substrate_process_start_time_seconds 1.7e9
substrate_block_verification_time_bucket{chain="r",le="0.005"} 2
substrate_block_verification_time_bucket{chain="r",le="0.01"} 5
substrate_block_verification_time_bucket{chain="r",le="+Inf"} 9
"#;

    #[test]
    fn test_parse_line() {
        let sample = parse_line(r#"substrate_tasks_spawned_total{kind="blocking", task_name="a\"b"} 12 1700000000"#).unwrap();
        assert_eq!(sample.name, "substrate_tasks_spawned_total");
        assert_eq!(
            sample.labels,
            vec![("kind".to_string(), "blocking".to_string()), ("task_name".to_string(), "a\"b".to_string())]
        );
        assert_eq!(sample.value, 12.0);

        assert!(parse_line("up 1").unwrap().labels.is_empty());
        assert!(parse_line(r#"bad{x y} 1"#).is_err());
        assert!(parse_line("no_value").is_err());
    }

    #[test]
    fn test_lookup_by_namespace() {
        let metrics = Metrics::parse(EXPOSITION);
        assert_eq!(metrics.get("block_height{status=\"best\"}"), Some(42.0));
        assert_eq!(metrics.get("best block"), Some(42.0));
        assert_eq!(metrics.get("finalised height"), Some(40.0));
        assert_eq!(metrics.get("peers"), Some(3.0));
        assert_eq!(metrics.get("parachain_candidate_backing_votes"), Some(7.0));
        assert_eq!(metrics.get("substrate_process_start_time_seconds"), Some(1.7e9));
        assert_eq!(metrics.get("unknown_metric"), None);

        let raw = metrics.namespace(RAW_NAMESPACE).unwrap();
        assert_eq!(
            raw.get("substrate_block_height{status=\"best\",chain=\"rococo_local_testnet\"}"),
            Some(&42.0)
        );
    }

    #[test]
    fn test_comparator() {
        assert!("isAtLeast".parse::<Comparator>().unwrap().holds(5.0, 5.0));
        assert!(!Comparator::IsAbove.holds(5.0, 5.0));
        assert!(Comparator::IsBelow.holds(4.0, 5.0));
        assert!(Comparator::Equal.holds(0.0, 0.0));
        assert!("roughly".parse::<Comparator>().is_err());
    }
}
