//! Handles to running nodes.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::constants::{render_uri, LOCALHOST, METRICS_URI_PATTERN, METRIC_POLL_INTERVAL, PARACHAIN_POLL_INTERVAL, WS_URI_PATTERN};
use crate::error::{OrchestratorError, Result};
use crate::metrics::{Comparator, Metrics, MetricsSource};
use crate::provider::SharedProvider;
use crate::rpc::{RpcClient, SharedRpcConnector};
use crate::topology::Ports;

const IS_UP_RETRY: Duration = Duration::from_secs(1);

/// Clients a node handle talks through.
#[derive(Clone)]
pub struct NodeClients {
    /// Opens RPC connections.
    pub rpc: SharedRpcConnector,
    /// Scrapes metrics.
    pub metrics: Arc<dyn MetricsSource>,
}

/// Addresses of a node, as recorded in the network summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUris {
    /// RPC websocket address reachable from this machine.
    pub ws_uri: String,
    /// Metrics address reachable from this machine.
    pub prometheus_uri: String,
    /// Address other nodes dial.
    pub multi_address: String,
}

/// A live reference to one spawned node.
pub struct NetworkNode {
    name: String,
    para_id: Option<u32>,
    group: Option<String>,
    ports: Ports,
    uris: RwLock<NodeUris>,
    provider: SharedProvider,
    clients: NodeClients,
    last_metrics: Mutex<Option<Metrics>>,
}

impl std::fmt::Debug for NetworkNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkNode")
            .field("name", &self.name)
            .field("para_id", &self.para_id)
            .field("uris", &self.uris())
            .finish()
    }
}

impl NetworkNode {
    /// Creates a handle; `ports` are the ports the node listens on.
    pub fn new(name: impl Into<String>, ports: Ports, uris: NodeUris, provider: SharedProvider, clients: NodeClients) -> Self {
        Self {
            name: name.into(),
            para_id: None,
            group: None,
            ports,
            uris: RwLock::new(uris),
            provider,
            clients,
            last_metrics: Mutex::new(None),
        }
    }

    /// Tags the node with the parachain it collates for.
    pub fn with_para_id(mut self, para_id: Option<u32>) -> Self {
        self.para_id = para_id;
        self
    }

    /// Records the group the node was expanded from.
    pub fn with_group(mut self, group: Option<String>) -> Self {
        self.group = group;
        self
    }

    /// Node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parachain id, for collators.
    pub fn para_id(&self) -> Option<u32> {
        self.para_id
    }

    /// Group name, for nodes expanded from a group.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Ports the node listens on inside its environment.
    pub fn ports(&self) -> Ports {
        self.ports
    }

    /// Current addresses.
    pub fn uris(&self) -> NodeUris {
        self.uris.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// RPC websocket address.
    pub fn ws_uri(&self) -> String {
        self.uris().ws_uri
    }

    /// Metrics address.
    pub fn prometheus_uri(&self) -> String {
        self.uris().prometheus_uri
    }

    /// Bootnode multiaddress.
    pub fn multi_address(&self) -> String {
        self.uris().multi_address
    }

    /// The metrics fetched by the last successful scrape.
    pub async fn last_metrics(&self) -> Option<Metrics> {
        self.last_metrics.lock().await.clone()
    }

    /// Opens an RPC connection to the node.
    pub async fn rpc(&self) -> Result<Arc<dyn RpcClient>> {
        self.clients.rpc.connect(&self.ws_uri()).await
    }

    /// Returns true once the node answers RPC within `timeout`.
    pub async fn is_up(&self, timeout: Duration) -> bool {
        let answered = async {
            loop {
                match self.rpc().await {
                    Ok(rpc) => match rpc.system_name().await {
                        Ok(_) => return,
                        Err(e) => debug!(node = %self.name, error = %e, "Node not answering yet"),
                    },
                    Err(e) => debug!(node = %self.name, error = %e, "Can not connect yet"),
                }
                tokio::time::sleep(IS_UP_RETRY).await;
            }
        };
        tokio::time::timeout(timeout, answered).await.is_ok()
    }

    /// Reads metric `name`.
    ///
    /// Without a target the current value is returned. With one, the
    /// endpoint is scraped every second until `comparator` holds or
    /// `timeout` elapses; failed scrapes re-establish the port forward and
    /// keep polling.
    ///
    /// # Errors
    ///
    /// Returns `MetricNotFound` when the metric is absent and no target was
    /// given, and `Timeout` when the target is not reached in time.
    pub async fn get_metric(
        &self,
        name: &str,
        comparator: Comparator,
        target: Option<f64>,
        timeout: Duration,
    ) -> Result<f64> {
        let Some(target) = target else {
            let metrics = self.scrape().await?;
            return metrics
                .get(name)
                .ok_or_else(|| OrchestratorError::MetricNotFound(format!("{name} on {}", self.name)));
        };

        let deadline = Instant::now() + timeout;
        let mut last = None;
        loop {
            match self.scrape().await {
                Ok(metrics) => {
                    if let Some(value) = metrics.get(name) {
                        if comparator.holds(value, target) {
                            debug!(node = %self.name, metric = %name, value, "Metric reached target");
                            return Ok(value);
                        }
                        last = Some(value);
                    }
                }
                Err(e) if self.provider.capabilities().has("port_forward") => {
                    warn!(node = %self.name, error = %e, "Metric fetch failed, refreshing port forward");
                    if let Err(e) = self.refresh_metrics_forward().await {
                        warn!(node = %self.name, error = %e, "Port forward refresh failed");
                    }
                }
                Err(e) => warn!(node = %self.name, error = %e, "Metric fetch failed"),
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(METRIC_POLL_INTERVAL).await;
        }

        // An absent counter reads as zero.
        if comparator == Comparator::Equal && target == 0.0 && last.is_none() {
            return Ok(0.0);
        }
        Err(OrchestratorError::timeout(format!(
            "metric {name} {comparator} {target} on {} (last value {last:?})",
            self.name
        )))
    }

    /// Waits until `para_id` is registered on the relay chain.
    ///
    /// Returns false if it is not within `timeout`.
    pub async fn parachain_is_registered(&self, para_id: u32, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.query(|rpc| async move { rpc.parachains().await }).await {
                Ok(paras) if paras.contains(&para_id) => return Ok(true),
                Ok(_) => {}
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => warn!(node = %self.name, error = %e, "Parachain query failed"),
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(PARACHAIN_POLL_INTERVAL).await;
        }
    }

    /// Waits until the head of `para_id` reaches `target`; returns the height seen.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the height is not reached within `timeout`.
    pub async fn parachain_block_height(&self, para_id: u32, target: u64, timeout: Duration) -> Result<u64> {
        let deadline = Instant::now() + timeout;
        let mut last = None;
        loop {
            match self.query(|rpc| async move { rpc.para_block_height(para_id).await }).await {
                Ok(Some(height)) if height >= target => return Ok(height),
                Ok(height) => last = height.or(last),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => warn!(node = %self.name, error = %e, "Parachain head query failed"),
            }
            if Instant::now() >= deadline {
                return Err(OrchestratorError::timeout(format!(
                    "parachain {para_id} block height {target} on {} (last {last:?})",
                    self.name
                )));
            }
            tokio::time::sleep(PARACHAIN_POLL_INTERVAL).await;
        }
    }

    /// Pauses the node process.
    pub async fn pause(&self) -> Result<()> {
        self.require("pause")?;
        self.provider.pause(&self.name).await?;
        info!(node = %self.name, "Paused node");
        Ok(())
    }

    /// Resumes the node process.
    pub async fn resume(&self) -> Result<()> {
        self.require("resume")?;
        self.provider.resume(&self.name).await?;
        info!(node = %self.name, "Resumed node");
        Ok(())
    }

    /// Restarts the node process, optionally after `after`.
    ///
    /// Forwarded ports do not survive a restart, so the RPC address is
    /// re-established on backends that forward ports.
    pub async fn restart(&self, after: Option<Duration>) -> Result<()> {
        self.require("restart")?;
        self.provider.restart(&self.name, after).await?;
        if self.provider.capabilities().has("port_forward") {
            let local = self.provider.start_port_forwarding(self.ports.rpc, &self.name).await?;
            self.uris.write().unwrap_or_else(|e| e.into_inner()).ws_uri = render_uri(WS_URI_PATTERN, LOCALHOST, local);
        }
        info!(node = %self.name, "Restarted node");
        Ok(())
    }

    /// Returns the node logs, optionally only the most recent ones.
    pub async fn logs(&self, since: Option<Duration>) -> Result<String> {
        self.provider.logs(&self.name, since).await
    }

    fn require(&self, capability: &str) -> Result<()> {
        if self.provider.capabilities().has(capability) {
            Ok(())
        } else {
            Err(OrchestratorError::capability_not_supported(format!(
                "{capability} on the {} provider",
                self.provider.kind()
            )))
        }
    }

    async fn scrape(&self) -> Result<Metrics> {
        let metrics = self.clients.metrics.fetch(&self.prometheus_uri()).await?;
        *self.last_metrics.lock().await = Some(metrics.clone());
        Ok(metrics)
    }

    async fn refresh_metrics_forward(&self) -> Result<()> {
        let local = self.provider.start_port_forwarding(self.ports.prometheus, &self.name).await?;
        self.uris.write().unwrap_or_else(|e| e.into_inner()).prometheus_uri =
            render_uri(METRICS_URI_PATTERN, LOCALHOST, local);
        Ok(())
    }

    async fn query<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn RpcClient>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let rpc = self.rpc().await?;
        f(rpc).await
    }
}
