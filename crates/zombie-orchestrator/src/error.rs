//! Error types for the orchestrator crate.
//!
//! Every failure a network launch can hit maps to one [`OrchestratorError`]
//! variant. The launch-level kinds (configuration, provider access, spawn
//! timeout, chain spec, metrics, genesis schedule, global timeout) are kept
//! distinct so callers can react to them without string matching.

use thiserror::Error;

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that can occur while compiling, spawning or driving a network.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The network description is incomplete or inconsistent.
    #[error("invalid network configuration: {0}")]
    ConfigValidation(String),

    /// The execution backend is unreachable or refused our credentials.
    #[error("can not access provider {provider}: {reason}")]
    ProviderAccess {
        /// Provider name.
        provider: String,
        /// The reason for the failure.
        reason: String,
    },

    /// A node never reached the ready state.
    #[error("timeout waiting for {kind} {node} to be ready")]
    SpawnTimeout {
        /// The node name.
        node: String,
        /// The resource kind (pod, container, process).
        kind: String,
    },

    /// A spawned node failed before it became ready.
    #[error("failed to spawn {node}: {reason}")]
    SpawnFailed {
        /// The node name.
        node: String,
        /// The reason for the failure.
        reason: String,
    },

    /// A chain spec document is missing, empty or not valid JSON.
    #[error("invalid chain spec: {0}")]
    ChainSpecInvalid(String),

    /// The metrics endpoint could not be scraped.
    #[error("failed to fetch metrics from {uri}: {reason}")]
    MetricFetch {
        /// The metrics endpoint.
        uri: String,
        /// The reason for the failure.
        reason: String,
    },

    /// A genesis key the launch needs is absent from the chain spec.
    #[error("genesis schedule error: {0}")]
    GenesisSchedule(String),

    /// The network was not launched before the global timeout fired.
    #[error("global timeout ({secs} secs) reached before the network was launched")]
    GlobalTimeout {
        /// The configured timeout.
        secs: u64,
    },

    /// Timeout waiting for a condition on a running node.
    #[error("timeout waiting for {condition}")]
    Timeout {
        /// The condition that timed out.
        condition: String,
    },

    /// A node was looked up by a name the network does not know.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// A metric was requested that the node does not expose.
    #[error("metric not found: {0}")]
    MetricNotFound(String),

    /// An external command exited unsuccessfully.
    #[error("command `{command}` failed with exit code {exit_code}: {output}")]
    CommandFailed {
        /// The command line.
        command: String,
        /// Exit code.
        exit_code: i32,
        /// Captured output.
        output: String,
    },

    /// Key material could not be derived.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// An RPC query against a running node failed.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// Teardown failed.
    #[error("teardown failed: {0}")]
    TeardownFailed(String),

    /// Provider capability not supported.
    #[error("capability not supported: {0}")]
    CapabilityNotSupported(String),

    /// Docker API error.
    #[error("container API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl OrchestratorError {
    /// Creates a configuration validation error.
    pub fn config_validation(reason: impl Into<String>) -> Self {
        Self::ConfigValidation(reason.into())
    }

    /// Creates a provider access error.
    pub fn provider_access(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProviderAccess {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    /// Creates a spawn timeout error.
    pub fn spawn_timeout(node: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::SpawnTimeout {
            node: node.into(),
            kind: kind.into(),
        }
    }

    /// Creates a spawn failed error.
    pub fn spawn_failed(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            node: node.into(),
            reason: reason.into(),
        }
    }

    /// Creates a chain spec error.
    pub fn chain_spec_invalid(reason: impl Into<String>) -> Self {
        Self::ChainSpecInvalid(reason.into())
    }

    /// Creates a metric fetch error.
    pub fn metric_fetch(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MetricFetch {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// Creates a genesis schedule error.
    pub fn genesis_schedule(reason: impl Into<String>) -> Self {
        Self::GenesisSchedule(reason.into())
    }

    /// Creates a timeout error.
    pub fn timeout(condition: impl Into<String>) -> Self {
        Self::Timeout {
            condition: condition.into(),
        }
    }

    /// Creates a node not found error.
    pub fn node_not_found(name: impl Into<String>) -> Self {
        Self::NodeNotFound(name.into())
    }

    /// Creates a command failed error.
    pub fn command_failed(command: impl Into<String>, exit_code: i32, output: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            exit_code,
            output: output.into(),
        }
    }

    /// Creates a key generation error.
    pub fn key_generation(reason: impl Into<String>) -> Self {
        Self::KeyGeneration(reason.into())
    }

    /// Creates an RPC error.
    pub fn rpc(reason: impl Into<String>) -> Self {
        Self::Rpc(reason.into())
    }

    /// Creates a teardown failed error.
    pub fn teardown_failed(reason: impl Into<String>) -> Self {
        Self::TeardownFailed(reason.into())
    }

    /// Creates a capability not supported error.
    pub fn capability_not_supported(cap: impl Into<String>) -> Self {
        Self::CapabilityNotSupported(cap.into())
    }

    /// Creates a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization(reason.into())
    }

    /// Returns true if the failure is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::MetricFetch { .. }
                | Self::Http(_)
                | Self::DockerApi(_)
                | Self::Io(_)
                | Self::Rpc(_)
        )
    }

    /// Returns true if this is a not found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NodeNotFound(_) | Self::MetricNotFound(_))
    }

    /// Returns true if this error aborts a launch before anything is spawned.
    pub fn is_pre_spawn(&self) -> bool {
        matches!(self, Self::ConfigValidation(_) | Self::ProviderAccess { .. })
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for OrchestratorError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for OrchestratorError {
    fn from(err: toml::de::Error) -> Self {
        Self::ConfigValidation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::spawn_timeout("alice", "pod");
        assert_eq!(err.to_string(), "timeout waiting for pod alice to be ready");

        let err = OrchestratorError::GlobalTimeout { secs: 1200 };
        assert_eq!(
            err.to_string(),
            "global timeout (1200 secs) reached before the network was launched"
        );
    }

    #[test]
    fn test_error_retryable() {
        assert!(OrchestratorError::timeout("test").is_retryable());
        assert!(OrchestratorError::metric_fetch("http://127.0.0.1:9615/metrics", "refused").is_retryable());
        assert!(!OrchestratorError::config_validation("test").is_retryable());
        assert!(!OrchestratorError::genesis_schedule("paras").is_retryable());
    }

    #[test]
    fn test_error_is_not_found() {
        assert!(OrchestratorError::node_not_found("bob").is_not_found());
        assert!(OrchestratorError::MetricNotFound("peers".into()).is_not_found());
        assert!(!OrchestratorError::timeout("test").is_not_found());
    }

    #[test]
    fn test_pre_spawn_kinds() {
        assert!(OrchestratorError::config_validation("no nodes").is_pre_spawn());
        assert!(OrchestratorError::provider_access("kubernetes", "forbidden").is_pre_spawn());
        assert!(!OrchestratorError::spawn_timeout("alice", "process").is_pre_spawn());
    }
}
