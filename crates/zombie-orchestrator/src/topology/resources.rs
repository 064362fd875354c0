//! Container image and resource request types.
//!
//! Resources are expressed the way the cluster backend expects them
//! (`"512Mi"`, `"500m"`) and converted to byte and nano-CPU values for the
//! single-host container backend.

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// Container image reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ContainerImage {
    reference: String,
}

impl ContainerImage {
    /// Creates a new container image from a reference string.
    ///
    /// # Examples
    ///
    /// ```
    /// use zombie_orchestrator::topology::ContainerImage;
    ///
    /// let image = ContainerImage::new("parity/polkadot:latest");
    /// assert_eq!(image.reference(), "parity/polkadot:latest");
    /// ```
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
        }
    }

    /// Returns the full image reference.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Returns the image name (without tag or digest).
    pub fn name(&self) -> &str {
        let without_digest = self.reference.split('@').next().unwrap_or(&self.reference);
        match without_digest.rfind(':') {
            // a colon before the last slash belongs to a registry port
            Some(idx) if !without_digest[idx..].contains('/') => &without_digest[..idx],
            _ => without_digest,
        }
    }

    /// Returns the image tag if present.
    pub fn tag(&self) -> Option<&str> {
        let without_digest = self.reference.split('@').next()?;
        let name_len = self.name().len();
        without_digest.get(name_len + 1..).filter(|t| !t.is_empty())
    }

    /// Returns the registry if specified.
    pub fn registry(&self) -> Option<&str> {
        let name = self.name();
        let (first, _) = name.split_once('/')?;
        if first.contains('.') || first.contains(':') || first == "localhost" {
            Some(first)
        } else {
            None
        }
    }

    /// Returns the reference qualified with a registry, the form podman
    /// requires when no short-name aliases are configured.
    pub fn fully_qualified(&self) -> String {
        if self.registry().is_some() {
            self.reference.clone()
        } else {
            format!("docker.io/{}", self.reference)
        }
    }

    /// Rejects references with whitespace or an empty name.
    pub fn validate(&self) -> Result<()> {
        if self.reference.trim().is_empty() || self.reference.chars().any(char::is_whitespace) {
            return Err(OrchestratorError::config_validation(format!(
                "invalid image reference '{}'",
                self.reference
            )));
        }
        Ok(())
    }
}

impl From<&str> for ContainerImage {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ContainerImage {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<ContainerImage> for String {
    fn from(image: ContainerImage) -> Self {
        image.reference
    }
}

/// Image pull policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImagePullPolicy {
    /// Always pull the image.
    Always,

    /// Pull if not present locally.
    #[default]
    IfNotPresent,

    /// Never pull (image must be present).
    Never,
}

impl ImagePullPolicy {
    /// Returns the policy as spelled in pod manifests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::IfNotPresent => "IfNotPresent",
            Self::Never => "Never",
        }
    }
}

/// A memory/cpu pair in cluster quantity notation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuantities {
    /// Memory quantity, e.g. `"1Gi"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    /// CPU quantity, e.g. `"500m"` or `"2"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
}

/// Resource requests and limits of one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Guaranteed resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceQuantities>,

    /// Upper bounds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceQuantities>,
}

impl Resources {
    /// Creates resources with both requests and limits set to the same values.
    pub fn new(memory: impl Into<String>, cpu: impl Into<String>) -> Self {
        let quantities = ResourceQuantities {
            memory: Some(memory.into()),
            cpu: Some(cpu.into()),
        };
        Self {
            requests: Some(quantities.clone()),
            limits: Some(quantities),
        }
    }

    /// Checks every quantity parses.
    pub fn validate(&self) -> Result<()> {
        for q in [&self.requests, &self.limits].into_iter().flatten() {
            if let Some(mem) = &q.memory {
                parse_memory_quantity(mem)?;
            }
            if let Some(cpu) = &q.cpu {
                parse_cpu_quantity(cpu)?;
            }
        }
        Ok(())
    }

    /// Memory limit in bytes, for the container runtime API.
    pub fn memory_limit_bytes(&self) -> Option<i64> {
        let mem = self.limits.as_ref()?.memory.as_deref()?;
        parse_memory_quantity(mem).ok().map(|b| b as i64)
    }

    /// Memory reservation in bytes, for the container runtime API.
    pub fn memory_reservation_bytes(&self) -> Option<i64> {
        let mem = self.requests.as_ref()?.memory.as_deref()?;
        parse_memory_quantity(mem).ok().map(|b| b as i64)
    }

    /// CPU limit as NanoCPUs, for the container runtime API.
    pub fn nano_cpus(&self) -> Option<i64> {
        let cpu = self.limits.as_ref()?.cpu.as_deref()?;
        parse_cpu_quantity(cpu).ok().map(|m| (m as i64) * 1_000_000)
    }
}

/// Parses a memory quantity (`"512Mi"`, `"1G"`, `"1048576"`) into bytes.
pub fn parse_memory_quantity(quantity: &str) -> Result<u64> {
    const SUFFIXES: [(&str, u64); 8] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];

    let quantity = quantity.trim();
    let (digits, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| quantity.strip_suffix(suffix).map(|d| (d, *mult)))
        .unwrap_or((quantity, 1));

    digits
        .parse::<u64>()
        .map(|v| v * multiplier)
        .map_err(|_| OrchestratorError::config_validation(format!("invalid memory quantity '{quantity}'")))
}

/// Parses a CPU quantity (`"500m"`, `"2"`, `"0.5"`) into millicores.
pub fn parse_cpu_quantity(quantity: &str) -> Result<u64> {
    let quantity = quantity.trim();
    let invalid = || OrchestratorError::config_validation(format!("invalid cpu quantity '{quantity}'"));

    if let Some(milli) = quantity.strip_suffix('m') {
        return milli.parse::<u64>().map_err(|_| invalid());
    }
    let cores: f64 = quantity.parse().map_err(|_| invalid())?;
    if cores < 0.0 {
        return Err(invalid());
    }
    Ok((cores * 1000.0).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_image_parsing() {
        let image = ContainerImage::new("parity/polkadot:v1.0.0");
        assert_eq!(image.name(), "parity/polkadot");
        assert_eq!(image.tag(), Some("v1.0.0"));
        assert_eq!(image.registry(), None);
        assert_eq!(image.fully_qualified(), "docker.io/parity/polkadot:v1.0.0");
    }

    #[test]
    fn test_container_image_with_registry_port() {
        let image = ContainerImage::new("localhost:5000/polkadot");
        assert_eq!(image.registry(), Some("localhost:5000"));
        assert_eq!(image.name(), "localhost:5000/polkadot");
        assert_eq!(image.tag(), None);
        assert_eq!(image.fully_qualified(), "localhost:5000/polkadot");
    }

    #[test]
    fn test_container_image_validate() {
        assert!(ContainerImage::new("parity/polkadot:latest").validate().is_ok());
        assert!(ContainerImage::new("bad image").validate().is_err());
        assert!(ContainerImage::new("").validate().is_err());
    }

    #[test]
    fn test_memory_quantities() {
        assert_eq!(parse_memory_quantity("512Mi").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_quantity("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_memory_quantity("2048").unwrap(), 2048);
        assert!(parse_memory_quantity("lots").is_err());
    }

    #[test]
    fn test_cpu_quantities() {
        assert_eq!(parse_cpu_quantity("500m").unwrap(), 500);
        assert_eq!(parse_cpu_quantity("2").unwrap(), 2000);
        assert_eq!(parse_cpu_quantity("0.25").unwrap(), 250);
        assert!(parse_cpu_quantity("-1").is_err());
    }

    #[test]
    fn test_resources_conversions() {
        let resources = Resources::new("1Gi", "500m");
        assert!(resources.validate().is_ok());
        assert_eq!(resources.memory_limit_bytes(), Some(1 << 30));
        assert_eq!(resources.memory_reservation_bytes(), Some(1 << 30));
        assert_eq!(resources.nano_cpus(), Some(500_000_000));
        assert_eq!(Resources::default().nano_cpus(), None);
    }
}
