//! TOML configuration for the Reef daemon.
//!
//! Every section is optional; missing values fall back to defaults.

use std::path::{Path, PathBuf};

use reef_types::{LivenessConfig, NodeId, ReconcileConfig};
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Control plane data directory and API address.
    pub node: NodeSection,
    /// Storage nodes and liveness tuning.
    pub cluster: ClusterSection,
    /// Teardown and recovery tuning.
    pub reconcile: ReconcileConfig,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Directory for persistent data (metadata DB).
    pub data_dir: PathBuf,
    /// Address for the REST API.
    pub listen_addr: String,
    /// Keep all metadata in a temporary store discarded on exit.
    pub memory: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".reef"))
            .unwrap_or_else(|| PathBuf::from(".reef"));
        Self {
            data_dir,
            listen_addr: "0.0.0.0:4830".to_string(),
            memory: false,
        }
    }
}

/// `[cluster]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Storage node names served by in-process agents.
    pub nodes: Vec<String>,
    /// Heartbeat liveness tuning.
    pub liveness: LivenessConfig,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let contents = std::fs::read_to_string(p)
                    .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", p.display()))?;
                Ok(toml::from_str(&contents)?)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string.
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Storage nodes to serve, deduplicated. Defaults to a single `local`
    /// node.
    pub fn storage_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .cluster
            .nodes
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .map(NodeId::from)
            .collect();
        nodes.sort();
        nodes.dedup();
        if nodes.is_empty() {
            nodes.push(NodeId::new("local"));
        }
        nodes
    }

    /// Path of the metadata database.
    pub fn meta_path(&self) -> PathBuf {
        self.node.data_dir.join("meta")
    }
}
