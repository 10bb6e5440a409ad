use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::store::atomic_write_text;
use crate::workspace::validate_node_name;

fn default_true() -> bool {
    true
}

fn default_backup_retention_days() -> u32 {
    30
}

fn default_sync_timeout() -> u64 {
    60
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_conflict_resolution() -> String {
    "manual".to_string()
}

fn default_binary_name() -> String {
    "datasim".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    pub user: String,
    pub key_path: String,
    pub conf_dir: String,
    pub binary_dir: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub backup_retention_days: u32,
    pub sync_timeout: u64,
    pub connection_timeout: u64,
    pub max_retries: u32,
    pub conflict_resolution: String,
    pub binary_name: String,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            backup_retention_days: default_backup_retention_days(),
            sync_timeout: default_sync_timeout(),
            connection_timeout: default_connection_timeout(),
            max_retries: default_max_retries(),
            conflict_resolution: default_conflict_resolution(),
            binary_name: default_binary_name(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct RegistryDoc {
    nodes: BTreeMap<String, NodeConfig>,
    cluster_settings: ClusterSettings,
}

/// The node registry: all configured nodes plus cluster-wide settings,
/// persisted as one YAML document rewritten wholesale on every mutation.
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
    doc: RegistryDoc,
}

impl Registry {
    /// Load the registry file; a missing file is an empty registry, a
    /// malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            warn!(path = %path.display(), "registry file not found, starting empty");
            return Ok(Self {
                path: path.to_path_buf(),
                doc: RegistryDoc::default(),
            });
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
        let doc: RegistryDoc = serde_yaml::from_str(&raw)
            .map_err(|e| Error::yaml(format!("registry parse error in {}", path.display()), e))?;
        Ok(Self {
            path: path.to_path_buf(),
            doc,
        })
    }

    fn save(&self) -> Result<()> {
        let body = serde_yaml::to_string(&self.doc)
            .map_err(|e| Error::yaml("failed to serialize registry", e))?;
        atomic_write_text(&self.path, &body)
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.doc.cluster_settings
    }

    pub fn nodes(&self) -> &BTreeMap<String, NodeConfig> {
        &self.doc.nodes
    }

    pub fn enabled_nodes(&self) -> BTreeMap<String, NodeConfig> {
        self.doc
            .nodes
            .iter()
            .filter(|(_, cfg)| cfg.enabled)
            .map(|(name, cfg)| (name.clone(), cfg.clone()))
            .collect()
    }

    pub fn get(&self, name: &str) -> Result<&NodeConfig> {
        self.doc
            .nodes
            .get(name)
            .ok_or_else(|| Error::not_found(format!("node '{name}'")))
    }

    /// Add or replace a node definition and persist immediately.
    pub fn add_node(&mut self, name: &str, config: NodeConfig) -> Result<()> {
        validate_node_name(name)?;
        self.doc.nodes.insert(name.to_string(), config);
        self.save()?;
        info!(node = name, "added node to registry");
        Ok(())
    }

    /// Remove a node definition and persist immediately. Fails with
    /// `NotFound` when the node is not registered.
    pub fn remove_node(&mut self, name: &str) -> Result<NodeConfig> {
        let removed = self
            .doc
            .nodes
            .remove(name)
            .ok_or_else(|| Error::not_found(format!("node '{name}'")))?;
        self.save()?;
        info!(node = name, "removed node from registry");
        Ok(removed)
    }
}
