use std::fs;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Local path layout for one tool workspace.
///
/// - `conf.d/`           local configuration tree (non-node edits)
/// - `conf_snapshots/`   one subdirectory per node, mirroring its remote tree
/// - `backups/`          timestamped pre-write copies
/// - `nodes.yaml`        node registry + cluster settings
#[derive(Debug, Clone)]
pub struct Paths {
    pub root: PathBuf,
    pub conf_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub registry_file: PathBuf,
}

impl Paths {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        let root = root.into();
        Self {
            conf_dir: root.join("conf.d"),
            snapshots_dir: root.join("conf_snapshots"),
            backups_dir: root.join("backups"),
            registry_file: root.join("nodes.yaml"),
            root,
        }
    }

    pub fn init_dirs(&self) -> Result<()> {
        for dir in [&self.snapshots_dir, &self.backups_dir] {
            fs::create_dir_all(dir)
                .map_err(|e| Error::io(format!("failed to create {}", dir.display()), e))?;
        }
        Ok(())
    }

    pub fn node_snapshot_dir(&self, node: &str) -> PathBuf {
        self.snapshots_dir.join(node)
    }

    /// Root of the mirrored remote configuration tree for a node.
    pub fn node_conf_dir(&self, node: &str) -> PathBuf {
        self.node_snapshot_dir(node).join("conf.d")
    }

    pub fn node_manifest_file(&self, node: &str) -> PathBuf {
        self.node_snapshot_dir(node).join("checksums.yaml")
    }

    pub fn node_backup_dir(&self, node: &str) -> PathBuf {
        self.backups_dir.join(node)
    }

    /// Configuration root a read-side operation should use: a node's
    /// snapshot when a node is named, the local tree otherwise.
    pub fn conf_root(&self, node: Option<&str>) -> PathBuf {
        match node {
            Some(name) => self.node_conf_dir(name),
            None => self.conf_dir.clone(),
        }
    }
}

/// Node names become path components under `conf_snapshots/` and `backups/`,
/// so they must not traverse.
pub fn validate_node_name(name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::invalid_format("node name is empty"));
    }
    if name.starts_with('.') {
        return Err(Error::invalid_format(format!(
            "node name '{name}' must not start with '.'"
        )));
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !ok {
        return Err(Error::invalid_format(format!(
            "node name '{name}' may only contain [A-Za-z0-9._-]"
        )));
    }
    Ok(())
}

/// Split a `module/submodule` path into its two components.
pub fn split_submodule_path(path: &str) -> Result<(&str, &str)> {
    match path.split_once('/') {
        Some((module, sub)) if !module.is_empty() && !sub.is_empty() => Ok((module, sub)),
        _ => Err(Error::invalid_format(format!(
            "expected 'module/submodule', got '{path}'"
        ))),
    }
}
