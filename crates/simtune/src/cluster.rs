use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::eps;
use crate::registry::{NodeConfig, Registry};
use crate::schema::{self, ModuleConfig, SubmoduleConfig};
use crate::store::{self, YamlStore, atomic_write_text, checksum_bytes};
use crate::transport::{CancelToken, NodeTransport, SshTransport, sh_quote, sync_tree};
use crate::workspace::{Paths, split_submodule_path};

/// Snapshot manifest written next to each node's mirrored tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub timestamp: String,
    pub node: String,
    pub remote_path: String,
    pub checksums: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct FetchSummary {
    pub files: usize,
}

/// One discovered submodule, keyed by `module/submodule` in the discovery
/// map. `eligible` means the file carries a usable `uniquekey.NumUniqKey`.
#[derive(Debug, Clone)]
pub struct SubmoduleEntry {
    pub module: String,
    pub submodule: String,
    pub file_path: PathBuf,
    pub raw: String,
    pub config: SubmoduleConfig,
    pub eligible: bool,
    pub current_key: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub ok: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BulkEditReport {
    pub items: BTreeMap<String, ItemOutcome>,
}

impl BulkEditReport {
    pub fn succeeded(&self) -> usize {
        self.items.values().filter(|o| o.ok).count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }

    pub fn all_ok(&self) -> bool {
        self.failed() == 0
    }
}

#[derive(Debug, Clone)]
pub struct PushFailure {
    pub rel_path: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct PushReport {
    pub attempted: usize,
    pub pushed: usize,
    pub failures: Vec<PushFailure>,
}

impl PushReport {
    /// Overall success is lenient: any pushed file counts. Callers wanting
    /// strict semantics should check `failures` as well.
    pub fn success(&self) -> bool {
        self.pushed > 0
    }
}

#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub enabled: bool,
    pub host: String,
    pub has_snapshot: bool,
    pub last_sync: Option<String>,
    pub config_files: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterStatus {
    pub total_nodes: usize,
    pub enabled_nodes: usize,
    pub disabled_nodes: usize,
    pub nodes: BTreeMap<String, NodeStatus>,
}

/// Drift of a local snapshot against its fetch-time manifest.
#[derive(Debug, Clone, Default)]
pub struct SnapshotDrift {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl SnapshotDrift {
    pub fn is_clean(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ModuleEps {
    pub module_uniquekey: u64,
    pub submodule_count: usize,
    pub submodule_key_sum: u64,
    pub eps: f64,
}

#[derive(Debug, Clone)]
pub struct ClusterEpsReport {
    pub node: Option<String>,
    pub period_seconds: f64,
    pub total_eps: f64,
    pub modules: BTreeMap<String, ModuleEps>,
}

/// Arithmetic transforms applied to current unique-key values when building
/// a bulk-edit update map.
#[derive(Debug, Clone, Copy)]
pub enum KeyTransform {
    /// `max(1, trunc(current * factor))`
    Multiply(f64),
    /// `max(0, current + delta)`
    Add(i64),
    /// Raise values below the floor: `max(current, min)`
    RaiseToMin(u64),
    /// Cap values above the ceiling: `min(current, max)`
    CapAtMax(u64),
}

impl KeyTransform {
    pub fn apply(&self, current: u64) -> u64 {
        match *self {
            KeyTransform::Multiply(factor) => ((current as f64 * factor) as u64).max(1),
            KeyTransform::Add(delta) => (current as i64).saturating_add(delta).max(0) as u64,
            KeyTransform::RaiseToMin(min) => current.max(min),
            KeyTransform::CapAtMax(max) => current.min(max),
        }
    }
}

/// Same value for every eligible submodule of the named modules.
pub fn updates_for_modules(
    entries: &BTreeMap<String, SubmoduleEntry>,
    modules: &[String],
    value: u64,
) -> BTreeMap<String, u64> {
    entries
        .iter()
        .filter(|(_, e)| e.eligible && modules.iter().any(|m| *m == e.module))
        .map(|(path, _)| (path.clone(), value))
        .collect()
}

/// Same value for every eligible submodule whose leaf name matches.
pub fn updates_for_submodule_names(
    entries: &BTreeMap<String, SubmoduleEntry>,
    names: &[String],
    value: u64,
) -> BTreeMap<String, u64> {
    entries
        .iter()
        .filter(|(_, e)| e.eligible && names.iter().any(|n| *n == e.submodule))
        .map(|(path, _)| (path.clone(), value))
        .collect()
}

/// Same value for every eligible submodule.
pub fn updates_for_all(
    entries: &BTreeMap<String, SubmoduleEntry>,
    value: u64,
) -> BTreeMap<String, u64> {
    entries
        .iter()
        .filter(|(_, e)| e.eligible)
        .map(|(path, _)| (path.clone(), value))
        .collect()
}

/// Transform current values, keeping only entries that actually change.
/// An empty module filter means all modules.
pub fn updates_with_transform(
    entries: &BTreeMap<String, SubmoduleEntry>,
    transform: KeyTransform,
    module_filter: &[String],
) -> BTreeMap<String, u64> {
    let mut updates = BTreeMap::new();
    for (path, entry) in entries {
        if !entry.eligible {
            continue;
        }
        if !module_filter.is_empty() && !module_filter.iter().any(|m| *m == entry.module) {
            continue;
        }
        let current = entry.current_key.unwrap_or(0);
        let new_value = transform.apply(current);
        if new_value != current {
            updates.insert(path.clone(), new_value);
        }
    }
    updates
}

/// Owns the node registry and local snapshot/backup trees and orchestrates
/// every multi-node operation. Constructed once at process start; no
/// ambient global state.
pub struct ClusterManager {
    paths: Paths,
    registry: Registry,
    store: YamlStore,
    cancel: CancelToken,
}

impl ClusterManager {
    pub fn open(paths: Paths) -> Result<Self> {
        paths.init_dirs()?;
        let registry = Registry::load(&paths.registry_file)?;
        let store = YamlStore::new(&paths.backups_dir);
        Ok(Self {
            paths,
            registry,
            store,
            cancel: CancelToken::new(),
        })
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &YamlStore {
        &self.store
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn add_node(&mut self, name: &str, config: NodeConfig) -> Result<()> {
        self.registry.add_node(name, config)
    }

    /// Remove a node and delete its snapshot and backup trees. Irreversible;
    /// confirmation belongs to the caller.
    pub fn remove_node(&mut self, name: &str) -> Result<()> {
        self.registry.remove_node(name)?;
        for dir in [
            self.paths.node_snapshot_dir(name),
            self.paths.node_backup_dir(name),
        ] {
            if dir.exists() {
                fs::remove_dir_all(&dir)
                    .map_err(|e| Error::io(format!("failed to remove {}", dir.display()), e))?;
            }
        }
        Ok(())
    }

    fn require_enabled(&self, name: &str) -> Result<NodeConfig> {
        let config = self.registry.get(name)?;
        if !config.enabled {
            return Err(Error::node(name, "node is disabled"));
        }
        Ok(config.clone())
    }

    fn open_transport(&self, name: &str, config: &NodeConfig) -> Result<SshTransport> {
        SshTransport::new(name, config, self.registry.settings())
    }

    /// Fetch one node's configuration tree into a fresh local snapshot.
    /// The previous snapshot is deleted first: fetch replaces, never merges.
    pub fn fetch_node(&self, name: &str) -> Result<FetchSummary> {
        let config = self.require_enabled(name)?;
        let transport = self.open_transport(name, &config)?;
        let outcome = self.fetch_node_with(name, &config, &transport);
        transport.close();
        outcome
    }

    pub fn fetch_node_with(
        &self,
        name: &str,
        config: &NodeConfig,
        transport: &dyn NodeTransport,
    ) -> Result<FetchSummary> {
        transport.connect()?;

        let snapshot_dir = self.paths.node_snapshot_dir(name);
        if snapshot_dir.exists() {
            fs::remove_dir_all(&snapshot_dir).map_err(|e| {
                Error::io(format!("failed to remove {}", snapshot_dir.display()), e)
            })?;
        }

        info!(node = name, remote = %config.conf_dir, "fetching configuration tree");
        let jobs = num_cpus::get().min(8);
        let checksums = sync_tree(
            transport,
            &config.conf_dir,
            &self.paths.node_conf_dir(name),
            jobs,
            &self.cancel,
        )?;

        let manifest = SnapshotManifest {
            timestamp: chrono::Local::now().to_rfc3339(),
            node: name.to_string(),
            remote_path: config.conf_dir.clone(),
            checksums,
        };
        self.write_manifest(name, &manifest)?;

        let files = manifest.checksums.len();
        info!(node = name, files, "fetched configuration tree");
        Ok(FetchSummary { files })
    }

    fn write_manifest(&self, name: &str, manifest: &SnapshotManifest) -> Result<()> {
        let body = serde_yaml::to_string(manifest)
            .map_err(|e| Error::yaml("failed to serialize snapshot manifest", e))?;
        atomic_write_text(&self.paths.node_manifest_file(name), &body)
    }

    pub fn read_manifest(&self, name: &str) -> Result<SnapshotManifest> {
        let path = self.paths.node_manifest_file(name);
        if !path.is_file() {
            return Err(Error::not_found(path.display().to_string()));
        }
        let raw = fs::read_to_string(&path)
            .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::yaml(format!("manifest parse error in {}", path.display()), e))
    }

    /// Fetch every enabled node, one worker per node, collecting
    /// independent per-node results.
    pub fn fetch_all(&self) -> BTreeMap<String, Result<FetchSummary>> {
        let nodes = self.registry.enabled_nodes();
        info!(nodes = nodes.len(), "fetching configuration from all enabled nodes");

        let results = Mutex::new(BTreeMap::new());
        thread::scope(|scope| {
            for name in nodes.keys() {
                if self.cancel.cancelled() {
                    break;
                }
                let results = &results;
                scope.spawn(move || {
                    let outcome = self.fetch_node(name);
                    results
                        .lock()
                        .expect("fetch results lock")
                        .insert(name.clone(), outcome);
                });
            }
        });

        let results = results.into_inner().expect("fetch results lock");
        let ok = results.values().filter(|r| r.is_ok()).count();
        info!(ok, total = results.len(), "fetch-all finished");
        results
    }

    /// Discover every submodule referenced by `Include_sub_modules` across
    /// the snapshot (or local) tree, keyed by `module/submodule`. Missing
    /// referenced files are skipped silently.
    pub fn enumerate_submodules(
        &self,
        node: Option<&str>,
    ) -> Result<BTreeMap<String, SubmoduleEntry>> {
        let conf_root = self.paths.conf_root(node);
        if !conf_root.is_dir() {
            return Err(Error::not_found(conf_root.display().to_string()));
        }

        let mut out = BTreeMap::new();
        let dirs = fs::read_dir(&conf_root)
            .map_err(|e| Error::io(format!("failed to list {}", conf_root.display()), e))?;
        for dir_entry in dirs {
            let dir_entry =
                dir_entry.map_err(|e| Error::io("failed to read directory entry".to_string(), e))?;
            let module_dir = dir_entry.path();
            let Some(module_name) = module_dir.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if !module_dir.is_dir() || module_name.starts_with('.') {
                continue;
            }
            let conf_path = module_dir.join("conf.yml");
            if !conf_path.is_file() {
                continue;
            }

            let module_config = match self
                .store
                .read(&conf_path)
                .and_then(|(value, _)| ModuleConfig::from_value(&value))
            {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(module = module_name, error = %e, "skipping unreadable module config");
                    continue;
                }
            };
            let Some(include) = module_config.include_sub_modules else {
                continue;
            };

            for entry in include.entries() {
                if entry == "*" {
                    for sub in self.wildcard_submodules(&module_dir)? {
                        let path = module_dir.join(format!("{sub}.yml"));
                        self.collect_submodule(&mut out, module_name, &sub, &path);
                    }
                } else {
                    let path = module_dir.join(format!("{entry}.yml"));
                    if !path.is_file() {
                        debug!(module = module_name, submodule = entry, "referenced submodule file missing, skipped");
                        continue;
                    }
                    self.collect_submodule(&mut out, module_name, entry, &path);
                }
            }
        }
        Ok(out)
    }

    fn wildcard_submodules(&self, module_dir: &Path) -> Result<Vec<String>> {
        let entries = fs::read_dir(module_dir)
            .map_err(|e| Error::io(format!("failed to list {}", module_dir.display()), e))?;
        let mut subs = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::io("failed to read directory entry".to_string(), e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if name == "conf.yml" {
                continue;
            }
            if let Some(stem) = name.strip_suffix(".yml") {
                subs.push(stem.to_string());
            }
        }
        subs.sort();
        Ok(subs)
    }

    fn collect_submodule(
        &self,
        out: &mut BTreeMap<String, SubmoduleEntry>,
        module: &str,
        submodule: &str,
        path: &Path,
    ) {
        let raw = match self.store.read_raw(path) {
            Ok((raw, _)) => raw,
            Err(e) => {
                warn!(module, submodule, error = %e, "skipping unreadable submodule file");
                return;
            }
        };
        let config = match SubmoduleConfig::from_str(&raw) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(module, submodule, error = %e, "skipping unparsable submodule file");
                return;
            }
        };
        let eligible = config.has_usable_key();
        let current_key = config.unique_key();
        out.insert(
            format!("{module}/{submodule}"),
            SubmoduleEntry {
                module: module.to_string(),
                submodule: submodule.to_string(),
                file_path: path.to_path_buf(),
                raw,
                config,
                eligible,
                current_key,
            },
        );
    }

    /// Apply unique-key updates to one node's live configuration, one
    /// transport connection reused for all items. Per-item failures are
    /// recorded and do not abort the batch; only a connection-level failure
    /// is an error.
    pub fn bulk_edit(
        &self,
        node: &str,
        updates: &BTreeMap<String, u64>,
        backup: bool,
    ) -> Result<BulkEditReport> {
        let config = self.require_enabled(node)?;
        let transport = self.open_transport(node, &config)?;
        let outcome = self.bulk_edit_with(node, &config, &transport, updates, backup);
        transport.close();
        outcome
    }

    pub fn bulk_edit_with(
        &self,
        node: &str,
        config: &NodeConfig,
        transport: &dyn NodeTransport,
        updates: &BTreeMap<String, u64>,
        backup: bool,
    ) -> Result<BulkEditReport> {
        if backup {
            if let Err(e) = self.backup_node_snapshot(node) {
                warn!(node, error = %e, "snapshot backup before bulk edit failed");
            }
        }
        transport.connect()?;
        let scratch_dir = tempfile::tempdir()
            .map_err(|e| Error::io("failed to create scratch dir", e))?;

        let mut report = BulkEditReport::default();
        for (submodule_path, &new_value) in updates {
            if self.cancel.cancelled() {
                warn!(node, "bulk edit cancelled between items");
                break;
            }
            match self.edit_one_remote(transport, config, scratch_dir.path(), submodule_path, new_value)
            {
                Ok(()) => {
                    info!(node, path = %submodule_path, value = new_value, "updated unique key");
                    report.items.insert(
                        submodule_path.clone(),
                        ItemOutcome {
                            ok: true,
                            error: None,
                        },
                    );
                }
                Err(e) => {
                    warn!(node, path = %submodule_path, error = %e, "bulk edit item failed");
                    report.items.insert(
                        submodule_path.clone(),
                        ItemOutcome {
                            ok: false,
                            error: Some(e.to_string()),
                        },
                    );
                }
            }
        }
        Ok(report)
    }

    fn edit_one_remote(
        &self,
        transport: &dyn NodeTransport,
        config: &NodeConfig,
        scratch_dir: &Path,
        submodule_path: &str,
        new_value: u64,
    ) -> Result<()> {
        let (module, submodule) = split_submodule_path(submodule_path)?;
        let remote = format!(
            "{}/{}/{}.yml",
            config.conf_dir.trim_end_matches('/'),
            module,
            submodule
        );
        let scratch = scratch_dir.join(format!("{module}__{submodule}.yml"));

        let result = (|| {
            transport.fetch_file(&remote, &scratch)?;
            let raw = fs::read(&scratch)
                .map_err(|e| Error::io(format!("failed to read {}", scratch.display()), e))?;
            let mut value: Value = serde_yaml::from_slice(&raw)
                .map_err(|e| Error::yaml(format!("YAML parse error in {remote}"), e))?;
            schema::set_unique_key(&mut value, new_value);
            let body = serde_yaml::to_string(&value)
                .map_err(|e| Error::yaml(format!("failed to serialize {remote}"), e))?;
            fs::write(&scratch, body)
                .map_err(|e| Error::io(format!("failed to write {}", scratch.display()), e))?;
            transport.push_file(&scratch, &remote)
        })();

        let _ = fs::remove_file(&scratch);
        result
    }

    /// Run the single-node bulk edit against many nodes, sequentially,
    /// collecting independent per-node results. No cross-node rollback.
    pub fn bulk_edit_all(
        &self,
        updates: &BTreeMap<String, u64>,
        target_nodes: Option<&[String]>,
        backup: bool,
    ) -> BTreeMap<String, Result<BulkEditReport>> {
        let targets: Vec<String> = match target_nodes {
            Some(t) => t.to_vec(),
            None => self.registry.enabled_nodes().keys().cloned().collect(),
        };

        let mut all = BTreeMap::new();
        for node in targets {
            if self.cancel.cancelled() {
                break;
            }
            let outcome = self.bulk_edit(&node, updates, backup);
            if let Ok(report) = &outcome {
                info!(
                    node = node.as_str(),
                    ok = report.succeeded(),
                    total = report.items.len(),
                    "bulk edit finished"
                );
            }
            all.insert(node, outcome);
        }
        all
    }

    /// Build the update map for "set this value for every eligible
    /// submodule of one module"; feed the result to `bulk_edit` /
    /// `bulk_edit_all`.
    pub fn module_update_map(
        &self,
        node: Option<&str>,
        module: &str,
        value: u64,
    ) -> Result<BTreeMap<String, u64>> {
        let entries = self.enumerate_submodules(node)?;
        Ok(updates_for_modules(&entries, &[module.to_string()], value))
    }

    fn module_level_key(&self, conf_root: &Path, module: &str) -> u64 {
        let path = store::module_config_path(conf_root, module);
        match self
            .store
            .read(&path)
            .and_then(|(value, _)| ModuleConfig::from_value(&value))
        {
            Ok(cfg) => cfg.unique_key(),
            Err(e) => {
                warn!(module, error = %e, "module-level key unavailable, defaulting to 1");
                schema::DEFAULT_UNIQUE_KEY
            }
        }
    }

    /// EPS roll-up for the named modules over a snapshot (or local) tree,
    /// using the same formula as the per-module engine. The module-level
    /// key comes from each module's own `conf.yml`, defaulting to 1.
    pub fn eps_for_modules(
        &self,
        modules: &[String],
        node: Option<&str>,
        period_seconds: f64,
        refresh: bool,
    ) -> Result<ClusterEpsReport> {
        if refresh {
            if let Some(name) = node {
                if let Err(e) = self.fetch_node(name) {
                    warn!(node = name, error = %e, "fetch failed, using cached snapshot");
                }
            }
        }

        let entries = self.enumerate_submodules(node)?;
        let conf_root = self.paths.conf_root(node);

        let mut report = ClusterEpsReport {
            node: node.map(str::to_string),
            period_seconds,
            total_eps: 0.0,
            modules: BTreeMap::new(),
        };

        for module in modules {
            let module_uniquekey = self.module_level_key(&conf_root, module);
            let eligible: Vec<&SubmoduleEntry> = entries
                .values()
                .filter(|e| e.eligible && e.module == *module)
                .collect();
            let submodule_key_sum: u64 =
                eligible.iter().map(|e| e.current_key.unwrap_or(0)).sum();
            let module_eps = eps::compute_eps(module_uniquekey, submodule_key_sum, period_seconds);

            report.total_eps += module_eps;
            report.modules.insert(
                module.clone(),
                ModuleEps {
                    module_uniquekey,
                    submodule_count: eligible.len(),
                    submodule_key_sum,
                    eps: module_eps,
                },
            );
        }
        Ok(report)
    }

    /// Roll-up across every module that has at least one eligible submodule.
    pub fn eps_summary_all(
        &self,
        node: Option<&str>,
        period_seconds: f64,
    ) -> Result<ClusterEpsReport> {
        let entries = self.enumerate_submodules(node)?;
        let mut modules: Vec<String> = entries
            .values()
            .filter(|e| e.eligible)
            .map(|e| e.module.clone())
            .collect();
        modules.sort();
        modules.dedup();
        self.eps_for_modules(&modules, node, period_seconds, false)
    }

    /// Every config file in a node's local snapshot tree, sorted.
    pub fn snapshot_files(&self, node: &str) -> Vec<PathBuf> {
        let conf_dir = self.paths.node_conf_dir(node);
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&conf_dir)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let ext = entry.path().extension().and_then(|s| s.to_str());
            if matches!(ext, Some("yml") | Some("yaml")) {
                files.push(entry.path().to_path_buf());
            }
        }
        files.sort();
        files
    }

    /// Push every config file of the node's snapshot back to the node.
    /// Per-file failures are collected; overall success is lenient
    /// (`pushed > 0`).
    pub fn push_all(&self, node: &str, backup: bool) -> Result<PushReport> {
        let config = self.require_enabled(node)?;
        let transport = self.open_transport(node, &config)?;
        let outcome = self.push_all_with(node, &config, &transport, backup);
        transport.close();
        outcome
    }

    pub fn push_all_with(
        &self,
        node: &str,
        config: &NodeConfig,
        transport: &dyn NodeTransport,
        backup: bool,
    ) -> Result<PushReport> {
        let local_dir = self.paths.node_conf_dir(node);
        if !local_dir.is_dir() {
            return Err(Error::not_found(format!(
                "snapshot for node '{node}' ({})",
                local_dir.display()
            )));
        }
        let files = self.snapshot_files(node);
        if files.is_empty() {
            return Err(Error::not_found(format!(
                "no configuration files in snapshot for node '{node}'"
            )));
        }

        transport.connect()?;
        let remote_root = config.conf_dir.trim_end_matches('/').to_string();
        info!(node, files = files.len(), "pushing snapshot tree");

        let mut report = PushReport::default();
        for file in &files {
            if self.cancel.cancelled() {
                warn!(node, "push cancelled between files");
                break;
            }
            report.attempted += 1;
            let rel = match file.strip_prefix(&local_dir) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let rel_text = rel
                .iter()
                .map(|c| c.to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if backup {
                if let Err(e) = self.backup_for_node(node, file) {
                    warn!(node, file = rel_text.as_str(), error = %e, "backup before push failed");
                }
            }

            let remote_path = format!("{remote_root}/{rel_text}");
            let pushed = (|| {
                if let Some(parent) = Path::new(&remote_path)
                    .parent()
                    .and_then(|p| p.to_str())
                {
                    transport.ensure_directory(parent)?;
                }
                transport.push_file(file, &remote_path)
            })();

            match pushed {
                Ok(()) => {
                    debug!(node, file = rel_text.as_str(), "pushed");
                    report.pushed += 1;
                }
                Err(e) => {
                    warn!(node, file = rel_text.as_str(), error = %e, "push failed");
                    report.failures.push(PushFailure {
                        rel_path: rel_text,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(node, pushed = report.pushed, total = report.attempted, "push finished");
        Ok(report)
    }

    /// Push to many nodes sequentially; independent per-node results.
    pub fn push_all_nodes(
        &self,
        target_nodes: Option<&[String]>,
        backup: bool,
    ) -> BTreeMap<String, Result<PushReport>> {
        let targets: Vec<String> = match target_nodes {
            Some(t) => t.to_vec(),
            None => self.registry.enabled_nodes().keys().cloned().collect(),
        };

        let mut all = BTreeMap::new();
        for node in targets {
            if self.cancel.cancelled() {
                break;
            }
            let outcome = self.push_all(&node, backup);
            all.insert(node, outcome);
        }
        all
    }

    /// Restart the simulator process on a node: best-effort kill by name,
    /// brief pause, detached relaunch. Fire-and-forget; only the command
    /// exit status is checked.
    pub fn restart(&self, node: &str) -> Result<()> {
        let config = self.require_enabled(node)?;
        let binary = self.registry.settings().binary_name.clone();
        let transport = self.open_transport(node, &config)?;

        let outcome = (|| {
            transport.connect()?;
            transport.run_command(&format!("pkill -f {} || true", sh_quote(&binary)))?;
            thread::sleep(Duration::from_secs(2));
            let start = format!(
                "cd {} && nohup ./{} > /dev/null 2>&1 &",
                sh_quote(&config.binary_dir),
                binary
            );
            let out = transport.run_command(&start)?;
            if out.exit_status != 0 {
                return Err(Error::node(
                    node,
                    format!("restart command failed: {}", out.stderr.trim()),
                ));
            }
            info!(node, binary = binary.as_str(), "restarted simulator");
            Ok(())
        })();
        transport.close();
        outcome
    }

    /// Per-node snapshot presence, last sync time and file counts.
    pub fn status(&self) -> ClusterStatus {
        let nodes = self.registry.nodes();
        let mut status = ClusterStatus {
            total_nodes: nodes.len(),
            enabled_nodes: nodes.values().filter(|n| n.enabled).count(),
            ..ClusterStatus::default()
        };
        status.disabled_nodes = status.total_nodes - status.enabled_nodes;

        for (name, config) in nodes {
            let has_snapshot = self.paths.node_snapshot_dir(name).exists();
            let last_sync = self.read_manifest(name).ok().map(|m| m.timestamp);
            status.nodes.insert(
                name.clone(),
                NodeStatus {
                    enabled: config.enabled,
                    host: config.host.clone(),
                    has_snapshot,
                    last_sync,
                    config_files: self.snapshot_files(name).len(),
                },
            );
        }
        status
    }

    /// Compare a node's snapshot against its fetch-time manifest and report
    /// files added, removed or modified locally since the fetch.
    pub fn verify_snapshot(&self, node: &str) -> Result<SnapshotDrift> {
        let manifest = self.read_manifest(node)?;
        let conf_dir = self.paths.node_conf_dir(node);

        let mut current = BTreeMap::new();
        for file in self.snapshot_files(node) {
            let Ok(rel) = file.strip_prefix(&conf_dir) else {
                continue;
            };
            let rel_text = rel
                .iter()
                .map(|c| c.to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let bytes = fs::read(&file)
                .map_err(|e| Error::io(format!("failed to read {}", file.display()), e))?;
            current.insert(rel_text, checksum_bytes(&bytes));
        }

        let mut drift = SnapshotDrift::default();
        for (rel, checksum) in &current {
            match manifest.checksums.get(rel) {
                None => drift.added.push(rel.clone()),
                Some(recorded) if recorded != checksum => drift.modified.push(rel.clone()),
                Some(_) => {}
            }
        }
        for rel in manifest.checksums.keys() {
            if !current.contains_key(rel) {
                drift.removed.push(rel.clone());
            }
        }
        Ok(drift)
    }

    /// Timestamped copy of every snapshot file, cluster naming convention:
    /// `backups/<node>/<stem>_<timestamp><ext>`.
    fn backup_node_snapshot(&self, node: &str) -> Result<usize> {
        let files = self.snapshot_files(node);
        for file in &files {
            self.backup_for_node(node, file)?;
        }
        Ok(files.len())
    }

    fn backup_for_node(&self, node: &str, file: &Path) -> Result<PathBuf> {
        let backup_dir = self.paths.node_backup_dir(node);
        fs::create_dir_all(&backup_dir)
            .map_err(|e| Error::io(format!("failed to create {}", backup_dir.display()), e))?;

        let stem = file
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::invalid_format(format!("cannot back up {}", file.display())))?;
        let ext = file
            .extension()
            .and_then(|s| s.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let backup_path = backup_dir.join(format!("{stem}_{timestamp}{ext}"));

        fs::copy(file, &backup_path).map_err(|e| {
            Error::io(
                format!("failed to back up {} -> {}", file.display(), backup_path.display()),
                e,
            )
        })?;
        Ok(backup_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(module: &str, submodule: &str, key: Option<u64>, eligible: bool) -> SubmoduleEntry {
        SubmoduleEntry {
            module: module.to_string(),
            submodule: submodule.to_string(),
            file_path: PathBuf::from(format!("{module}/{submodule}.yml")),
            raw: String::new(),
            config: SubmoduleConfig::default(),
            eligible,
            current_key: key,
        }
    }

    fn sample_entries() -> BTreeMap<String, SubmoduleEntry> {
        let mut map = BTreeMap::new();
        map.insert("Apache/status".into(), entry("Apache", "status", Some(100), true));
        map.insert("Apache/vhost".into(), entry("Apache", "vhost", Some(200), true));
        map.insert("Nginx/status".into(), entry("Nginx", "status", Some(50), true));
        map.insert("Nginx/plain".into(), entry("Nginx", "plain", None, false));
        map
    }

    #[test]
    fn module_builder_targets_one_module() {
        let updates = updates_for_modules(&sample_entries(), &["Apache".to_string()], 999);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates["Apache/status"], 999);
        assert_eq!(updates["Apache/vhost"], 999);
    }

    #[test]
    fn name_builder_crosses_modules_but_skips_ineligible() {
        let updates = updates_for_submodule_names(&sample_entries(), &["status".to_string()], 7);
        assert_eq!(updates.len(), 2);
        assert!(updates.contains_key("Apache/status"));
        assert!(updates.contains_key("Nginx/status"));
    }

    #[test]
    fn all_builder_takes_every_eligible_entry() {
        let updates = updates_for_all(&sample_entries(), 1);
        assert_eq!(updates.len(), 3);
        assert!(!updates.contains_key("Nginx/plain"));
    }

    #[test]
    fn transforms_follow_clamping_rules() {
        assert_eq!(KeyTransform::Multiply(2.5).apply(100), 250);
        assert_eq!(KeyTransform::Multiply(0.001).apply(100), 1);
        assert_eq!(KeyTransform::Multiply(1.5).apply(3), 4); // truncation, not rounding
        assert_eq!(KeyTransform::Add(-500).apply(100), 0);
        assert_eq!(KeyTransform::Add(50).apply(100), 150);
        assert_eq!(KeyTransform::RaiseToMin(1000).apply(100), 1000);
        assert_eq!(KeyTransform::RaiseToMin(1000).apply(2000), 2000);
        assert_eq!(KeyTransform::CapAtMax(150).apply(100), 100);
        assert_eq!(KeyTransform::CapAtMax(150).apply(2000), 150);
    }

    #[test]
    fn transform_builder_drops_unchanged_values() {
        let updates =
            updates_with_transform(&sample_entries(), KeyTransform::RaiseToMin(100), &[]);
        // Apache/status (100) and Apache/vhost (200) are already at or above
        // the floor; only Nginx/status (50) changes.
        assert_eq!(updates.len(), 1);
        assert_eq!(updates["Nginx/status"], 100);
        assert!(!updates.contains_key("Apache/status"));
        assert!(!updates.contains_key("Apache/vhost"));
    }

    #[test]
    fn transform_builder_honors_module_filter() {
        let updates = updates_with_transform(
            &sample_entries(),
            KeyTransform::Multiply(2.0),
            &["Nginx".to_string()],
        );
        assert_eq!(updates.len(), 1);
        assert_eq!(updates["Nginx/status"], 100);
    }
}
