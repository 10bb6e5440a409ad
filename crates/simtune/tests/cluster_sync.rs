use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use simtune::cluster::ClusterManager;
use simtune::error::{Error, Result};
use simtune::registry::NodeConfig;
use simtune::schema::SubmoduleConfig;
use simtune::transport::{CommandOutput, DirEntry, NodeTransport};
use simtune::workspace::Paths;

/// A transport whose "remote" is a plain local directory, with injectable
/// per-path fetch/push failures.
struct FakeTransport {
    node: String,
    fail_fetch: Mutex<HashSet<String>>,
    fail_push: Mutex<HashSet<String>>,
}

impl FakeTransport {
    fn new(node: &str) -> Self {
        Self {
            node: node.to_string(),
            fail_fetch: Mutex::new(HashSet::new()),
            fail_push: Mutex::new(HashSet::new()),
        }
    }

    fn fail_push_on(&self, remote: &str) {
        self.fail_push.lock().expect("lock").insert(remote.to_string());
    }

    fn fail_fetch_on(&self, remote: &str) {
        self.fail_fetch.lock().expect("lock").insert(remote.to_string());
    }
}

impl NodeTransport for FakeTransport {
    fn node_name(&self) -> &str {
        &self.node
    }

    fn connect(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) {}

    fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        let entries = fs::read_dir(path)
            .map_err(|e| Error::node(&self.node, format!("failed to list {path}: {e}")))?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::node(&self.node, e.to_string()))?;
            out.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_directory: entry.path().is_dir(),
            });
        }
        Ok(out)
    }

    fn fetch_file(&self, remote: &str, local: &Path) -> Result<()> {
        if self.fail_fetch.lock().expect("lock").contains(remote) {
            return Err(Error::node(&self.node, format!("injected fetch failure: {remote}")));
        }
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::node(&self.node, e.to_string()))?;
        }
        fs::copy(remote, local)
            .map_err(|e| Error::node(&self.node, format!("fetch {remote} failed: {e}")))?;
        Ok(())
    }

    fn push_file(&self, local: &Path, remote: &str) -> Result<()> {
        if self.fail_push.lock().expect("lock").contains(remote) {
            return Err(Error::node(&self.node, format!("injected push failure: {remote}")));
        }
        if let Some(parent) = Path::new(remote).parent() {
            fs::create_dir_all(parent).map_err(|e| Error::node(&self.node, e.to_string()))?;
        }
        fs::copy(local, remote)
            .map_err(|e| Error::node(&self.node, format!("push {remote} failed: {e}")))?;
        Ok(())
    }

    fn ensure_directory(&self, remote: &str) -> Result<()> {
        fs::create_dir_all(remote).map_err(|e| Error::node(&self.node, e.to_string()))
    }

    fn run_command(&self, _cmd: &str) -> Result<CommandOutput> {
        Ok(CommandOutput {
            exit_status: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

struct TestCluster {
    _tmp: tempfile::TempDir,
    manager: ClusterManager,
    remote_conf: PathBuf,
}

fn write_remote_module(remote_conf: &Path, module: &str, conf: &str, subs: &[(&str, &str)]) {
    let dir = remote_conf.join(module);
    fs::create_dir_all(&dir).expect("remote module dir");
    fs::write(dir.join("conf.yml"), conf).expect("remote module conf");
    for (name, body) in subs {
        fs::write(dir.join(format!("{name}.yml")), body).expect("remote submodule");
    }
}

fn setup() -> TestCluster {
    let tmp = tempfile::tempdir().expect("tempdir");
    let remote_conf = tmp.path().join("remote").join("conf.d");

    write_remote_module(
        &remote_conf,
        "Apache",
        "enabled: true\nperiod: 1s\nuniquekey:\n  NumUniqKey: 5\nInclude_sub_modules: '*'\n",
        &[
            ("status", "uniquekey:\n  NumUniqKey: 100\n"),
            ("vhost", "uniquekey:\n  NumUniqKey: 200\n"),
        ],
    );
    // Explicit include list referencing one existing and one missing file;
    // extra.yml exists but is not referenced.
    write_remote_module(
        &remote_conf,
        "Nginx",
        "period: 1s\nInclude_sub_modules:\n  - status\n  - ghost\n",
        &[
            ("status", "uniquekey:\n  NumUniqKey: 50\n"),
            ("extra", "uniquekey:\n  NumUniqKey: 75\n"),
        ],
    );
    write_remote_module(
        &remote_conf,
        "Plain",
        "Include_sub_modules: '*'\n",
        &[("nokey", "output:\n  kafka:\n    topic: plain-events\n")],
    );

    let workspace = tmp.path().join("workspace");
    let mut manager = ClusterManager::open(Paths::new(&workspace)).expect("open manager");
    manager
        .add_node(
            "edge-1",
            NodeConfig {
                host: "198.51.100.10".to_string(),
                user: "sim".to_string(),
                key_path: "~/.ssh/id_ed25519".to_string(),
                conf_dir: remote_conf.to_string_lossy().to_string(),
                binary_dir: "/opt/datasim/bin".to_string(),
                description: "test node".to_string(),
                enabled: true,
            },
        )
        .expect("add node");

    TestCluster {
        _tmp: tmp,
        manager,
        remote_conf,
    }
}

fn fetch(cluster: &TestCluster) -> FakeTransport {
    let transport = FakeTransport::new("edge-1");
    let config = cluster.manager.registry().get("edge-1").expect("node").clone();
    cluster
        .manager
        .fetch_node_with("edge-1", &config, &transport)
        .expect("fetch");
    transport
}

fn remote_unique_key(remote_conf: &Path, module: &str, sub: &str) -> Option<u64> {
    let raw = fs::read_to_string(remote_conf.join(module).join(format!("{sub}.yml"))).ok()?;
    SubmoduleConfig::from_str(&raw).ok()?.unique_key()
}

#[test]
fn fetch_mirrors_tree_and_writes_manifest() {
    let cluster = setup();
    fetch(&cluster);

    let snapshot = cluster.manager.paths().node_conf_dir("edge-1");
    assert!(snapshot.join("Apache/conf.yml").is_file());
    assert!(snapshot.join("Apache/status.yml").is_file());
    assert!(snapshot.join("Nginx/extra.yml").is_file());

    let manifest = cluster.manager.read_manifest("edge-1").expect("manifest");
    assert_eq!(manifest.node, "edge-1");
    assert_eq!(manifest.checksums.len(), 8);
    assert!(manifest.checksums.contains_key("Apache/status.yml"));
    assert!(!manifest.timestamp.is_empty());
}

#[test]
fn fetch_replaces_instead_of_merging() {
    let cluster = setup();
    fetch(&cluster);
    let snapshot = cluster.manager.paths().node_conf_dir("edge-1");
    assert!(snapshot.join("Nginx/status.yml").is_file());

    // The file disappears remotely between fetches.
    fs::remove_file(cluster.remote_conf.join("Nginx/status.yml")).expect("remove remote");
    fetch(&cluster);

    assert!(!snapshot.join("Nginx/status.yml").exists());
    let manifest = cluster.manager.read_manifest("edge-1").expect("manifest");
    assert!(!manifest.checksums.contains_key("Nginx/status.yml"));
}

#[test]
fn fetch_failure_propagates_per_file_errors() {
    let cluster = setup();
    let transport = FakeTransport::new("edge-1");
    transport.fail_fetch_on(
        &cluster
            .remote_conf
            .join("Apache/status.yml")
            .to_string_lossy(),
    );
    let config = cluster.manager.registry().get("edge-1").expect("node").clone();
    let err = cluster
        .manager
        .fetch_node_with("edge-1", &config, &transport)
        .unwrap_err();
    assert!(matches!(err, Error::NodeConnection { .. }));
}

#[test]
fn discovery_honors_includes_and_skips_missing_files() {
    let cluster = setup();
    fetch(&cluster);

    let entries = cluster
        .manager
        .enumerate_submodules(Some("edge-1"))
        .expect("enumerate");

    let keys: Vec<&str> = entries.keys().map(String::as_str).collect();
    assert_eq!(
        keys,
        vec!["Apache/status", "Apache/vhost", "Nginx/status", "Plain/nokey"]
    );

    // Wildcard include surfaced every file; explicit include left extra.yml
    // out and tolerated the missing ghost.yml.
    assert!(!entries.contains_key("Nginx/extra"));
    assert!(!entries.contains_key("Nginx/ghost"));

    assert!(entries["Apache/status"].eligible);
    assert_eq!(entries["Apache/status"].current_key, Some(100));
    assert!(!entries["Plain/nokey"].eligible);
    assert_eq!(entries["Plain/nokey"].current_key, None);
}

#[test]
fn bulk_edit_partial_failure_is_reported_not_raised() {
    let cluster = setup();
    let transport = fetch(&cluster);

    let mut updates = BTreeMap::new();
    updates.insert("Apache/status".to_string(), 1000);
    updates.insert("Apache/vhost".to_string(), 2000);
    updates.insert("Nginx/status".to_string(), 3000);

    // Second item fails at the push step.
    transport.fail_push_on(
        &cluster
            .remote_conf
            .join("Apache/vhost.yml")
            .to_string_lossy(),
    );

    let config = cluster.manager.registry().get("edge-1").expect("node").clone();
    let report = cluster
        .manager
        .bulk_edit_with("edge-1", &config, &transport, &updates, false)
        .expect("bulk edit returns a report, not an error");

    assert_eq!(report.items.len(), 3);
    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 1);
    assert!(!report.items["Apache/vhost"].ok);
    assert!(report.items["Apache/vhost"].error.is_some());

    // Successful items actually landed on the node.
    assert_eq!(remote_unique_key(&cluster.remote_conf, "Apache", "status"), Some(1000));
    assert_eq!(remote_unique_key(&cluster.remote_conf, "Nginx", "status"), Some(3000));
    // The failed item kept its original value.
    assert_eq!(remote_unique_key(&cluster.remote_conf, "Apache", "vhost"), Some(200));
}

#[test]
fn bulk_edit_backup_copies_the_snapshot_first() {
    let cluster = setup();
    let transport = fetch(&cluster);

    let mut updates = BTreeMap::new();
    updates.insert("Apache/status".to_string(), 42);

    let config = cluster.manager.registry().get("edge-1").expect("node").clone();
    cluster
        .manager
        .bulk_edit_with("edge-1", &config, &transport, &updates, true)
        .expect("bulk edit");

    let backup_dir = cluster.manager.paths().node_backup_dir("edge-1");
    let backups: Vec<_> = fs::read_dir(&backup_dir)
        .expect("backup dir")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert!(!backups.is_empty());
    assert!(backups.iter().any(|name| name.starts_with("status_")));
}

#[test]
fn bulk_edit_requires_an_enabled_node() {
    let mut cluster = setup();
    cluster
        .manager
        .add_node(
            "edge-2",
            NodeConfig {
                host: "198.51.100.11".to_string(),
                user: "sim".to_string(),
                key_path: "~/.ssh/id_ed25519".to_string(),
                conf_dir: "/nowhere/conf.d".to_string(),
                binary_dir: "/nowhere/bin".to_string(),
                description: String::new(),
                enabled: false,
            },
        )
        .expect("add node");

    let mut updates = BTreeMap::new();
    updates.insert("Apache/status".to_string(), 1);
    let err = cluster.manager.bulk_edit("edge-2", &updates, false).unwrap_err();
    assert!(matches!(err, Error::NodeConnection { .. }));

    let err = cluster.manager.bulk_edit("ghost", &updates, false).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[test]
fn cancelled_bulk_edit_stops_before_items() {
    let cluster = setup();
    let transport = fetch(&cluster);
    cluster.manager.cancel_token().cancel();

    let mut updates = BTreeMap::new();
    updates.insert("Apache/status".to_string(), 1000);

    let config = cluster.manager.registry().get("edge-1").expect("node").clone();
    let report = cluster
        .manager
        .bulk_edit_with("edge-1", &config, &transport, &updates, false)
        .expect("report");
    assert!(report.items.is_empty());
    assert_eq!(remote_unique_key(&cluster.remote_conf, "Apache", "status"), Some(100));
}

#[test]
fn eps_rollup_shares_the_engine_formula() {
    let cluster = setup();
    fetch(&cluster);

    let report = cluster
        .manager
        .eps_summary_all(Some("edge-1"), 1.0)
        .expect("rollup");

    // Apache: module key 5 * (100 + 200); Nginx: no module key -> 1 * 50.
    assert_eq!(report.modules["Apache"].eps, 1500.0);
    assert_eq!(report.modules["Apache"].submodule_key_sum, 300);
    assert_eq!(report.modules["Nginx"].module_uniquekey, 1);
    assert_eq!(report.modules["Nginx"].eps, 50.0);
    // Plain has no eligible submodules and is not part of the summary.
    assert!(!report.modules.contains_key("Plain"));
    assert_eq!(report.total_eps, 1550.0);

    let slow = cluster
        .manager
        .eps_for_modules(&["Apache".to_string()], Some("edge-1"), 10.0, false)
        .expect("rollup");
    assert_eq!(slow.modules["Apache"].eps, 150.0);
    assert_eq!(slow.total_eps, 150.0);
}

#[test]
fn push_all_reports_per_file_failures_with_lenient_success() {
    let cluster = setup();
    let transport = fetch(&cluster);

    // A brand-new module appears only in the local snapshot; pushing must
    // create its remote directory.
    let snapshot = cluster.manager.paths().node_conf_dir("edge-1");
    fs::create_dir_all(snapshot.join("NewMod")).expect("new module dir");
    fs::write(
        snapshot.join("NewMod/conf.yml"),
        "uniquekey:\n  NumUniqKey: 9\n",
    )
    .expect("new module conf");

    transport.fail_push_on(
        &cluster
            .remote_conf
            .join("Apache/status.yml")
            .to_string_lossy(),
    );

    let config = cluster.manager.registry().get("edge-1").expect("node").clone();
    let report = cluster
        .manager
        .push_all_with("edge-1", &config, &transport, false)
        .expect("push report");

    assert_eq!(report.attempted, 9);
    assert_eq!(report.pushed, 8);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].rel_path, "Apache/status.yml");
    // Partial success still reports success at the top level.
    assert!(report.success());

    assert!(cluster.remote_conf.join("NewMod/conf.yml").is_file());
}

#[test]
fn push_all_without_snapshot_is_not_found() {
    let cluster = setup();
    let transport = FakeTransport::new("edge-1");
    let config = cluster.manager.registry().get("edge-1").expect("node").clone();
    let err = cluster
        .manager
        .push_all_with("edge-1", &config, &transport, false)
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[test]
fn verify_snapshot_reports_drift() {
    let cluster = setup();
    fetch(&cluster);
    let snapshot = cluster.manager.paths().node_conf_dir("edge-1");

    let clean = cluster.manager.verify_snapshot("edge-1").expect("verify");
    assert!(clean.is_clean());

    fs::write(
        snapshot.join("Apache/status.yml"),
        "uniquekey:\n  NumUniqKey: 123456\n",
    )
    .expect("modify");
    fs::remove_file(snapshot.join("Apache/vhost.yml")).expect("remove");
    fs::write(snapshot.join("Apache/new.yml"), "uniquekey:\n  NumUniqKey: 1\n")
        .expect("add");

    let drift = cluster.manager.verify_snapshot("edge-1").expect("verify");
    assert_eq!(drift.modified, vec!["Apache/status.yml"]);
    assert_eq!(drift.removed, vec!["Apache/vhost.yml"]);
    assert_eq!(drift.added, vec!["Apache/new.yml"]);
}

#[test]
fn status_summarizes_snapshots() {
    let cluster = setup();
    let before = cluster.manager.status();
    assert_eq!(before.total_nodes, 1);
    assert_eq!(before.enabled_nodes, 1);
    assert!(!before.nodes["edge-1"].has_snapshot);
    assert!(before.nodes["edge-1"].last_sync.is_none());

    fetch(&cluster);
    let after = cluster.manager.status();
    assert!(after.nodes["edge-1"].has_snapshot);
    assert!(after.nodes["edge-1"].last_sync.is_some());
    assert_eq!(after.nodes["edge-1"].config_files, 8);
}

#[test]
fn removing_a_node_deletes_its_local_trees() {
    let mut cluster = setup();
    let transport = fetch(&cluster);

    // Populate the backup tree too.
    let mut updates = BTreeMap::new();
    updates.insert("Apache/status".to_string(), 7);
    let config = cluster.manager.registry().get("edge-1").expect("node").clone();
    cluster
        .manager
        .bulk_edit_with("edge-1", &config, &transport, &updates, true)
        .expect("bulk edit");

    let snapshot_dir = cluster.manager.paths().node_snapshot_dir("edge-1");
    let backup_dir = cluster.manager.paths().node_backup_dir("edge-1");
    assert!(snapshot_dir.exists());
    assert!(backup_dir.exists());

    cluster.manager.remove_node("edge-1").expect("remove");
    assert!(!snapshot_dir.exists());
    assert!(!backup_dir.exists());
    assert!(cluster.manager.registry().get("edge-1").is_err());

    let err = cluster.manager.remove_node("edge-1").unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}
