use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use simtune::Result;
use simtune::cluster::{self, ClusterManager, KeyTransform};
use simtune::diff::{self, ProposedChanges};
use simtune::duration;
use simtune::eps::{EpsEngine, EpsOverrides};
use simtune::registry::NodeConfig;
use simtune::store::{self, ConfigEditor};
use simtune::workspace::{Paths, split_submodule_path};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Workspace root (holds nodes.yaml, conf.d/, conf_snapshots/, backups/)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Manage the node registry
    Nodes {
        #[command(subcommand)]
        cmd: NodesCommand,
    },
    /// Fetch a node's configuration tree into a local snapshot
    Fetch {
        /// Node name; omit with --all to fetch every enabled node
        node: Option<String>,
        /// Fetch all enabled nodes
        #[arg(long)]
        all: bool,
    },
    /// Show per-node snapshot/sync status
    Status,
    /// Check a node's snapshot against its fetch-time checksums
    Verify { node: String },
    /// List modules of a configuration tree with their current EPS
    Modules {
        /// Read a node snapshot instead of the local tree
        #[arg(long)]
        node: Option<String>,
    },
    /// Compute EPS for one module, optionally with overrides
    Calc {
        module: String,
        /// Override the module-level unique key
        #[arg(long)]
        key: Option<u64>,
        /// Override the module period (e.g. "1s", "250ms")
        #[arg(long)]
        period: Option<String>,
        #[arg(long)]
        node: Option<String>,
    },
    /// Suggest a module-level unique key for a target EPS
    Suggest {
        module: String,
        #[arg(long)]
        target_eps: f64,
        #[arg(long)]
        period: Option<String>,
        #[arg(long, default_value_t = 0.05)]
        tolerance: f64,
        #[arg(long)]
        node: Option<String>,
    },
    /// Set a unique key in the local tree ("module" or "module/submodule")
    SetKey { target: String, value: u64 },
    /// Set a module's period in the local tree
    SetPeriod { module: String, period: String },
    /// Enable a module in the local tree
    Enable { module: String },
    /// Disable a module in the local tree
    Disable { module: String },
    /// List discovered submodules and their unique-key settings
    Discover {
        #[arg(long)]
        node: Option<String>,
        /// Restrict to one module
        #[arg(long)]
        module: Option<String>,
    },
    /// EPS roll-up across modules of a node snapshot (or the local tree)
    Eps {
        /// Modules to include; empty means every module with eligible submodules
        modules: Vec<String>,
        #[arg(long)]
        node: Option<String>,
        #[arg(long, default_value = "1s")]
        period: String,
        /// Fetch a fresh snapshot first
        #[arg(long)]
        refresh: bool,
    },
    /// Bulk unique-key edits against one or many nodes
    Bulk {
        #[command(subcommand)]
        cmd: BulkCommand,
    },
    /// Push a node's snapshot tree back to the node
    PushAll {
        #[arg(long)]
        node: Option<String>,
        /// Push to every enabled node
        #[arg(long)]
        all_nodes: bool,
        #[arg(long)]
        no_backup: bool,
    },
    /// Restart the simulator process on a node
    Restart { node: String },
    /// Preview a key/period change as a diff, without writing
    Preview {
        /// "module" or "module/submodule"
        target: String,
        #[arg(long)]
        key: Option<u64>,
        #[arg(long)]
        period: Option<String>,
        #[arg(long)]
        node: Option<String>,
        /// Print the full diff instead of the filtered view
        #[arg(long)]
        full: bool,
    },
    /// Unified diff between two YAML files
    Diff { a: PathBuf, b: PathBuf },
}

#[derive(Debug, Subcommand)]
enum NodesCommand {
    List,
    Add {
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        key_path: String,
        #[arg(long)]
        conf_dir: String,
        #[arg(long)]
        binary_dir: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        disabled: bool,
    },
    Remove {
        name: String,
    },
}

#[derive(Debug, Subcommand)]
enum BulkCommand {
    /// Explicit updates: one or more module/submodule=VALUE pairs
    Set {
        /// e.g. Apache/status=5000
        updates: Vec<String>,
        #[arg(long)]
        node: Option<String>,
        #[arg(long)]
        all_nodes: bool,
        #[arg(long)]
        no_backup: bool,
    },
    /// Same value for every eligible submodule of one module
    Module {
        module: String,
        value: u64,
        #[arg(long)]
        node: Option<String>,
        #[arg(long)]
        all_nodes: bool,
        #[arg(long)]
        no_backup: bool,
    },
    /// Same value for every eligible submodule with a matching leaf name
    Name {
        name: String,
        value: u64,
        #[arg(long)]
        node: Option<String>,
        #[arg(long)]
        all_nodes: bool,
        #[arg(long)]
        no_backup: bool,
    },
    /// Arithmetic transform over current values
    Transform {
        #[arg(long)]
        multiply: Option<f64>,
        #[arg(long)]
        add: Option<i64>,
        #[arg(long)]
        min: Option<u64>,
        #[arg(long)]
        max: Option<u64>,
        /// Restrict to these modules (repeatable)
        #[arg(long = "module")]
        modules: Vec<String>,
        #[arg(long)]
        node: Option<String>,
        #[arg(long)]
        all_nodes: bool,
        #[arg(long)]
        no_backup: bool,
        /// Print the update map without applying it
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let paths = Paths::new(&args.root);
    let mut manager = ClusterManager::open(paths)?;

    match args.cmd {
        Command::Nodes { cmd } => cmd_nodes(&mut manager, cmd),
        Command::Fetch { node, all } => cmd_fetch(&manager, node, all),
        Command::Status => cmd_status(&manager),
        Command::Verify { node } => cmd_verify(&manager, &node),
        Command::Modules { node } => cmd_modules(&manager, node.as_deref()),
        Command::Calc {
            module,
            key,
            period,
            node,
        } => cmd_calc(&manager, &module, key, period, node.as_deref()),
        Command::Suggest {
            module,
            target_eps,
            period,
            tolerance,
            node,
        } => cmd_suggest(&manager, &module, target_eps, period.as_deref(), tolerance, node.as_deref()),
        Command::SetKey { target, value } => cmd_set_key(&manager, &target, value),
        Command::SetPeriod { module, period } => cmd_set_period(&manager, &module, &period),
        Command::Enable { module } => cmd_toggle(&manager, &module, true),
        Command::Disable { module } => cmd_toggle(&manager, &module, false),
        Command::Discover { node, module } => {
            cmd_discover(&manager, node.as_deref(), module.as_deref())
        }
        Command::Eps {
            modules,
            node,
            period,
            refresh,
        } => cmd_eps(&manager, &modules, node.as_deref(), &period, refresh),
        Command::Bulk { cmd } => cmd_bulk(&manager, cmd),
        Command::PushAll {
            node,
            all_nodes,
            no_backup,
        } => cmd_push_all(&manager, node, all_nodes, !no_backup),
        Command::Restart { node } => manager.restart(&node),
        Command::Preview {
            target,
            key,
            period,
            node,
            full,
        } => cmd_preview(&manager, &target, key, period, node.as_deref(), full),
        Command::Diff { a, b } => cmd_diff(&a, &b),
    }
}

fn cmd_nodes(manager: &mut ClusterManager, cmd: NodesCommand) -> Result<()> {
    match cmd {
        NodesCommand::List => {
            for (name, config) in manager.registry().nodes() {
                println!(
                    "{:<16} {:<22} {:<8} {}",
                    name,
                    format!("{}@{}", config.user, config.host),
                    if config.enabled { "enabled" } else { "disabled" },
                    config.description
                );
            }
            Ok(())
        }
        NodesCommand::Add {
            name,
            host,
            user,
            key_path,
            conf_dir,
            binary_dir,
            description,
            disabled,
        } => {
            manager.add_node(
                &name,
                NodeConfig {
                    host,
                    user,
                    key_path,
                    conf_dir,
                    binary_dir,
                    description,
                    enabled: !disabled,
                },
            )?;
            println!("added node {name}");
            Ok(())
        }
        NodesCommand::Remove { name } => {
            manager.remove_node(&name)?;
            println!("removed node {name} (snapshot and backups deleted)");
            Ok(())
        }
    }
}

fn cmd_fetch(manager: &ClusterManager, node: Option<String>, all: bool) -> Result<()> {
    if all {
        let results = manager.fetch_all();
        let mut ok = 0;
        for (name, outcome) in &results {
            match outcome {
                Ok(summary) => {
                    ok += 1;
                    println!("{name}: fetched {} files", summary.files);
                }
                Err(e) => println!("{name}: FAILED ({e})"),
            }
        }
        println!("fetched {ok}/{} nodes", results.len());
        return Ok(());
    }
    let node = node.ok_or_else(|| {
        simtune::Error::invalid_format("fetch needs a node name or --all")
    })?;
    let summary = manager.fetch_node(&node)?;
    println!("{node}: fetched {} files", summary.files);
    Ok(())
}

fn cmd_status(manager: &ClusterManager) -> Result<()> {
    let status = manager.status();
    println!(
        "nodes: {} total, {} enabled, {} disabled",
        status.total_nodes, status.enabled_nodes, status.disabled_nodes
    );
    for (name, node) in &status.nodes {
        println!(
            "{:<16} {:<18} {:<8} snapshot={} files={} last_sync={}",
            name,
            node.host,
            if node.enabled { "enabled" } else { "disabled" },
            if node.has_snapshot { "yes" } else { "no" },
            node.config_files,
            node.last_sync.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn cmd_verify(manager: &ClusterManager, node: &str) -> Result<()> {
    let drift = manager.verify_snapshot(node)?;
    if drift.is_clean() {
        println!("{node}: snapshot matches its manifest");
        return Ok(());
    }
    for rel in &drift.added {
        println!("added:    {rel}");
    }
    for rel in &drift.removed {
        println!("removed:  {rel}");
    }
    for rel in &drift.modified {
        println!("modified: {rel}");
    }
    Ok(())
}

fn cmd_modules(manager: &ClusterManager, node: Option<&str>) -> Result<()> {
    let conf_root = manager.paths().conf_root(node);
    let engine = EpsEngine::new(conf_root, manager.store());
    for module in engine.list_modules()? {
        match engine.module_summary(&module) {
            Ok(summary) => println!(
                "{:<24} {:<9} key={:<10} period={:<6} submodules={:<3} eps={:.1}",
                summary.name,
                if summary.enabled { "enabled" } else { "disabled" },
                summary.module_uniquekey,
                summary.module_period,
                summary.submodule_count,
                summary.eps
            ),
            Err(e) => println!("{module:<24} unreadable ({e})"),
        }
    }
    Ok(())
}

fn cmd_calc(
    manager: &ClusterManager,
    module: &str,
    key: Option<u64>,
    period: Option<String>,
    node: Option<&str>,
) -> Result<()> {
    let conf_root = manager.paths().conf_root(node);
    let engine = EpsEngine::new(conf_root, manager.store());
    let overrides = EpsOverrides {
        module_uniquekey: key,
        module_period: period,
        ..EpsOverrides::default()
    };
    let breakdown = engine.calculate(module, &overrides)?;
    println!(
        "{}: key={} period={} ({}s)",
        breakdown.module_name,
        breakdown.module_uniquekey,
        breakdown.module_period,
        breakdown.period_seconds
    );
    for sub in &breakdown.submodules {
        println!(
            "  {:<24} key={:<10} contribution={}",
            sub.name, sub.uniquekey, sub.contribution
        );
    }
    println!(
        "total submodule contribution: {}",
        breakdown.total_submodule_contribution
    );
    println!("eps: {:.2}", breakdown.eps);
    Ok(())
}

fn cmd_suggest(
    manager: &ClusterManager,
    module: &str,
    target_eps: f64,
    period: Option<&str>,
    tolerance: f64,
    node: Option<&str>,
) -> Result<()> {
    let conf_root = manager.paths().conf_root(node);
    let engine = EpsEngine::new(conf_root, manager.store());
    let suggestion = engine.suggest_unique_key_for_target(module, target_eps, period, tolerance)?;
    println!(
        "suggested key: {} (current {})",
        suggestion.suggested_module_uniquekey, suggestion.current_module_uniquekey
    );
    println!(
        "expected eps: {:.2} for target {:.2} over {} (deviation {:.2}%, {})",
        suggestion.expected_eps,
        suggestion.target_eps,
        suggestion.period,
        suggestion.deviation * 100.0,
        if suggestion.within_tolerance {
            "within tolerance"
        } else {
            "OUTSIDE tolerance"
        }
    );
    Ok(())
}

fn local_editor(manager: &ClusterManager) -> ConfigEditor<'_> {
    ConfigEditor::new(manager.store(), manager.paths().conf_dir.clone())
}

fn cmd_set_key(manager: &ClusterManager, target: &str, value: u64) -> Result<()> {
    let editor = local_editor(manager);
    let conf_dir = &manager.paths().conf_dir;
    let outcome = if target.contains('/') {
        let (module, submodule) = split_submodule_path(target)?;
        let path = store::submodule_config_path(conf_dir, module, submodule);
        let (_, checksum) = manager.store().read(&path)?;
        editor.set_submodule_unique_key(module, submodule, value, &checksum)?
    } else {
        let path = store::module_config_path(conf_dir, target);
        let (_, checksum) = manager.store().read(&path)?;
        editor.set_module_unique_key(target, value, &checksum)?
    };
    println!(
        "{target}: NumUniqKey={value} (backup {})",
        outcome.backup_path.display()
    );
    Ok(())
}

fn cmd_set_period(manager: &ClusterManager, module: &str, period: &str) -> Result<()> {
    let editor = local_editor(manager);
    let path = store::module_config_path(&manager.paths().conf_dir, module);
    let (_, checksum) = manager.store().read(&path)?;
    let outcome = editor.set_module_period(module, period, &checksum)?;
    println!(
        "{module}: period={period} (backup {})",
        outcome.backup_path.display()
    );
    Ok(())
}

fn cmd_toggle(manager: &ClusterManager, module: &str, enabled: bool) -> Result<()> {
    let editor = local_editor(manager);
    let path = store::module_config_path(&manager.paths().conf_dir, module);
    let (_, checksum) = manager.store().read(&path)?;
    editor.set_module_enabled(module, enabled, &checksum)?;
    println!(
        "{module}: {}",
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

fn cmd_discover(
    manager: &ClusterManager,
    node: Option<&str>,
    module: Option<&str>,
) -> Result<()> {
    let entries = manager.enumerate_submodules(node)?;
    let mut total = 0;
    let mut eligible = 0;
    for (path, entry) in &entries {
        if let Some(module) = module {
            if entry.module != module {
                continue;
            }
        }
        total += 1;
        if entry.eligible {
            eligible += 1;
        }
        match entry.current_key {
            Some(key) => println!("{path:<40} NumUniqKey={key}"),
            None => println!("{path:<40} (no unique key)"),
        }
    }
    println!("{total} submodules, {eligible} with unique keys");
    Ok(())
}

fn cmd_eps(
    manager: &ClusterManager,
    modules: &[String],
    node: Option<&str>,
    period: &str,
    refresh: bool,
) -> Result<()> {
    let period_seconds = duration::parse(period)?;
    let report = if modules.is_empty() {
        manager.eps_summary_all(node, period_seconds)?
    } else {
        manager.eps_for_modules(modules, node, period_seconds, refresh)?
    };

    let mut rows: Vec<_> = report.modules.iter().collect();
    rows.sort_by(|a, b| b.1.eps.total_cmp(&a.1.eps));
    for (module, eps) in rows {
        println!(
            "{:<24} key={:<10} sum={:<12} submodules={:<3} eps={:.1}",
            module, eps.module_uniquekey, eps.submodule_key_sum, eps.submodule_count, eps.eps
        );
    }
    println!(
        "total eps over {period}: {:.1} ({})",
        report.total_eps,
        report.node.as_deref().unwrap_or("local configuration")
    );
    Ok(())
}

fn parse_update_pairs(pairs: &[String]) -> Result<BTreeMap<String, u64>> {
    let mut updates = BTreeMap::new();
    for pair in pairs {
        let (path, value) = pair.split_once('=').ok_or_else(|| {
            simtune::Error::invalid_format(format!(
                "expected module/submodule=VALUE, got '{pair}'"
            ))
        })?;
        split_submodule_path(path)?;
        let value = value.parse::<u64>().map_err(|e| {
            simtune::Error::invalid_format(format!("bad value in '{pair}': {e}"))
        })?;
        updates.insert(path.to_string(), value);
    }
    Ok(updates)
}

fn apply_updates(
    manager: &ClusterManager,
    updates: &BTreeMap<String, u64>,
    node: Option<String>,
    all_nodes: bool,
    backup: bool,
) -> Result<()> {
    if updates.is_empty() {
        println!("nothing to update");
        return Ok(());
    }
    if all_nodes {
        let results = manager.bulk_edit_all(updates, None, backup);
        print_bulk_results(&results);
        return Ok(());
    }
    let node = node.ok_or_else(|| {
        simtune::Error::invalid_format("bulk edit needs --node or --all-nodes")
    })?;
    let report = manager.bulk_edit(&node, updates, backup)?;
    print_bulk_report(&node, &report);
    Ok(())
}

fn print_bulk_report(node: &str, report: &cluster::BulkEditReport) {
    for (path, outcome) in &report.items {
        match &outcome.error {
            None => println!("{node}: {path} ok"),
            Some(error) => println!("{node}: {path} FAILED ({error})"),
        }
    }
    println!(
        "{node}: {}/{} submodules updated",
        report.succeeded(),
        report.items.len()
    );
}

fn print_bulk_results(results: &BTreeMap<String, Result<cluster::BulkEditReport>>) {
    for (node, outcome) in results {
        match outcome {
            Ok(report) => print_bulk_report(node, report),
            Err(e) => println!("{node}: FAILED ({e})"),
        }
    }
}

fn cmd_bulk(manager: &ClusterManager, cmd: BulkCommand) -> Result<()> {
    match cmd {
        BulkCommand::Set {
            updates,
            node,
            all_nodes,
            no_backup,
        } => {
            let updates = parse_update_pairs(&updates)?;
            apply_updates(manager, &updates, node, all_nodes, !no_backup)
        }
        BulkCommand::Module {
            module,
            value,
            node,
            all_nodes,
            no_backup,
        } => {
            let updates = manager.module_update_map(node.as_deref(), &module, value)?;
            apply_updates(manager, &updates, node, all_nodes, !no_backup)
        }
        BulkCommand::Name {
            name,
            value,
            node,
            all_nodes,
            no_backup,
        } => {
            let entries = manager.enumerate_submodules(node.as_deref())?;
            let updates = cluster::updates_for_submodule_names(&entries, &[name], value);
            apply_updates(manager, &updates, node, all_nodes, !no_backup)
        }
        BulkCommand::Transform {
            multiply,
            add,
            min,
            max,
            modules,
            node,
            all_nodes,
            no_backup,
            dry_run,
        } => {
            let transform = match (multiply, add, min, max) {
                (Some(factor), None, None, None) => KeyTransform::Multiply(factor),
                (None, Some(delta), None, None) => KeyTransform::Add(delta),
                (None, None, Some(floor), None) => KeyTransform::RaiseToMin(floor),
                (None, None, None, Some(ceiling)) => KeyTransform::CapAtMax(ceiling),
                _ => {
                    return Err(simtune::Error::invalid_format(
                        "pick exactly one of --multiply, --add, --min, --max",
                    ));
                }
            };
            let entries = manager.enumerate_submodules(node.as_deref())?;
            let updates = cluster::updates_with_transform(&entries, transform, &modules);
            if dry_run {
                for (path, value) in &updates {
                    let current = entries.get(path).and_then(|e| e.current_key).unwrap_or(0);
                    println!("{path:<40} {current} -> {value}");
                }
                println!("{} submodules would change", updates.len());
                return Ok(());
            }
            apply_updates(manager, &updates, node, all_nodes, !no_backup)
        }
    }
}

fn cmd_push_all(
    manager: &ClusterManager,
    node: Option<String>,
    all_nodes: bool,
    backup: bool,
) -> Result<()> {
    if all_nodes {
        let results = manager.push_all_nodes(None, backup);
        for (name, outcome) in &results {
            match outcome {
                Ok(report) => print_push_report(name, report),
                Err(e) => println!("{name}: FAILED ({e})"),
            }
        }
        return Ok(());
    }
    let node = node.ok_or_else(|| {
        simtune::Error::invalid_format("push-all needs --node or --all-nodes")
    })?;
    let report = manager.push_all(&node, backup)?;
    print_push_report(&node, &report);
    Ok(())
}

fn print_push_report(node: &str, report: &cluster::PushReport) {
    for failure in &report.failures {
        println!("{node}: {} FAILED ({})", failure.rel_path, failure.error);
    }
    println!(
        "{node}: pushed {}/{} files ({})",
        report.pushed,
        report.attempted,
        if report.success() { "ok" } else { "failed" }
    );
}

fn cmd_preview(
    manager: &ClusterManager,
    target: &str,
    key: Option<u64>,
    period: Option<String>,
    node: Option<&str>,
    full: bool,
) -> Result<()> {
    let conf_root = manager.paths().conf_root(node);
    let path = if target.contains('/') {
        let (module, submodule) = split_submodule_path(target)?;
        store::submodule_config_path(&conf_root, module, submodule)
    } else {
        store::module_config_path(&conf_root, target)
    };

    let changes = ProposedChanges {
        unique_key: key,
        period,
    };
    let preview = diff::preview(manager.store(), &path, &changes)?;
    println!("{}", preview.summary);
    if full {
        println!("{}", preview.full_diff);
    } else {
        println!("{}", preview.filtered_diff);
    }
    Ok(())
}

fn cmd_diff(a: &PathBuf, b: &PathBuf) -> Result<()> {
    let read = |p: &PathBuf| -> Result<String> {
        std::fs::read_to_string(p)
            .map_err(|e| simtune::Error::io(format!("failed to read {}", p.display()), e))
    };
    println!("{}", diff::unified_diff(&read(a)?, &read(b)?));
    Ok(())
}
