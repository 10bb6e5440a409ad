use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::debug;

use crate::error::{Error, Result};
use crate::registry::{ClusterSettings, NodeConfig};
use crate::store::checksum_bytes;

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Cooperative cancellation checked between batch items and sync workers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One secured remote-file/remote-command channel to a node.
///
/// Not designed for concurrent mutating use against the same node from
/// multiple callers; read-side calls may run from several sync workers.
pub trait NodeTransport: Send + Sync {
    fn node_name(&self) -> &str;

    /// Cheap reachability/auth probe. Also warms the connection that
    /// subsequent calls reuse.
    fn connect(&self) -> Result<()>;

    fn close(&self);

    fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>>;

    fn fetch_file(&self, remote: &str, local: &Path) -> Result<()>;

    fn push_file(&self, local: &Path, remote: &str) -> Result<()>;

    fn ensure_directory(&self, remote: &str) -> Result<()>;

    fn run_command(&self, cmd: &str) -> Result<CommandOutput>;
}

pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}

fn command_summary(out: &Output) -> String {
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if !stderr.is_empty() {
        return stderr;
    }
    if !stdout.is_empty() {
        return stdout;
    }
    format!("status {}", out.status)
}

/// Remote transport over the system `ssh`/`scp` binaries. A per-transport
/// control socket (ControlMaster) makes the first call establish the
/// connection and every later call reuse it; `close` tears the master down.
pub struct SshTransport {
    node: String,
    target: String,
    key_path: String,
    connect_timeout: u64,
    transfer_timeout: u64,
    control_dir: tempfile::TempDir,
}

impl SshTransport {
    pub fn new(node: &str, config: &NodeConfig, settings: &ClusterSettings) -> Result<Self> {
        let control_dir = tempfile::tempdir()
            .map_err(|e| Error::io("failed to create ssh control dir", e))?;
        Ok(Self {
            node: node.to_string(),
            target: format!("{}@{}", config.user, config.host),
            key_path: expand_tilde(&config.key_path),
            connect_timeout: settings.connection_timeout,
            transfer_timeout: settings.sync_timeout,
            control_dir,
        })
    }

    fn control_path(&self) -> PathBuf {
        self.control_dir.path().join("cm-%h-%p-%r")
    }

    fn apply_common_opts(&self, cmd: &mut Command) {
        cmd.arg("-o").arg("BatchMode=yes");
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout));
        cmd.arg("-o").arg("ControlMaster=auto");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path().display()));
        cmd.arg("-o").arg("ControlPersist=60");
        // Bound transfer stalls: drop the session once the server has been
        // silent for roughly the sync timeout.
        cmd.arg("-o").arg("ServerAliveInterval=15");
        cmd.arg("-o").arg(format!(
            "ServerAliveCountMax={}",
            (self.transfer_timeout / 15).max(1)
        ));
        if !self.key_path.is_empty() {
            cmd.arg("-i").arg(&self.key_path);
        }
    }

    fn ssh_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        self.apply_common_opts(&mut cmd);
        cmd
    }

    fn scp_command(&self) -> Command {
        let mut cmd = Command::new("scp");
        self.apply_common_opts(&mut cmd);
        cmd.arg("-q");
        cmd
    }

    fn run(&self, mut cmd: Command) -> Result<Output> {
        cmd.output().map_err(|e| {
            Error::node(&self.node, format!("failed to run {:?}: {e}", cmd.get_program()))
        })
    }
}

impl NodeTransport for SshTransport {
    fn node_name(&self) -> &str {
        &self.node
    }

    fn connect(&self) -> Result<()> {
        let out = self.run_command("true")?;
        if out.exit_status != 0 {
            return Err(Error::node(
                &self.node,
                format!("connect probe failed: {}", out.stderr.trim()),
            ));
        }
        debug!(node = %self.node, target = %self.target, "connected");
        Ok(())
    }

    fn close(&self) {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path().display()));
        cmd.arg("-O").arg("exit").arg(&self.target);
        let _ = cmd.output();
    }

    fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        let out = self.run_command(&format!(
            "find {} -mindepth 1 -maxdepth 1 -printf '%y\\t%f\\n'",
            sh_quote(path)
        ))?;
        if out.exit_status != 0 {
            return Err(Error::node(
                &self.node,
                format!("failed to list {path}: {}", out.stderr.trim()),
            ));
        }
        let mut entries = Vec::new();
        for line in out.stdout.lines() {
            let Some((kind, name)) = line.split_once('\t') else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            entries.push(DirEntry {
                name: name.to_string(),
                is_directory: kind == "d",
            });
        }
        Ok(entries)
    }

    fn fetch_file(&self, remote: &str, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("failed to create {}", parent.display()), e))?;
        }
        let mut cmd = self.scp_command();
        cmd.arg(format!("{}:{}", self.target, remote)).arg(local);
        let out = self.run(cmd)?;
        if !out.status.success() {
            return Err(Error::node(
                &self.node,
                format!("fetch {remote} failed: {}", command_summary(&out)),
            ));
        }
        debug!(node = %self.node, remote, local = %local.display(), "fetched file");
        Ok(())
    }

    fn push_file(&self, local: &Path, remote: &str) -> Result<()> {
        let mut cmd = self.scp_command();
        cmd.arg(local).arg(format!("{}:{}", self.target, remote));
        let out = self.run(cmd)?;
        if !out.status.success() {
            return Err(Error::node(
                &self.node,
                format!("push {remote} failed: {}", command_summary(&out)),
            ));
        }
        debug!(node = %self.node, remote, local = %local.display(), "pushed file");
        Ok(())
    }

    fn ensure_directory(&self, remote: &str) -> Result<()> {
        let out = self.run_command(&format!("mkdir -p {}", sh_quote(remote)))?;
        if out.exit_status != 0 {
            return Err(Error::node(
                &self.node,
                format!("mkdir -p {remote} failed: {}", out.stderr.trim()),
            ));
        }
        Ok(())
    }

    fn run_command(&self, cmd: &str) -> Result<CommandOutput> {
        let mut ssh = self.ssh_command();
        ssh.arg(&self.target).arg(cmd);
        let out = self.run(ssh)?;
        let exit_status = out.status.code().unwrap_or(-1);
        // ssh reserves 255 for its own failures (auth, timeout, unreachable).
        if exit_status == 255 {
            return Err(Error::node(&self.node, command_summary(&out)));
        }
        Ok(CommandOutput {
            exit_status,
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
        })
    }
}

fn rel_str(rel: &Path) -> String {
    rel.iter()
        .map(|c| c.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Mirror a remote directory tree under `local_root`, returning the
/// per-file checksums keyed by relative path.
///
/// The listing walk is sequential; file fetches fan out to at most `jobs`
/// workers. The first failure stops scheduling and is returned (files
/// fetched before it remain on disk; callers wanting a clean tree delete it
/// first).
pub fn sync_tree(
    transport: &dyn NodeTransport,
    remote_root: &str,
    local_root: &Path,
    jobs: usize,
    cancel: &CancelToken,
) -> Result<BTreeMap<String, String>> {
    let remote_root = remote_root.trim_end_matches('/');
    fs::create_dir_all(local_root)
        .map_err(|e| Error::io(format!("failed to create {}", local_root.display()), e))?;

    let mut pending_dirs = vec![(remote_root.to_string(), PathBuf::new())];
    let mut files: Vec<(String, PathBuf)> = Vec::new();
    while let Some((remote_dir, rel)) = pending_dirs.pop() {
        if cancel.cancelled() {
            return Err(Error::node(transport.node_name(), "sync cancelled"));
        }
        for entry in transport.list_directory(&remote_dir)? {
            let remote_path = format!("{remote_dir}/{}", entry.name);
            let entry_rel = rel.join(&entry.name);
            if entry.is_directory {
                let local_dir = local_root.join(&entry_rel);
                fs::create_dir_all(&local_dir).map_err(|e| {
                    Error::io(format!("failed to create {}", local_dir.display()), e)
                })?;
                pending_dirs.push((remote_path, entry_rel));
            } else {
                files.push((remote_path, entry_rel));
            }
        }
    }

    let queue = Mutex::new(VecDeque::from(files));
    let checksums = Mutex::new(BTreeMap::<String, String>::new());
    let first_err = Mutex::new(None::<Error>);
    let workers = jobs.max(1);

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    if cancel.cancelled() || first_err.lock().expect("sync error lock").is_some() {
                        break;
                    }
                    let Some((remote_path, rel)) =
                        queue.lock().expect("sync queue lock").pop_front()
                    else {
                        break;
                    };
                    let local_path = local_root.join(&rel);
                    let fetched = transport.fetch_file(&remote_path, &local_path).and_then(|_| {
                        let bytes = fs::read(&local_path).map_err(|e| {
                            Error::io(format!("failed to read {}", local_path.display()), e)
                        })?;
                        Ok(checksum_bytes(&bytes))
                    });
                    match fetched {
                        Ok(checksum) => {
                            checksums
                                .lock()
                                .expect("sync checksum lock")
                                .insert(rel_str(&rel), checksum);
                        }
                        Err(e) => {
                            let mut slot = first_err.lock().expect("sync error lock");
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                        }
                    }
                }
            });
        }
    });

    if let Some(e) = first_err.into_inner().expect("sync error lock") {
        return Err(e);
    }
    if cancel.cancelled() {
        return Err(Error::node(transport.node_name(), "sync cancelled"));
    }
    Ok(checksums.into_inner().expect("sync checksum lock"))
}
