use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::duration;
use crate::error::{Error, Result};
use crate::schema;

pub fn checksum_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn file_checksum(path: &Path) -> Result<String> {
    if !path.is_file() {
        return Err(Error::not_found(path.display().to_string()));
    }
    let bytes = fs::read(path)
        .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
    Ok(checksum_bytes(&bytes))
}

/// Write `body` to `path` through a sibling temp file and an atomic rename.
/// On any failure the original file is untouched and the temp file removed.
pub(crate) fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("failed to create {}", parent.display()), e))?;
    }
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        Error::invalid_format(format!("invalid file path for atomic write: {}", path.display()))
    })?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    if let Err(e) = fs::write(&tmp, body) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::io(format!("failed to write temp file {}", tmp.display()), e));
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::io(
            format!("failed to rename {} -> {}", tmp.display(), path.display()),
            e,
        ));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub new_checksum: String,
    pub backup_path: PathBuf,
}

/// Reads and writes individual YAML documents with optimistic concurrency.
///
/// Every read returns the checksum of the bytes it saw; every write requires
/// that checksum back and aborts before touching anything when the file has
/// changed in between. Writes go backup -> temp file -> atomic rename.
#[derive(Debug, Clone)]
pub struct YamlStore {
    backups_dir: PathBuf,
}

impl YamlStore {
    pub fn new<P: Into<PathBuf>>(backups_dir: P) -> Self {
        Self {
            backups_dir: backups_dir.into(),
        }
    }

    /// Load a YAML document and the checksum of its current bytes.
    ///
    /// Key order of mappings survives the round trip; comments do not.
    pub fn read(&self, path: &Path) -> Result<(Value, String)> {
        if !path.is_file() {
            return Err(Error::not_found(path.display().to_string()));
        }
        let raw = fs::read(path)
            .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
        let value: Value = serde_yaml::from_slice(&raw)
            .map_err(|e| Error::yaml(format!("YAML parse error in {}", path.display()), e))?;
        Ok((value, checksum_bytes(&raw)))
    }

    /// Raw text alongside the parsed document, for diff rendering.
    pub fn read_raw(&self, path: &Path) -> Result<(String, String)> {
        if !path.is_file() {
            return Err(Error::not_found(path.display().to_string()));
        }
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
        let checksum = checksum_bytes(raw.as_bytes());
        Ok((raw, checksum))
    }

    /// Replace the document at `path`, guarded by the checksum captured at
    /// read time. Order of operations: CAS check, backup, temp write,
    /// atomic rename, fresh checksum.
    pub fn write(&self, path: &Path, data: &Value, expected_checksum: &str) -> Result<WriteOutcome> {
        let current = file_checksum(path)?;
        if current != expected_checksum {
            return Err(Error::ConcurrentModification {
                path: path.to_path_buf(),
            });
        }

        let backup_path = self.backup(path)?;

        let body = serde_yaml::to_string(data)
            .map_err(|e| Error::yaml(format!("failed to serialize {}", path.display()), e))?;
        atomic_write_text(path, &body)?;

        let new_checksum = file_checksum(path)?;
        info!(path = %path.display(), backup = %backup_path.display(), "updated config file");
        Ok(WriteOutcome {
            new_checksum,
            backup_path,
        })
    }

    /// Timestamped copy under the backup root: `<name>.bak.<YYYYmmdd_HHMMSS>`.
    fn backup(&self, path: &Path) -> Result<PathBuf> {
        fs::create_dir_all(&self.backups_dir).map_err(|e| {
            Error::io(format!("failed to create {}", self.backups_dir.display()), e)
        })?;
        let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
            Error::invalid_format(format!("cannot back up {}", path.display()))
        })?;
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let backup_path = self.backups_dir.join(format!("{file_name}.bak.{timestamp}"));
        fs::copy(path, &backup_path).map_err(|e| {
            Error::io(
                format!("failed to back up {} -> {}", path.display(), backup_path.display()),
                e,
            )
        })?;
        Ok(backup_path)
    }
}

pub fn main_config_path(conf_dir: &Path) -> PathBuf {
    conf_dir.join("conf.yml")
}

pub fn module_config_path(conf_dir: &Path, module: &str) -> PathBuf {
    conf_dir.join(module).join("conf.yml")
}

pub fn submodule_config_path(conf_dir: &Path, module: &str, submodule: &str) -> PathBuf {
    conf_dir.join(module).join(format!("{submodule}.yml"))
}

/// Convenience mutators over one configuration tree. Each re-reads the
/// target to get a fresh checksum, verifies the caller's checksum against
/// it, applies one edit to the document tree, and writes back through the
/// store's guarded path.
pub struct ConfigEditor<'a> {
    store: &'a YamlStore,
    conf_dir: PathBuf,
}

impl<'a> ConfigEditor<'a> {
    pub fn new<P: Into<PathBuf>>(store: &'a YamlStore, conf_dir: P) -> Self {
        Self {
            store,
            conf_dir: conf_dir.into(),
        }
    }

    pub fn set_module_enabled(
        &self,
        module: &str,
        enabled: bool,
        expected_checksum: &str,
    ) -> Result<WriteOutcome> {
        let path = module_config_path(&self.conf_dir, module);
        let (mut data, current) = self.store.read(&path)?;
        if current != expected_checksum {
            return Err(Error::ConcurrentModification { path });
        }
        schema::set_enabled(&mut data, enabled);
        self.store.write(&path, &data, &current)
    }

    pub fn set_module_unique_key(
        &self,
        module: &str,
        value: u64,
        expected_checksum: &str,
    ) -> Result<WriteOutcome> {
        schema::check_unique_key(value)?;
        let path = module_config_path(&self.conf_dir, module);
        let (mut data, current) = self.store.read(&path)?;
        if current != expected_checksum {
            return Err(Error::ConcurrentModification { path });
        }
        schema::set_unique_key(&mut data, value);
        self.store.write(&path, &data, &current)
    }

    pub fn set_module_period(
        &self,
        module: &str,
        period: &str,
        expected_checksum: &str,
    ) -> Result<WriteOutcome> {
        duration::parse(period)?;
        let path = module_config_path(&self.conf_dir, module);
        let (mut data, current) = self.store.read(&path)?;
        if current != expected_checksum {
            return Err(Error::ConcurrentModification { path });
        }
        schema::set_period(&mut data, period);
        self.store.write(&path, &data, &current)
    }

    pub fn set_submodule_unique_key(
        &self,
        module: &str,
        submodule: &str,
        value: u64,
        expected_checksum: &str,
    ) -> Result<WriteOutcome> {
        schema::check_unique_key(value)?;
        let path = submodule_config_path(&self.conf_dir, module, submodule);
        let (mut data, current) = self.store.read(&path)?;
        if current != expected_checksum {
            return Err(Error::ConcurrentModification { path });
        }
        schema::set_unique_key(&mut data, value);
        self.store.write(&path, &data, &current)
    }
}
