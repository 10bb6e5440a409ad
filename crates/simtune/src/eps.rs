use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::duration;
use crate::error::{Error, Result};
use crate::schema::{ModuleConfig, SubmoduleConfig};
use crate::store::{self, YamlStore};

/// The one EPS formula, shared by the per-module engine and the cluster
/// roll-up: `eps = (module_key * submodule_sum) / period_seconds`, with a
/// non-positive period substituted by 1.0 to avoid division by zero.
pub fn compute_eps(module_key: u64, submodule_sum: u64, period_seconds: f64) -> f64 {
    let period = if period_seconds <= 0.0 { 1.0 } else { period_seconds };
    (module_key as f64 * submodule_sum as f64) / period
}

#[derive(Debug, Clone)]
pub struct SubmoduleContribution {
    pub name: String,
    pub uniquekey: u64,
    pub multiplier: u64,
    pub contribution: u64,
}

#[derive(Debug, Clone)]
pub struct EpsBreakdown {
    pub module_name: String,
    pub module_uniquekey: u64,
    pub module_period: String,
    pub period_seconds: f64,
    pub submodules: Vec<SubmoduleContribution>,
    pub total_submodule_contribution: u64,
    pub eps: f64,
}

#[derive(Debug, Clone, Default)]
pub struct EpsOverrides {
    pub module_uniquekey: Option<u64>,
    pub module_period: Option<String>,
    pub submodule_keys: BTreeMap<String, u64>,
}

#[derive(Debug, Clone)]
pub struct KeySuggestion {
    pub target_eps: f64,
    pub suggested_module_uniquekey: u64,
    pub current_module_uniquekey: u64,
    pub period: String,
    pub period_seconds: f64,
    pub total_submodule_contribution: u64,
    pub expected_eps: f64,
    pub deviation: f64,
    pub within_tolerance: bool,
}

#[derive(Debug, Clone)]
pub struct ModuleSummary {
    pub name: String,
    pub enabled: bool,
    pub eps: f64,
    pub module_uniquekey: u64,
    pub module_period: String,
    pub submodule_count: usize,
}

/// Derives EPS values from one configuration root (the local tree or a
/// node snapshot). Operates over files present on disk: every `.yml`
/// sibling of a module's `conf.yml` counts, whether or not the module's
/// `Include_sub_modules` references it.
pub struct EpsEngine<'a> {
    conf_dir: PathBuf,
    store: &'a YamlStore,
}

impl<'a> EpsEngine<'a> {
    pub fn new<P: Into<PathBuf>>(conf_dir: P, store: &'a YamlStore) -> Self {
        Self {
            conf_dir: conf_dir.into(),
            store,
        }
    }

    /// Every subdirectory of the configuration root containing a `conf.yml`.
    pub fn list_modules(&self) -> Result<Vec<String>> {
        if !self.conf_dir.is_dir() {
            return Err(Error::not_found(self.conf_dir.display().to_string()));
        }
        let entries = fs::read_dir(&self.conf_dir)
            .map_err(|e| Error::io(format!("failed to list {}", self.conf_dir.display()), e))?;
        let mut modules = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::io("failed to read directory entry".to_string(), e))?;
            let path = entry.path();
            if path.is_dir() && path.join("conf.yml").is_file() {
                if let Some(name) = path.file_name().and_then(|s| s.to_str()) {
                    modules.push(name.to_string());
                }
            }
        }
        modules.sort();
        Ok(modules)
    }

    /// Every `<name>.yml` sibling of `conf.yml` in the module directory.
    /// A missing module directory yields an empty list.
    pub fn list_submodules(&self, module: &str) -> Result<Vec<String>> {
        let module_dir = self.conf_dir.join(module);
        if !module_dir.is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&module_dir)
            .map_err(|e| Error::io(format!("failed to list {}", module_dir.display()), e))?;
        let mut submodules = Vec::new();
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
                submodules.push(stem.to_string());
            }
        }
        submodules.sort();
        Ok(submodules)
    }

    fn module_config(&self, module: &str) -> Result<ModuleConfig> {
        let path = store::module_config_path(&self.conf_dir, module);
        let (value, _) = self.store.read(&path)?;
        ModuleConfig::from_value(&value)
    }

    fn submodule_config(&self, module: &str, submodule: &str) -> Result<SubmoduleConfig> {
        let path = store::submodule_config_path(&self.conf_dir, module, submodule);
        let (value, _) = self.store.read(&path)?;
        SubmoduleConfig::from_value(&value)
    }

    /// Compute the module's EPS from its configuration, with optional
    /// overrides applied in memory (no file is touched).
    pub fn calculate(&self, module: &str, overrides: &EpsOverrides) -> Result<EpsBreakdown> {
        let config = self.module_config(module)?;

        let module_uniquekey = overrides.module_uniquekey.unwrap_or_else(|| config.unique_key());
        let module_period = overrides
            .module_period
            .clone()
            .unwrap_or_else(|| config.period().to_string());
        let raw_period_seconds = duration::parse(&module_period)?;
        let period_seconds = if raw_period_seconds <= 0.0 { 1.0 } else { raw_period_seconds };

        let mut submodules = Vec::new();
        let mut total_submodule_contribution = 0u64;
        for name in self.list_submodules(module)? {
            let sub_config = self.submodule_config(module, &name)?;
            let uniquekey = match overrides.submodule_keys.get(&name) {
                Some(&v) if v >= 1 => v,
                Some(_) => crate::schema::DEFAULT_UNIQUE_KEY,
                None => sub_config.effective_key(),
            };
            let multiplier = 1u64;
            let contribution = multiplier * uniquekey;
            total_submodule_contribution += contribution;
            submodules.push(SubmoduleContribution {
                name,
                uniquekey,
                multiplier,
                contribution,
            });
        }

        let eps = compute_eps(module_uniquekey, total_submodule_contribution, period_seconds);

        Ok(EpsBreakdown {
            module_name: module.to_string(),
            module_uniquekey,
            module_period,
            period_seconds,
            submodules,
            total_submodule_contribution,
            eps,
        })
    }

    /// Invert the formula: suggest the module-level key that hits
    /// `target_eps` with the current submodule contributions, and report
    /// whether the rounded suggestion stays within `tolerance`.
    pub fn suggest_unique_key_for_target(
        &self,
        module: &str,
        target_eps: f64,
        period: Option<&str>,
        tolerance: f64,
    ) -> Result<KeySuggestion> {
        let config = self.module_config(module)?;
        let period_str = period.unwrap_or_else(|| config.period()).to_string();
        let period_seconds = duration::parse(&period_str)?;

        let mut total_submodule_contribution = 0u64;
        for name in self.list_submodules(module)? {
            let sub_config = self.submodule_config(module, &name)?;
            total_submodule_contribution += sub_config.effective_key();
        }

        if total_submodule_contribution == 0 {
            return Err(Error::NoUsableSubmodules {
                module: module.to_string(),
            });
        }

        let required = (target_eps * period_seconds) / total_submodule_contribution as f64;
        let suggested_module_uniquekey = (required.round() as i64).max(1) as u64;

        let expected_eps = compute_eps(
            suggested_module_uniquekey,
            total_submodule_contribution,
            period_seconds,
        );
        let deviation = if target_eps > 0.0 {
            (expected_eps - target_eps).abs() / target_eps
        } else {
            0.0
        };

        Ok(KeySuggestion {
            target_eps,
            suggested_module_uniquekey,
            current_module_uniquekey: config.unique_key(),
            period: period_str,
            period_seconds,
            total_submodule_contribution,
            expected_eps,
            deviation,
            within_tolerance: deviation <= tolerance,
        })
    }

    /// One-line view of a module for listings.
    pub fn module_summary(&self, module: &str) -> Result<ModuleSummary> {
        let config = self.module_config(module)?;
        let breakdown = self.calculate(module, &EpsOverrides::default())?;
        Ok(ModuleSummary {
            name: module.to_string(),
            enabled: config.enabled.unwrap_or(false),
            eps: breakdown.eps,
            module_uniquekey: breakdown.module_uniquekey,
            module_period: breakdown.module_period,
            submodule_count: breakdown.submodules.len(),
        })
    }

    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }
}
