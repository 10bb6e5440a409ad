use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::{Error, Result};

pub const DEFAULT_UNIQUE_KEY: u64 = 1;
pub const MAX_UNIQUE_KEY: u64 = 1_000_000_000;

/// Reject unique-key values outside `[1, MAX_UNIQUE_KEY]`.
pub fn check_unique_key(value: u64) -> Result<()> {
    if value < 1 || value > MAX_UNIQUE_KEY {
        return Err(Error::OutOfRange { value });
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UniqueKeySection {
    #[serde(rename = "NumUniqKey")]
    pub num_uniq_key: Option<u64>,
}

/// `Include_sub_modules` accepts a single name, a list of names, or the
/// wildcard `"*"` (which may also appear as a list entry).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum IncludeSubModules {
    One(String),
    Many(Vec<String>),
}

impl IncludeSubModules {
    pub fn entries(&self) -> Vec<&str> {
        match self {
            IncludeSubModules::One(name) => vec![name.as_str()],
            IncludeSubModules::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    pub enabled: Option<bool>,
    pub uniquekey: Option<UniqueKeySection>,
    pub period: Option<String>,
    #[serde(rename = "Include_sub_modules")]
    pub include_sub_modules: Option<IncludeSubModules>,
    pub output: Option<OutputSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    pub kafka: Option<KafkaSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KafkaSection {
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubmoduleConfig {
    pub uniquekey: Option<UniqueKeySection>,
}

impl ModuleConfig {
    pub fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_yaml::from_value(value.clone())
            .map_err(|e| Error::yaml("module config decode failed", e))
    }

    /// Module-level unique key, defaulting when the section is absent.
    pub fn unique_key(&self) -> u64 {
        self.uniquekey
            .as_ref()
            .and_then(|u| u.num_uniq_key)
            .unwrap_or(DEFAULT_UNIQUE_KEY)
    }

    pub fn period(&self) -> &str {
        self.period.as_deref().unwrap_or("1s")
    }

    pub fn kafka_topic(&self) -> Option<&str> {
        self.output
            .as_ref()
            .and_then(|o| o.kafka.as_ref())
            .and_then(|k| k.topic.as_deref())
    }
}

impl SubmoduleConfig {
    pub fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_yaml::from_value(value.clone())
            .map_err(|e| Error::yaml("submodule config decode failed", e))
    }

    pub fn from_str(raw: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(raw)
            .map_err(|e| Error::yaml("submodule config parse failed", e))?;
        Self::from_value(&value)
    }

    /// A submodule participates in EPS/bulk-key operations only when the
    /// `uniquekey.NumUniqKey` key is actually present.
    pub fn has_usable_key(&self) -> bool {
        self.uniquekey
            .as_ref()
            .is_some_and(|u| u.num_uniq_key.is_some())
    }

    pub fn unique_key(&self) -> Option<u64> {
        self.uniquekey.as_ref().and_then(|u| u.num_uniq_key)
    }

    /// Key value used in calculations: missing or zero falls back to the
    /// default contribution.
    pub fn effective_key(&self) -> u64 {
        match self.unique_key() {
            Some(v) if v >= 1 => v,
            _ => DEFAULT_UNIQUE_KEY,
        }
    }
}

fn as_mapping_mut(doc: &mut Value) -> &mut Mapping {
    if !doc.is_mapping() {
        *doc = Value::Mapping(Mapping::new());
    }
    doc.as_mapping_mut().expect("value forced to mapping")
}

/// Set `uniquekey.NumUniqKey` on a document tree, creating the section when
/// absent and replacing it when it is not a mapping.
pub fn set_unique_key(doc: &mut Value, value: u64) {
    let map = as_mapping_mut(doc);
    let section_key = Value::String("uniquekey".to_string());
    let section = map
        .entry(section_key)
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    let section = as_mapping_mut(section);
    section.insert(
        Value::String("NumUniqKey".to_string()),
        Value::Number(value.into()),
    );
}

pub fn set_period(doc: &mut Value, period: &str) {
    let map = as_mapping_mut(doc);
    map.insert(
        Value::String("period".to_string()),
        Value::String(period.to_string()),
    );
}

pub fn set_enabled(doc: &mut Value, enabled: bool) {
    let map = as_mapping_mut(doc);
    map.insert(Value::String("enabled".to_string()), Value::Bool(enabled));
}
