use std::path::Path;

use similar::TextDiff;

use crate::error::{Error, Result};
use crate::schema;
use crate::store::YamlStore;

/// Unified diff between two YAML renderings, three lines of context.
pub fn unified_diff(original: &str, modified: &str) -> String {
    if original == modified {
        return "No changes detected".to_string();
    }
    TextDiff::from_lines(original, modified)
        .unified_diff()
        .context_radius(3)
        .header("original", "modified")
        .to_string()
}

/// Keep only the lines of a diff relevant to specific changed values:
/// hunk/file headers plus any line mentioning one of the values.
pub fn filter_relevant(diff: &str, changed_values: &[String]) -> String {
    let mut relevant = Vec::new();
    for line in diff.lines() {
        let is_header =
            line.starts_with("@@") || line.starts_with("+++") || line.starts_with("---");
        if is_header || changed_values.iter().any(|v| line.contains(v.as_str())) {
            relevant.push(line);
        }
    }
    if relevant.is_empty() {
        return "No significant changes detected".to_string();
    }
    relevant.join("\n")
}

/// A proposed key/period edit to one config document, used for previews.
#[derive(Debug, Clone, Default)]
pub struct ProposedChanges {
    pub unique_key: Option<u64>,
    pub period: Option<String>,
}

impl ProposedChanges {
    pub fn is_empty(&self) -> bool {
        self.unique_key.is_none() && self.period.is_none()
    }

    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(key) = self.unique_key {
            parts.push(format!("NumUniqKey: {key}"));
        }
        if let Some(period) = &self.period {
            parts.push(format!("period: {period}"));
        }
        if parts.is_empty() {
            return "No changes".to_string();
        }
        parts.join(", ")
    }

    fn changed_values(&self) -> Vec<String> {
        let mut values = Vec::new();
        if let Some(key) = self.unique_key {
            values.push(key.to_string());
        }
        if let Some(period) = &self.period {
            values.push(period.clone());
        }
        values
    }
}

#[derive(Debug, Clone)]
pub struct ChangePreview {
    pub full_diff: String,
    pub filtered_diff: String,
    pub summary: String,
}

/// Render the document at `path`, apply the proposed changes to a clone,
/// and diff the two renderings. Nothing is written.
pub fn preview(store: &YamlStore, path: &Path, changes: &ProposedChanges) -> Result<ChangePreview> {
    if changes.is_empty() {
        return Ok(ChangePreview {
            full_diff: "No changes detected".to_string(),
            filtered_diff: "No significant changes detected".to_string(),
            summary: changes.summary(),
        });
    }

    let (value, _) = store.read(path)?;
    let original = serde_yaml::to_string(&value)
        .map_err(|e| Error::yaml(format!("failed to render {}", path.display()), e))?;

    let mut modified_value = value.clone();
    if let Some(key) = changes.unique_key {
        schema::check_unique_key(key)?;
        schema::set_unique_key(&mut modified_value, key);
    }
    if let Some(period) = &changes.period {
        crate::duration::parse(period)?;
        schema::set_period(&mut modified_value, period);
    }
    let modified = serde_yaml::to_string(&modified_value)
        .map_err(|e| Error::yaml(format!("failed to render {}", path.display()), e))?;

    let full_diff = unified_diff(&original, &modified);
    let filtered_diff = filter_relevant(&full_diff, &changes.changed_values());

    Ok(ChangePreview {
        full_diff,
        filtered_diff,
        summary: changes.summary(),
    })
}
