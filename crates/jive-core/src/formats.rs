//! File representations of work items.
//!
//! Three on-disk forms are supported: JSON, YAML, and Markdown with YAML
//! frontmatter. Renders exclude the derived `vector` field; the sync engine
//! re-embeds on every DB write.

use crate::types::WorkItem;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("unsupported file extension: {0}")]
    UnknownExtension(String),
    #[error("markdown file is missing its frontmatter fence")]
    MissingFrontmatter,
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, FormatError>;

/// On-disk representation of a work item, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Yaml,
    Markdown,
}

impl FileFormat {
    /// Canonical extension used when rendering.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Markdown => "md",
        }
    }

    pub fn from_extension(ext: &str) -> Result<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            "md" => Ok(Self::Markdown),
            other => Err(FormatError::UnknownExtension(other.to_string())),
        }
    }

    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| FormatError::UnknownExtension(path.display().to_string()))?;
        Self::from_extension(ext)
    }
}

/// SHA-256 hex digest over exact byte content.
pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Serialize a work item to a JSON object with derived fields stripped.
fn to_file_value(item: &WorkItem) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(item)?;
    if let Some(map) = value.as_object_mut() {
        map.remove("vector");
    }
    Ok(value)
}

/// Render a work item in the given file format.
pub fn render_work_item(item: &WorkItem, format: FileFormat) -> Result<String> {
    let value = to_file_value(item)?;
    match format {
        FileFormat::Json => {
            let mut out = serde_json::to_string_pretty(&value)?;
            out.push('\n');
            Ok(out)
        }
        FileFormat::Yaml => Ok(serde_yaml::to_string(&value)?),
        FileFormat::Markdown => {
            let mut front = value;
            let body = front
                .as_object_mut()
                .and_then(|map| map.remove("description"))
                .and_then(|d| d.as_str().map(String::from))
                .unwrap_or_default();
            let yaml = serde_yaml::to_string(&front)?;
            Ok(format!("---\n{yaml}---\n\n{body}\n"))
        }
    }
}

/// Parse file content into a work item.
pub fn parse_work_item(content: &str, format: FileFormat) -> Result<WorkItem> {
    match format {
        FileFormat::Json => Ok(serde_json::from_str(content)?),
        FileFormat::Yaml => Ok(serde_yaml::from_str(content)?),
        FileFormat::Markdown => {
            let (front, body) = split_frontmatter(content)?;
            let mut value: serde_json::Value =
                serde_json::to_value(serde_yaml::from_str::<serde_yaml::Value>(front)?)?;
            let body = body.trim();
            if !body.is_empty() {
                // A non-empty body always wins over a frontmatter description.
                if let Some(map) = value.as_object_mut() {
                    map.insert(
                        "description".to_string(),
                        serde_json::Value::String(body.to_string()),
                    );
                }
            }
            Ok(serde_json::from_value(value)?)
        }
    }
}

/// Split a Markdown document into its YAML frontmatter and body.
///
/// The document must begin with a `---` line; the frontmatter runs until the
/// next `---` line.
fn split_frontmatter(content: &str) -> Result<(&str, &str)> {
    let rest = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))
        .ok_or(FormatError::MissingFrontmatter)?;

    for fence in ["\n---\n", "\n---\r\n"] {
        if let Some(idx) = rest.find(fence) {
            return Ok((&rest[..idx + 1], &rest[idx + fence.len()..]));
        }
    }
    // Frontmatter closed at end of file with no body.
    for fence in ["\n---", "\n---\r"] {
        if let Some(stripped) = rest.strip_suffix(fence) {
            return Ok((stripped, ""));
        }
    }
    Err(FormatError::MissingFrontmatter)
}

/// Slug used in task file names: lowercase alphanumerics joined by dashes,
/// capped at 40 characters.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= 40 {
            break;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("item");
    }
    slug
}

/// File name for a work item under the tasks directory:
/// `<item-id>-<slug>.<ext>`, preferring the human-friendly `item_id`.
pub fn task_file_name(item: &WorkItem, format: FileFormat) -> String {
    let id_part = item.item_id.as_deref().unwrap_or(&item.id);
    format!(
        "{}-{}.{}",
        slugify(id_part),
        slugify(&item.title),
        format.extension()
    )
}

/// File name of the sync-state mirror for a work item.
pub fn sync_state_file_name(work_item_id: &str) -> String {
    format!("{work_item_id}.state.json")
}
