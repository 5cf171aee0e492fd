//! Configuration for the engine daemon.
//!
//! Parsed from `key=value` files, merged over defaults. Relative paths are
//! resolved against the workspace root before use.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid float value for {key}: {value}")]
    InvalidFloat { key: String, value: String },
}

/// Distance metric for the vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorMetric {
    #[default]
    Cosine,
    L2,
}

impl VectorMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::L2 => "l2",
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Storage
    /// Root directory for storage data.
    pub data_path: PathBuf,
    /// Directory holding file-form work items managed by the sync engine.
    pub tasks_dir: PathBuf,
    /// Directory holding per-pair sync state mirrors.
    pub sync_state_dir: PathBuf,

    // Embedding
    /// Identifier passed to the embedding provider.
    pub embedding_model: String,
    /// Expected embedding dimension.
    pub vector_dim: usize,
    /// Embedding call timeout in seconds.
    pub embedding_timeout_sec: u64,
    /// Concurrent embedding calls allowed.
    pub embedding_concurrency: usize,

    // Search
    /// Whether to build and use the FTS index.
    pub enable_fts: bool,
    /// Weighting of the vector score in hybrid search.
    pub hybrid_alpha: f64,
    /// Distance metric for vector search.
    pub vector_metric: VectorMetric,
    /// Search timeout in seconds.
    pub search_timeout_sec: u64,

    // Execution
    /// Orchestrator concurrency cap.
    pub max_parallel_executions: usize,
    /// Per-item timeout in the orchestrator, in minutes.
    pub execution_timeout_minutes: u64,

    // Response shaping
    /// Truncate responses above this byte count.
    pub max_response_size: usize,
    /// Soft threshold triggering array truncation.
    pub truncation_threshold: usize,
    /// Whether to apply response truncation at all.
    pub enable_auto_truncation: bool,

    // Control plane
    /// Local HTTP port for the tool surface.
    pub listen_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data/jive"),
            tasks_dir: PathBuf::from(".jivedev/tasks"),
            sync_state_dir: PathBuf::from(".jivedev/sync"),
            embedding_model: "feature-hash".to_string(),
            vector_dim: 384,
            embedding_timeout_sec: 30,
            embedding_concurrency: 4,
            enable_fts: true,
            hybrid_alpha: 0.5,
            vector_metric: VectorMetric::Cosine,
            search_timeout_sec: 10,
            max_parallel_executions: 3,
            execution_timeout_minutes: 60,
            max_response_size: 65536,
            truncation_threshold: 50,
            enable_auto_truncation: true,
            listen_port: 8377,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "data_path" => self.data_path = PathBuf::from(value),
            "tasks_dir" => self.tasks_dir = PathBuf::from(value),
            "sync_state_dir" => self.sync_state_dir = PathBuf::from(value),
            "embedding_model" => self.embedding_model = value.to_string(),
            "vector_dim" => self.vector_dim = Self::parse_int(key, value)?,
            "embedding_timeout_sec" => {
                self.embedding_timeout_sec = Self::parse_int(key, value)?;
            }
            "embedding_concurrency" => {
                self.embedding_concurrency = Self::parse_int(key, value)?;
            }
            "enable_fts" => self.enable_fts = Self::parse_bool(key, value)?,
            "hybrid_alpha" => {
                let alpha: f64 = value.parse().map_err(|_| ConfigError::InvalidFloat {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
                if !(0.0..=1.0).contains(&alpha) {
                    return Err(ConfigError::InvalidFloat {
                        key: key.to_string(),
                        value: value.to_string(),
                    });
                }
                self.hybrid_alpha = alpha;
            }
            "vector_metric" => {
                self.vector_metric = match value {
                    "cosine" => VectorMetric::Cosine,
                    "l2" => VectorMetric::L2,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "vector_metric must be 'cosine' or 'l2', got '{value}'"
                        )))
                    }
                }
            }
            "search_timeout_sec" => self.search_timeout_sec = Self::parse_int(key, value)?,
            "max_parallel_executions" => {
                self.max_parallel_executions = Self::parse_int(key, value)?;
            }
            "execution_timeout_minutes" => {
                self.execution_timeout_minutes = Self::parse_int(key, value)?;
            }
            "max_response_size" => self.max_response_size = Self::parse_int(key, value)?,
            "truncation_threshold" => self.truncation_threshold = Self::parse_int(key, value)?,
            "enable_auto_truncation" => {
                self.enable_auto_truncation = Self::parse_bool(key, value)?;
            }
            "listen_port" => self.listen_port = Self::parse_int(key, value)?,
            _ => {
                // Unknown keys are warnings, not failures.
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve relative paths against a workspace root.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        if self.data_path.is_relative() {
            self.data_path = workspace_root.join(&self.data_path);
        }
        if self.tasks_dir.is_relative() {
            self.tasks_dir = workspace_root.join(&self.tasks_dir);
        }
        if self.sync_state_dir.is_relative() {
            self.sync_state_dir = workspace_root.join(&self.sync_state_dir);
        }
    }
}
