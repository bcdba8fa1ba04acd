//! TOML configuration parsing and validation.
//!
//! Every section is optional; an empty file (or [`Config::minimal`]) yields a
//! working in-process setup with the hashing embedder and file-backed
//! metadata.
//!
//! ```toml
//! [workspace]
//! dir = "./work"
//!
//! [backend]
//! kind = "out_of_process"
//!
//! [framework]
//! url = "http://localhost:8080"
//! command = ["python", "-m", "superlinked.server"]
//! kill_pattern = "superlinked.server"
//!
//! [metadata]
//! store = "qdrant"
//! qdrant_url = "http://localhost:6333"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable overriding `[workspace].dir`.
pub const WORK_DIR_ENV: &str = "SPACE_HARNESS_WORK_DIR";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub spaces: SpacesConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub framework: FrameworkConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    #[serde(default = "default_work_dir")]
    pub dir: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            dir: default_work_dir(),
        }
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    InProcess,
    OutOfProcess,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Base URL for the `ollama` provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_embedding_model(),
            dims: default_dims(),
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hashing".to_string()
}
fn default_embedding_model() -> String {
    "sentence-transformers/all-mpnet-base-v2".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

/// Per-role space construction parameters and default weights.
#[derive(Debug, Deserialize, Clone)]
pub struct SpacesConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_recency_period_days")]
    pub recency_period_days: u32,
    #[serde(default = "default_recency_negative_filter")]
    pub recency_negative_filter: f64,
    #[serde(default)]
    pub number_min: f64,
    #[serde(default = "default_number_max")]
    pub number_max: f64,
    #[serde(default)]
    pub category_negative_filter: f64,
    #[serde(default = "default_text_weight")]
    pub text_weight: f64,
    #[serde(default = "default_minor_weight")]
    pub recency_weight: f64,
    #[serde(default = "default_minor_weight")]
    pub number_weight: f64,
    #[serde(default = "default_category_weight")]
    pub category_weight: f64,
}

impl Default for SpacesConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            recency_period_days: default_recency_period_days(),
            recency_negative_filter: default_recency_negative_filter(),
            number_min: 0.0,
            number_max: default_number_max(),
            category_negative_filter: 0.0,
            text_weight: default_text_weight(),
            recency_weight: default_minor_weight(),
            number_weight: default_minor_weight(),
            category_weight: default_category_weight(),
        }
    }
}

fn default_chunk_size() -> usize {
    100
}
fn default_chunk_overlap() -> usize {
    20
}
fn default_recency_period_days() -> u32 {
    300
}
fn default_recency_negative_filter() -> f64 {
    -0.25
}
fn default_number_max() -> f64 {
    1.0
}
fn default_text_weight() -> f64 {
    1.0
}
fn default_minor_weight() -> f64 {
    0.3
}
fn default_category_weight() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MetadataStoreKind {
    #[default]
    File,
    Qdrant,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetadataConfig {
    #[serde(default)]
    pub store: MetadataStoreKind,
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,
    #[serde(default = "default_metadata_collection")]
    pub collection: String,
    #[serde(default = "default_qdrant_timeout")]
    pub timeout_secs: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            store: MetadataStoreKind::File,
            qdrant_url: default_qdrant_url(),
            collection: default_metadata_collection(),
            timeout_secs: default_qdrant_timeout(),
        }
    }
}

fn default_qdrant_url() -> String {
    "http://localhost:6333".to_string()
}
fn default_metadata_collection() -> String {
    "_sl_metadata".to_string()
}
fn default_qdrant_timeout() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IngestMode {
    #[default]
    PerRow,
    BulkLoader,
}

/// Out-of-process framework server settings.
#[derive(Debug, Deserialize, Clone)]
pub struct FrameworkConfig {
    #[serde(default = "default_framework_url")]
    pub url: String,
    /// Program and arguments that start the server. Absent means the server
    /// is managed externally and is only attached to.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// `pkill -9 -f` pattern used when a server this handle did not spawn
    /// occupies the port.
    #[serde(default)]
    pub kill_pattern: Option<String>,
    #[serde(default = "default_app_module")]
    pub app_module: String,
    #[serde(default = "default_app_module_env")]
    pub app_module_env: String,
    #[serde(default = "default_metadata_env")]
    pub metadata_env: String,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_ingest_timeout")]
    pub ingest_timeout_secs: u64,
    #[serde(default)]
    pub ingest_mode: IngestMode,
    #[serde(default = "default_ack_timeout")]
    pub ingest_ack_timeout_secs: u64,
    /// Re-ingest every index from its source file after a (re)start, for
    /// servers whose vector store does not survive restarts.
    #[serde(default)]
    pub reingest_on_start: bool,
    /// Qdrant instance holding the server's vectors.
    #[serde(default = "default_qdrant_url")]
    pub vector_db_url: String,
    /// Each index stores its vectors in collection `{prefix}{index}`.
    #[serde(default = "default_collection_prefix")]
    pub collection_prefix: String,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            url: default_framework_url(),
            command: None,
            kill_pattern: None,
            app_module: default_app_module(),
            app_module_env: default_app_module_env(),
            metadata_env: default_metadata_env(),
            startup_timeout_secs: default_startup_timeout(),
            poll_interval_ms: default_poll_interval(),
            health_timeout_ms: default_health_timeout(),
            request_timeout_secs: default_request_timeout(),
            ingest_timeout_secs: default_ingest_timeout(),
            ingest_mode: IngestMode::PerRow,
            ingest_ack_timeout_secs: default_ack_timeout(),
            reingest_on_start: false,
            vector_db_url: default_qdrant_url(),
            collection_prefix: default_collection_prefix(),
        }
    }
}

fn default_framework_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_app_module() -> String {
    "app".to_string()
}
fn default_app_module_env() -> String {
    "APP_MODULE_PATH".to_string()
}
fn default_metadata_env() -> String {
    "INDEX_METADATA".to_string()
}
fn default_startup_timeout() -> u64 {
    30
}
fn default_poll_interval() -> u64 {
    1000
}
fn default_health_timeout() -> u64 {
    1000
}
fn default_request_timeout() -> u64 {
    30
}
fn default_ingest_timeout() -> u64 {
    5
}
fn default_ack_timeout() -> u64 {
    120
}
fn default_collection_prefix() -> String {
    "sl_".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_chat_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<String>,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            endpoint: default_chat_endpoint(),
            model: default_chat_model(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            max_tool_rounds: default_max_tool_rounds(),
            allowed_tools: default_allowed_tools(),
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_chat_endpoint() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_chat_model() -> String {
    "claude-haiku-4-5".to_string()
}
fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_max_tool_rounds() -> usize {
    8
}
fn default_allowed_tools() -> Vec<String> {
    ["preview_file", "create_index", "list_indexes", "query_index"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_system_prompt() -> String {
    "You are a retrieval assistant that helps users index and search their data files. \
     Preview a file before indexing it, pick a role for each useful column \
     (text_similarity, recency, number, category), and answer questions from \
     query_index results. Only use the provided tools when working with data files."
        .to_string()
}

impl Config {
    /// All-defaults configuration, used when no config file is present.
    pub fn minimal() -> Self {
        Self::default()
    }

    /// Resolve a user-supplied path against the workspace directory.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workspace.dir.join(p)
        }
    }

    /// Apply environment overrides and validate.
    pub fn finalize(mut self) -> Result<Self> {
        if let Ok(dir) = std::env::var(WORK_DIR_ENV) {
            if !dir.trim().is_empty() {
                self.workspace.dir = PathBuf::from(dir);
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let spaces = &self.spaces;
        if spaces.chunk_size == 0 {
            anyhow::bail!("spaces.chunk_size must be > 0");
        }
        if spaces.chunk_overlap >= spaces.chunk_size {
            anyhow::bail!("spaces.chunk_overlap must be smaller than spaces.chunk_size");
        }
        if spaces.recency_period_days == 0 {
            anyhow::bail!("spaces.recency_period_days must be > 0");
        }
        if spaces.number_min >= spaces.number_max {
            anyhow::bail!("spaces.number_min must be smaller than spaces.number_max");
        }

        if self.embedding.dims == 0 {
            anyhow::bail!("embedding.dims must be > 0");
        }
        match self.embedding.provider.as_str() {
            "hashing" | "ollama" | "openai" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be hashing, ollama, or openai.",
                other
            ),
        }

        let framework = &self.framework;
        if framework.startup_timeout_secs == 0 {
            anyhow::bail!("framework.startup_timeout_secs must be > 0");
        }
        if framework.poll_interval_ms == 0 {
            anyhow::bail!("framework.poll_interval_ms must be > 0");
        }
        if let Some(cmd) = &framework.command {
            if cmd.is_empty() || cmd[0].trim().is_empty() {
                anyhow::bail!("framework.command must name a program");
            }
        }

        if self.chat.max_tool_rounds == 0 {
            anyhow::bail!("chat.max_tool_rounds must be >= 1");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    config.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.backend.kind, BackendKind::InProcess);
        assert_eq!(config.metadata.store, MetadataStoreKind::File);
        assert_eq!(config.spaces.recency_period_days, 300);
        assert_eq!(config.spaces.recency_negative_filter, -0.25);
        assert_eq!(config.spaces.chunk_size, 100);
        assert_eq!(config.spaces.chunk_overlap, 20);
        assert_eq!(config.framework.ingest_mode, IngestMode::PerRow);
        assert!(config.framework.command.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_out_of_process() {
        let config: Config = toml::from_str(
            r#"
[backend]
kind = "out_of_process"

[framework]
url = "http://127.0.0.1:9000"
command = ["python", "-m", "superlinked.server"]
ingest_mode = "bulk_loader"

[metadata]
store = "qdrant"
"#,
        )
        .unwrap();
        assert_eq!(config.backend.kind, BackendKind::OutOfProcess);
        assert_eq!(config.framework.ingest_mode, IngestMode::BulkLoader);
        assert_eq!(config.framework.command.as_ref().unwrap().len(), 3);
        assert_eq!(config.metadata.store, MetadataStoreKind::Qdrant);
        assert_eq!(config.metadata.collection, "_sl_metadata");
    }

    #[test]
    fn test_rejects_overlap_not_below_chunk_size() {
        let config: Config = toml::from_str(
            r#"
[spaces]
chunk_size = 10
chunk_overlap = 10
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let config: Config = toml::from_str(
            r#"
[embedding]
provider = "magic"
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("magic"));
    }

    #[test]
    fn test_resolve_relative_path() {
        let mut config = Config::minimal();
        config.workspace.dir = PathBuf::from("/data/work");
        assert_eq!(
            config.resolve_path("docs.csv"),
            PathBuf::from("/data/work/docs.csv")
        );
        assert_eq!(config.resolve_path("/tmp/x.csv"), PathBuf::from("/tmp/x.csv"));
    }
}
