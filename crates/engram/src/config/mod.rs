use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EngramError, Result};

/// Main configuration structure for Engram
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Durable store and vector index locations
    #[serde(default)]
    pub storage: StorageConfig,
    /// Embedding and generation service
    #[serde(default)]
    pub inference: InferenceConfig,
    /// Ingestion and repair sweep
    #[serde(default)]
    pub ingestion: IngestionConfig,
    /// Summarization and eviction policy
    #[serde(default)]
    pub compaction: CompactionConfig,
    /// Ranking and context budget defaults
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// HTTP API
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Parse a TOML document, filling every missing key with its default
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| EngramError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load from an explicit path, or the first default location that exists.
    ///
    /// Search order: `~/.engram/config.toml`, `<config dir>/engram/config.toml`,
    /// `./config.toml`. Falls back to defaults when none exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            tracing::info!("Loading config from: {}", path.display());
            return Self::read_file(path);
        }

        let default_paths = [
            dirs::home_dir().map(|h| h.join(".engram").join("config.toml")),
            dirs::config_dir().map(|c| c.join("engram").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        for candidate in default_paths.iter().flatten() {
            if candidate.exists() {
                tracing::info!("Loading config from: {}", candidate.display());
                return Self::read_file(candidate);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn read_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngramError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for the database and vector index
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// SQLite file name inside `data_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,
    /// LanceDB directory name inside `data_dir`
    #[serde(default = "default_index_dir")]
    pub index_dir: String,
    /// LanceDB table holding memory vectors
    #[serde(default = "default_vector_table")]
    pub vector_table: String,
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.index_dir)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_file: default_database_file(),
            index_dir: default_index_dir(),
            vector_table: default_vector_table(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".engram"))
        .unwrap_or_else(|| PathBuf::from(".engram"))
}

fn default_database_file() -> String {
    "engram.db".to_string()
}

fn default_index_dir() -> String {
    "vectors".to_string()
}

fn default_vector_table() -> String {
    "memory_vectors".to_string()
}

/// Where embeddings are computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Remote `/embeddings` endpoint
    Remote,
    /// In-process fastembed model
    Local,
}

/// Wire shape of the generation endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationApi {
    /// OpenAI-compatible `POST /chat/completions`
    ChatCompletions,
    /// Plain `POST /generate` taking a prompt and returning `{"text": ...}`
    Generate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_embedding_provider")]
    pub embedding_provider: EmbeddingProvider,
    #[serde(default = "default_generation_api")]
    pub generation_api: GenerationApi,
    /// Base URL of the inference service
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Environment variable holding the bearer token (optional)
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_generation_model")]
    pub generation_model: String,
    /// Vector width; returned vectors of any other width are rejected
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,
    /// Bound on a single embedding call
    #[serde(default = "default_embed_timeout_secs")]
    pub embed_timeout_secs: u64,
    /// Bound on a single summarization call
    #[serde(default = "default_summarize_timeout_secs")]
    pub summarize_timeout_secs: u64,
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Sampling temperature for summaries
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            embedding_provider: default_embedding_provider(),
            generation_api: default_generation_api(),
            api_url: default_api_url(),
            api_key_env: default_api_key_env(),
            embedding_model: default_embedding_model(),
            generation_model: default_generation_model(),
            embedding_dimension: default_embedding_dimension(),
            embed_timeout_secs: default_embed_timeout_secs(),
            summarize_timeout_secs: default_summarize_timeout_secs(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            temperature: default_temperature(),
        }
    }
}

fn default_embedding_provider() -> EmbeddingProvider {
    EmbeddingProvider::Local
}

fn default_generation_api() -> GenerationApi {
    GenerationApi::ChatCompletions
}

fn default_api_url() -> String {
    "http://127.0.0.1:8000/v1".to_string()
}

fn default_api_key_env() -> String {
    "ENGRAM_API_KEY".to_string()
}

fn default_embedding_model() -> String {
    "multilingual-e5-small".to_string()
}

fn default_generation_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_dimension() -> usize {
    384
}

fn default_embed_timeout_secs() -> u64 {
    10
}

fn default_summarize_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_temperature() -> f32 {
    0.3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// How often the repair sweep runs
    #[serde(default = "default_repair_interval_secs")]
    pub repair_interval_secs: u64,
    /// Age after which a `pending` record is considered stuck
    #[serde(default = "default_repair_grace_secs")]
    pub repair_grace_secs: u64,
    /// Records fetched per sweep page
    #[serde(default = "default_repair_batch_size")]
    pub repair_batch_size: usize,
    /// Indexed records sampled per consistency check (0 disables)
    #[serde(default = "default_verify_sample_size")]
    pub verify_sample_size: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            repair_interval_secs: default_repair_interval_secs(),
            repair_grace_secs: default_repair_grace_secs(),
            repair_batch_size: default_repair_batch_size(),
            verify_sample_size: default_verify_sample_size(),
        }
    }
}

fn default_repair_interval_secs() -> u64 {
    300
}

fn default_repair_grace_secs() -> u64 {
    120
}

fn default_repair_batch_size() -> usize {
    100
}

fn default_verify_sample_size() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_compaction_enabled")]
    pub enabled: bool,
    /// Seconds between scheduled compaction cycles
    #[serde(default = "default_compaction_interval_secs")]
    pub interval_secs: u64,
    /// Turns older than this become eligible for summarization
    #[serde(default = "default_retention_window_hours")]
    pub retention_window_hours: u64,
    /// Live raw-turn count that triggers compaction of a conversation
    #[serde(default = "default_turn_threshold")]
    pub turn_threshold: usize,
    /// Newest turns left alone by a threshold-triggered compaction
    #[serde(default = "default_keep_recent_turns")]
    pub keep_recent_turns: usize,
    /// Maximum turns per summary
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Smaller batches wait for more turns
    #[serde(default = "default_batch_minimum")]
    pub batch_minimum: usize,
    #[serde(default = "default_max_summary_tokens")]
    pub max_summary_tokens: usize,
    /// Failed summarization attempts before a turn is flagged for review
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: default_compaction_enabled(),
            interval_secs: default_compaction_interval_secs(),
            retention_window_hours: default_retention_window_hours(),
            turn_threshold: default_turn_threshold(),
            keep_recent_turns: default_keep_recent_turns(),
            batch_size: default_batch_size(),
            batch_minimum: default_batch_minimum(),
            max_summary_tokens: default_max_summary_tokens(),
            max_attempts: default_max_attempts(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

fn default_compaction_enabled() -> bool {
    true
}

fn default_compaction_interval_secs() -> u64 {
    6 * 60 * 60
}

fn default_retention_window_hours() -> u64 {
    24
}

fn default_turn_threshold() -> usize {
    50
}

fn default_keep_recent_turns() -> usize {
    10
}

fn default_batch_size() -> usize {
    20
}

fn default_batch_minimum() -> usize {
    4
}

fn default_max_summary_tokens() -> usize {
    250
}

fn default_max_attempts() -> u32 {
    3
}

fn default_lease_ttl_secs() -> u64 {
    600
}

/// Which records a similarity search may return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalScope {
    /// Only the requesting conversation
    #[default]
    Conversation,
    /// Every conversation
    Global,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,
    /// Estimated tokens (chars / 4) allowed in one result
    #[serde(default = "default_token_budget")]
    pub default_token_budget: usize,
    #[serde(default)]
    pub scope: RetrievalScope,
    #[serde(default = "default_similarity_weight")]
    pub similarity_weight: f32,
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f32,
    /// Age at which the recency score halves
    #[serde(default = "default_recency_half_life_hours")]
    pub recency_half_life_hours: f64,
    /// Candidates fetched from the index per requested result
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            default_token_budget: default_token_budget(),
            scope: RetrievalScope::default(),
            similarity_weight: default_similarity_weight(),
            recency_weight: default_recency_weight(),
            recency_half_life_hours: default_recency_half_life_hours(),
            candidate_multiplier: default_candidate_multiplier(),
        }
    }
}

fn default_k() -> usize {
    5
}

fn default_token_budget() -> usize {
    1000
}

fn default_similarity_weight() -> f32 {
    0.7
}

fn default_recency_weight() -> f32 {
    0.3
}

fn default_recency_half_life_hours() -> f64 {
    24.0 * 7.0
}

fn default_candidate_multiplier() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:7878")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Default `limit` for the recent-turns route
    #[serde(default = "default_recent_turns_limit")]
    pub recent_turns_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            request_timeout_secs: default_request_timeout_secs(),
            recent_turns_limit: default_recent_turns_limit(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_recent_turns_limit() -> usize {
    10
}
