//! TOML configuration.
//!
//! Every section is optional; a missing section falls back to defaults that
//! work fully offline (SQLite index, hash embeddings, lexical reranking,
//! extractive answers). Set `[generation] provider = "openai"` for LLM answers.
//!
//! ```toml
//! [index]
//! backend = "sqlite"          # or "memory"
//! path = "./data/answers.sqlite"
//!
//! [chunking]
//! max_tokens = 1000
//! overlap_tokens = 100
//!
//! [retrieval]
//! top_k = 10
//! rerank_top_k = 5
//!
//! [embedding]
//! provider = "hash"           # hash | openai | ollama | local | disabled
//!
//! [rerank]
//! provider = "lexical"        # cohere | lexical | disabled
//!
//! [generation]
//! provider = "openai"         # any OpenAI-compatible chat endpoint
//! url = "https://api.groq.com/openai/v1"
//! model = "llama-3.3-70b-versatile"
//! api_key_env = "GROQ_API_KEY"
//!
//! [pricing]
//! prompt_per_1k_tokens = 0.0007
//! completion_per_1k_tokens = 0.0008
//!
//! [server]
//! bind = "127.0.0.1:8000"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub pricing: PriceTable,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_index_path")]
    pub path: PathBuf,
    #[serde(default = "default_index_name")]
    pub name: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_index_path(),
            name: default_index_name(),
        }
    }
}

fn default_backend() -> String {
    "sqlite".to_string()
}
fn default_index_path() -> PathBuf {
    PathBuf::from("./data/answers.sqlite")
}
fn default_index_name() -> String {
    "knowledge-base".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_max_tokens() -> usize {
    1000
}
fn default_overlap() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_rerank_top_k")]
    pub rerank_top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            rerank_top_k: default_rerank_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_rerank_top_k() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (OpenAI-compatible or Ollama endpoint).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            api_key_env: default_openai_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default = "default_rerank_provider")]
    pub provider: String,
    #[serde(default = "default_rerank_model")]
    pub model: String,
    #[serde(default = "default_rerank_url")]
    pub url: String,
    #[serde(default = "default_cohere_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: default_rerank_provider(),
            model: default_rerank_model(),
            url: default_rerank_url(),
            api_key_env: default_cohere_key_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_rerank_provider() -> String {
    "lexical".to_string()
}
fn default_rerank_model() -> String {
    "rerank-v3.5".to_string()
}
fn default_rerank_url() -> String {
    "https://api.cohere.com/v2/rerank".to_string()
}
fn default_cohere_key_env() -> String {
    "COHERE_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    /// Base URL of an OpenAI-compatible API (`/chat/completions` is appended).
    #[serde(default = "default_generation_url")]
    pub url: String,
    #[serde(default = "default_groq_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_completion_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: default_generation_model(),
            url: default_generation_url(),
            api_key_env: default_groq_key_env(),
            temperature: default_temperature(),
            max_tokens: default_max_completion_tokens(),
            max_retries: default_generation_retries(),
            retry_base_ms: default_retry_base_ms(),
            timeout_secs: default_generation_timeout(),
        }
    }
}

fn default_generation_provider() -> String {
    "extractive".to_string()
}
fn default_generation_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}
fn default_generation_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}
fn default_groq_key_env() -> String {
    "GROQ_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_completion_tokens() -> u32 {
    1024
}
fn default_generation_retries() -> u32 {
    2
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_generation_timeout() -> u64 {
    60
}

/// Per-token-type prices used for the cost estimate of each query.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PriceTable {
    #[serde(default = "default_embedding_price")]
    pub embedding_per_1k_tokens: f64,
    #[serde(default = "default_rerank_price")]
    pub rerank_per_search: f64,
    #[serde(default = "default_prompt_price")]
    pub prompt_per_1k_tokens: f64,
    #[serde(default = "default_completion_price")]
    pub completion_per_1k_tokens: f64,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            embedding_per_1k_tokens: default_embedding_price(),
            rerank_per_search: default_rerank_price(),
            prompt_per_1k_tokens: default_prompt_price(),
            completion_per_1k_tokens: default_completion_price(),
        }
    }
}

fn default_embedding_price() -> f64 {
    0.00002
}
fn default_rerank_price() -> f64 {
    0.001
}
fn default_prompt_price() -> f64 {
    0.0007
}
fn default_completion_price() -> f64 {
    0.0008
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_request_timeout() -> u64 {
    120
}

/// Commented configuration written by `ans init`.
pub const CONFIG_TEMPLATE: &str = include_str!("../config/ans.example.toml");

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Check cross-field constraints that serde defaults cannot express.
pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        bail!("chunking.overlap_tokens must be smaller than chunking.max_tokens");
    }

    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.rerank_top_k == 0 {
        bail!("retrieval.rerank_top_k must be >= 1");
    }

    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be >= 1");
    }

    match config.index.backend.as_str() {
        "sqlite" | "memory" => {}
        other => bail!(
            "Unknown index backend: '{}'. Must be sqlite or memory.",
            other
        ),
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, ollama, or local.",
            other
        ),
    }

    match config.rerank.provider.as_str() {
        "disabled" | "lexical" | "cohere" => {}
        other => bail!(
            "Unknown rerank provider: '{}'. Must be disabled, lexical, or cohere.",
            other
        ),
    }

    match config.generation.provider.as_str() {
        "disabled" | "extractive" | "openai" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled, extractive, or openai.",
            other
        ),
    }

    let p = &config.pricing;
    if [
        p.embedding_per_1k_tokens,
        p.rerank_per_search,
        p.prompt_per_1k_tokens,
        p.completion_per_1k_tokens,
    ]
    .iter()
    .any(|v| !v.is_finite() || *v < 0.0)
    {
        bail!("pricing entries must be finite and non-negative");
    }

    Ok(())
}
