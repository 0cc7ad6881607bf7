//! This module provides functionality for loading and handling the application's configuration.
//!
//! It defines the [`CarmatchConfig`] struct, which holds the endpoints, embedding model,
//! search limits and storage location, and a [`load_config`] function to load the
//! configuration from a YAML file. Every section has defaults, so a file only needs to
//! name what it changes.
//!
//! # Examples
//!
//! ```no_run
//! use carmatch::config::load_config;
//!
//! let config = load_config("/path/to/config.yaml").unwrap();
//! println!("{:?}", config.search);
//! ```

use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::error::{MatchError, Result};

/// Which embedding implementation produces vectors.
///
/// Corpus and query vectors must come from the same backend and model, so this is a
/// deployment-wide choice rather than a per-call one.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackendKind {
    /// OpenAI-compatible `/embeddings` endpoint.
    #[default]
    Remote,
    /// Candle BERT model loaded from the Hugging Face hub.
    Local,
}

/// Embedding model settings.
///
/// `model` and `dimension` default per backend when the file leaves them out.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(from = "PartialEmbeddingConfig")]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackendKind,

    /// Model identifier sent to the backend and stamped on every stored vector.
    pub model: String,

    /// Fixed dimensionality of the model's output.
    pub dimension: usize,

    /// Request timeout for the remote backend.
    pub timeout_secs: u64,
}

impl EmbeddingConfig {
    /// Defaults for `backend`: `text-embedding-3-small` (1536) remote,
    /// `sentence-transformers/all-MiniLM-L6-v2` (384) local.
    pub fn for_backend(backend: EmbeddingBackendKind) -> Self {
        let (model, dimension) = match backend {
            EmbeddingBackendKind::Remote => ("text-embedding-3-small", 1536),
            EmbeddingBackendKind::Local => ("sentence-transformers/all-MiniLM-L6-v2", 384),
        };
        Self {
            backend,
            model: model.to_string(),
            dimension,
            timeout_secs: 30,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self::for_backend(EmbeddingBackendKind::default())
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct PartialEmbeddingConfig {
    backend: EmbeddingBackendKind,
    model: Option<String>,
    dimension: Option<usize>,
    timeout_secs: Option<u64>,
}

impl From<PartialEmbeddingConfig> for EmbeddingConfig {
    fn from(partial: PartialEmbeddingConfig) -> Self {
        let defaults = Self::for_backend(partial.backend);
        Self {
            backend: partial.backend,
            model: partial.model.unwrap_or(defaults.model),
            dimension: partial.dimension.unwrap_or(defaults.dimension),
            timeout_secs: partial.timeout_secs.unwrap_or(defaults.timeout_secs),
        }
    }
}

/// Streaming assistant endpoint settings.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct ChatConfig {
    /// Full URL of the streaming chat function.
    pub endpoint: String,

    /// Bearer token for the chat function. Empty means no `Authorization` header.
    pub api_key: String,

    /// Name the assistant introduces itself with.
    pub assistant_name: String,

    /// Time allowed for the backend to accept the request. The stream itself has no
    /// overall deadline.
    pub timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:54321/functions/v1/sales-assistant".to_string(),
            api_key: String::new(),
            assistant_name: "Assistente".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Similarity search limits.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct SearchConfig {
    /// Hard cap on results per query, whatever the caller asks for.
    pub max_results: usize,

    /// Result count used when the caller does not ask for one.
    pub default_results: usize,

    /// Cosine similarity below which a match is not worth showing.
    pub similarity_floor: f32,

    /// Token budget for the inventory block handed to the assistant.
    pub inventory_context_tokens: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_results: 10,
            default_results: 5,
            similarity_floor: 0.2,
            inventory_context_tokens: 1200,
        }
    }
}

/// Represents the application's configuration.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct CarmatchConfig {
    /// The API key used to authenticate embedding requests.
    pub api_key: String,

    /// The base URL of the OpenAI-compatible embedding API.
    pub api_base: String,

    pub embedding: EmbeddingConfig,

    pub chat: ChatConfig,

    pub search: SearchConfig,

    /// Vehicle database url (SQLite)
    pub vehicle_db_url: String,

    /// Optional prompts file; built-in Portuguese copy is used when absent.
    pub prompts_path: Option<String>,
}

impl Default for CarmatchConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: "https://api.openai.com/v1".to_string(),
            embedding: EmbeddingConfig::default(),
            chat: ChatConfig::default(),
            search: SearchConfig::default(),
            vehicle_db_url: "carmatch.db".to_string(),
            prompts_path: None,
        }
    }
}

impl CarmatchConfig {
    /// Reject settings that would make search or embedding meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimension == 0 {
            return Err(MatchError::Config(
                "embedding.dimension must be greater than zero".into(),
            ));
        }
        if self.embedding.model.trim().is_empty() {
            return Err(MatchError::Config("embedding.model is required".into()));
        }
        if self.search.max_results == 0 {
            return Err(MatchError::Config(
                "search.max_results must be greater than zero".into(),
            ));
        }
        if self.search.default_results > self.search.max_results {
            return Err(MatchError::Config(format!(
                "search.default_results ({}) exceeds search.max_results ({})",
                self.search.default_results, self.search.max_results
            )));
        }
        if !(-1.0..=1.0).contains(&self.search.similarity_floor) {
            return Err(MatchError::Config(
                "search.similarity_floor must be within [-1, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Loads the application's configuration from a YAML file and validates it.
///
/// # Errors
///
/// Returns an error when the file cannot be read, is not valid YAML for
/// [`CarmatchConfig`], or fails [`CarmatchConfig::validate`].
pub fn load_config(file: impl AsRef<Path>) -> Result<CarmatchConfig> {
    let file = file.as_ref();
    tracing::debug!("Loading config from {}", file.display());
    let content = fs::read_to_string(file)?;
    let config: CarmatchConfig = serde_yaml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}
