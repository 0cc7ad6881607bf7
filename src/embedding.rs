//! # Embeddings
//!
//! Turns text into dense vectors and vehicles into stored embeddings.
//!
//! - [`Embedder`] is the seam every backend implements. Corpus vectors (written by
//!   [`crate::sync`]) and query vectors (computed by [`crate::search`]) must come from
//!   the same `Embedder`, i.e. the same [`Embedder::model_id`] and
//!   [`Embedder::dimension`], or similarity scores are meaningless.
//! - [`HttpEmbedder`] calls an OpenAI-compatible `/embeddings` endpoint.
//! - [`LocalEmbedder`] runs `all-MiniLM-L6-v2` in-process with Candle.
//! - [`EmbeddingGenerator`] fetches a vehicle, renders its description with
//!   [`crate::vehicle::describe`] and embeds it. It never writes anything.
//!
//! Nothing here retries. A failed or rate-limited call surfaces as
//! [`MatchError::UpstreamUnavailable`] and the caller decides what to do.

use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use hf_hub::{Repo, RepoType, api::sync::Api};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokenizers::Tokenizer;
use tracing::debug;

use crate::{
    config::{CarmatchConfig, EmbeddingBackendKind},
    error::{MatchError, Result},
    vector_store::VehicleStore,
    vehicle::{StoredEmbedding, describe, description_digest},
};

/// A text embedding model.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier stamped on every vector this embedder produces.
    fn model_id(&self) -> &str;

    /// Fixed length of every vector this embedder produces.
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Build the embedder selected in the configuration.
pub fn build_embedder(config: &CarmatchConfig) -> Result<Arc<dyn Embedder>> {
    match config.embedding.backend {
        EmbeddingBackendKind::Remote => Ok(Arc::new(HttpEmbedder::new(
            &config.api_key,
            &config.api_base,
            &config.embedding.model,
            config.embedding.dimension,
            Duration::from_secs(config.embedding.timeout_secs),
        )?)),
        EmbeddingBackendKind::Local => Ok(Arc::new(LocalEmbedder::load(
            &config.embedding.model,
            config.embedding.dimension,
        )?)),
    }
}

/// Reject vectors that must never be stored or compared.
pub(crate) fn check_vector(vector: &[f32], expected: usize) -> Result<()> {
    if vector.is_empty() {
        return Err(MatchError::UpstreamUnavailable(
            "embedding backend returned an empty vector".into(),
        ));
    }
    if vector.len() != expected {
        return Err(MatchError::DimensionMismatch {
            expected,
            found: vector.len(),
        });
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(MatchError::UpstreamUnavailable(
            "embedding backend returned non-finite values".into(),
        ));
    }
    if vector.iter().all(|v| *v == 0.0) {
        return Err(MatchError::UpstreamUnavailable(
            "embedding backend returned a zero vector".into(),
        ));
    }
    Ok(())
}

// --- OpenAI-compatible HTTP backend ------------------------------------------------------------

/// Embeddings client for OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimension: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(
        api_key: &str,
        api_base: &str,
        model: &str,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self> {
        if model.trim().is_empty() {
            return Err(MatchError::Config("missing embedding model name".into()));
        }

        let mut headers = HeaderMap::new();
        if !api_key.trim().is_empty() {
            let auth = format!("Bearer {}", api_key.trim());
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth)
                    .map_err(|_| MatchError::Config("invalid embedding API key".into()))?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| MatchError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", api_base.trim_end_matches('/')),
            model: model.to_string(),
            dimension,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: text,
        };
        debug!(endpoint = %self.endpoint, chars = text.len(), "Requesting embedding");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| MatchError::UpstreamUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(MatchError::UpstreamUnavailable(format!(
                    "embeddings request failed ({status}): {body}"
                )));
            }
            return Err(MatchError::Upstream {
                status: status.as_u16(),
                detail: Some(body),
            });
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|e| {
            MatchError::UpstreamUnavailable(format!("failed to parse embedding response: {e}"))
        })?;
        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| {
                MatchError::UpstreamUnavailable("embedding response contained no data".into())
            })?;

        check_vector(&vector, self.dimension)?;
        Ok(vector)
    }
}

// --- Local Candle backend ----------------------------------------------------------------------

/// BERT sentence model plus tokenizer, loaded once and shared across calls.
struct SentenceModel {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl SentenceModel {
    fn load(model_id: &str) -> Result<Self> {
        let device = Device::Cpu;
        let repo = Repo::with_revision(model_id.to_string(), RepoType::Model, "main".to_string());
        let api = Api::new().map_err(|e| MatchError::UpstreamUnavailable(e.to_string()))?;
        let api_repo = api.repo(repo);

        let fetch = |name: &str| {
            api_repo
                .get(name)
                .map_err(|e| MatchError::UpstreamUnavailable(format!("{model_id}/{name}: {e}")))
        };
        let config_filename = fetch("config.json")?;
        let tokenizer_filename = fetch("tokenizer.json")?;
        let weights_filename = fetch("model.safetensors")?;

        let config: Config = serde_json::from_str(&std::fs::read_to_string(config_filename)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| MatchError::Config(format!("failed to load tokenizer: {e}")))?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_filename], DTYPE, &device)
                .map_err(candle_error)?
        };
        let model = BertModel::load(vb, &config).map_err(candle_error)?;

        Ok(Self {
            model,
            tokenizer,
            device,
        })
    }

    /// Tokenize, run the encoder, mean-pool over the attention mask and L2-normalize.
    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| MatchError::UpstreamUnavailable(format!("tokenization error: {e}")))?;

        let token_ids = Tensor::new(tokens.get_ids(), &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(candle_error)?;
        let token_type_ids = Tensor::new(tokens.get_type_ids(), &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(candle_error)?;

        let output = self
            .model
            .forward(&token_ids, &token_type_ids, None)
            .map_err(candle_error)?;

        self.pool_and_normalize(&output, tokens.get_attention_mask())
            .map_err(candle_error)
    }

    fn pool_and_normalize(
        &self,
        embeddings: &Tensor,
        attention_mask: &[u32],
    ) -> candle_core::Result<Vec<f32>> {
        // [1, seq_len, 1] so the mask broadcasts over the hidden dimension
        let mask = Tensor::new(attention_mask, &self.device)?
            .to_dtype(DType::F32)?
            .unsqueeze(0)?
            .unsqueeze(2)?;

        let sum = embeddings.broadcast_mul(&mask)?.sum(1)?;
        let count = mask.sum(1)?.clamp(1f32, f32::INFINITY)?;
        let mean = sum.broadcast_div(&count)?.squeeze(0)?;

        let norm = mean.sqr()?.sum_all()?.sqrt()?;
        mean.broadcast_div(&norm)?.to_vec1::<f32>()
    }
}

fn candle_error(err: candle_core::Error) -> MatchError {
    MatchError::UpstreamUnavailable(format!("local embedding model: {err}"))
}

/// In-process sentence embedder (default `sentence-transformers/all-MiniLM-L6-v2`, 384-d).
#[derive(Clone)]
pub struct LocalEmbedder {
    model: Arc<SentenceModel>,
    model_id: String,
    dimension: usize,
}

impl LocalEmbedder {
    /// Download (or reuse the hub cache of) `model_id` and load it on the CPU.
    pub fn load(model_id: &str, dimension: usize) -> Result<Self> {
        let model = SentenceModel::load(model_id)?;
        Ok(Self {
            model: Arc::new(model),
            model_id: model_id.to_string(),
            dimension,
        })
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let model = Arc::clone(&self.model);
        let text = text.to_string();
        let vector = tokio::task::spawn_blocking(move || model.encode(&text))
            .await
            .map_err(|e| MatchError::UpstreamUnavailable(format!("embedding task failed: {e}")))??;
        check_vector(&vector, self.dimension)?;
        Ok(vector)
    }
}

// --- Vehicle embedding generation --------------------------------------------------------------

/// A freshly computed embedding, not yet written anywhere.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedEmbedding {
    pub vehicle_id: String,
    /// The exact text that was embedded.
    pub text: String,
    pub embedding: StoredEmbedding,
}

/// Renders vehicles into text and embeds them.
#[derive(Clone)]
pub struct EmbeddingGenerator {
    embedder: Arc<dyn Embedder>,
}

impl EmbeddingGenerator {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Fetch the vehicle's current attributes and embed its description.
    ///
    /// # Errors
    /// - [`MatchError::NotFound`] when the vehicle does not exist.
    /// - [`MatchError::UpstreamUnavailable`] / [`MatchError::Upstream`] when the
    ///   embedding backend fails.
    /// - [`MatchError::DimensionMismatch`] when the backend's output does not have the
    ///   configured length.
    pub async fn generate(
        &self,
        store: &dyn VehicleStore,
        vehicle_id: &str,
    ) -> Result<GeneratedEmbedding> {
        let vehicle = store.fetch_attributes(vehicle_id).await?;
        let text = describe(&vehicle);
        self.embed_description(vehicle_id, text).await
    }

    /// Embed an already rendered description.
    pub async fn embed_description(
        &self,
        vehicle_id: &str,
        text: String,
    ) -> Result<GeneratedEmbedding> {
        let vector = self.embedder.embed(&text).await?;
        check_vector(&vector, self.embedder.dimension())?;

        Ok(GeneratedEmbedding {
            vehicle_id: vehicle_id.to_string(),
            embedding: StoredEmbedding {
                vector,
                model: self.embedder.model_id().to_string(),
                digest: description_digest(&text),
            },
            text,
        })
    }
}
