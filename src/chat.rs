//! # Chat backend
//!
//! [`ChatBackend`] opens a streamed completion for a [`ChatRequest`] and hands back the
//! raw body as byte chunks; parsing them is [`crate::stream`]'s job. [`HttpChatBackend`]
//! talks to the hosted sales-assistant function over HTTP.
//!
//! Request body:
//!
//! ```json
//! {
//!   "messages": [{"role": "system", "content": "..."}, {"role": "user", "content": "..."}],
//!   "session_id": "01J...",
//!   "display_name": "Ana",
//!   "email": "ana@example.com",
//!   "stream": true
//! }
//! ```

use async_openai::types::chat::ChatCompletionRequestMessage;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::{
    config::ChatConfig,
    error::{MatchError, Result},
};

/// Byte chunks of a streamed reply, in arrival order.
pub type ChunkStream = BoxStream<'static, Result<Bytes>>;

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatCompletionRequestMessage>,
    pub session_id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub stream: bool,
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Start a streamed reply.
    ///
    /// # Errors
    /// - [`MatchError::Upstream`] when the backend answers with a non-success status;
    ///   its error payload, if any, is the detail.
    /// - [`MatchError::UpstreamUnavailable`] when it cannot be reached.
    /// - [`MatchError::StreamUnavailable`] when it answers without a body.
    async fn open_stream(&self, request: &ChatRequest) -> Result<ChunkStream>;
}

#[derive(Clone)]
pub struct HttpChatBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpChatBackend {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(MatchError::Config("missing chat endpoint".into()));
        }

        let mut headers = HeaderMap::new();
        if !config.api_key.trim().is_empty() {
            let auth = format!("Bearer {}", config.api_key.trim());
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth)
                    .map_err(|_| MatchError::Config("invalid chat API key".into()))?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

        // connect timeout only: a total timeout would cut long replies mid-stream
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| MatchError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim().to_string(),
        })
    }
}

/// Pull a readable message out of an error body: `{"error": "..."}`,
/// `{"error": {"message": "..."}}`, or the raw text.
fn error_detail(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let from_json = parsed.as_ref().and_then(|value| {
        let error = value.get("error")?;
        match error {
            serde_json::Value::String(message) => Some(message.clone()),
            other => other
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string),
        }
    });
    Some(from_json.unwrap_or_else(|| body.to_string()))
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn open_stream(&self, request: &ChatRequest) -> Result<ChunkStream> {
        debug!(
            session_id = %request.session_id,
            messages = request.messages.len(),
            "Opening chat stream"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MatchError::Upstream {
                status: status.as_u16(),
                detail: error_detail(&body),
            });
        }

        if status == reqwest::StatusCode::NO_CONTENT || response.content_length() == Some(0) {
            return Err(MatchError::StreamUnavailable(
                "chat backend returned no body".into(),
            ));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| MatchError::StreamUnavailable(e.to_string())))
            .boxed())
    }
}
