//! LLM client trait and the Ollama-protocol implementation.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::{Error, Result};

use super::types::{
    EmbedRequest, EmbedResponse, GenerateRequest, GenerateResponse, ModelInfo, StreamChunk,
    TokenUsage,
};

/// A stream of partial generation payloads.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// LLM client for generation and embeddings.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete a prompt in one shot.
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse>;

    /// Complete a prompt as a stream of partial payloads terminated by a
    /// chunk with `done = true`.
    async fn generate_stream(&self, request: GenerateRequest) -> Result<ChunkStream>;

    /// Create embeddings for texts, order-preserving.
    async fn embed(&self, request: EmbedRequest) -> Result<EmbedResponse>;

    /// List models available on the server.
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;

    /// Provider label for traces and errors.
    fn provider(&self) -> &str;
}

/// Retry policy for transient transport failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt as i32);
        let millis = (self.base_delay_ms as f64 * factor).round().max(0.0) as u64;
        Duration::from_millis(millis)
    }

    /// Run `op` up to `max_attempts` times, backing off between transient
    /// failures. Deterministic errors surface immediately.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last = None;
        for attempt in 0..attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "transient LLM failure, retrying");
                    sleep(delay).await;
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| Error::Internal("retry loop exhausted".into())))
    }
}

fn build_http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))
}

/// Client for an Ollama-protocol LLM server.
///
/// Endpoints: `POST /api/generate`, `POST /api/embed`, `GET /api/tags`.
/// Streaming responses are newline-delimited JSON payloads terminated by a
/// payload with `"done": true`.
pub struct OllamaClient {
    config: LlmConfig,
    retry: RetryPolicy,
    http: Client,
}

impl OllamaClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let http = build_http_client(config.timeout_secs)?;
        let retry = RetryPolicy {
            max_attempts: config.max_retries.max(1),
            ..RetryPolicy::default()
        };
        Ok(Self {
            config,
            retry,
            http,
        })
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.config.base_url.trim_end_matches('/'))
    }

    fn embed_url(&self) -> String {
        format!("{}/api/embed", self.config.base_url.trim_end_matches('/'))
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.config.base_url.trim_end_matches('/'))
    }

    fn wire_request(&self, request: &GenerateRequest, stream: bool) -> WireGenerateRequest {
        WireGenerateRequest {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.config.model.clone()),
            prompt: request.prompt.clone(),
            system: request.system.clone(),
            stream,
            format: request.format.clone(),
            options: WireOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        }
    }

    /// Classify an HTTP failure: 4xx is a deterministic API error, anything
    /// else is transient and retried.
    fn status_error(&self, status: reqwest::StatusCode, body: String) -> Error {
        let message = serde_json::from_str::<WireError>(&body)
            .map(|e| e.error)
            .unwrap_or(body);
        if status.is_client_error() {
            Error::llm_api(&self.config.provider, format!("{}: {}", status, message))
        } else {
            Error::LlmTransport(format!("{}: {}", status, message))
        }
    }

    async fn post_json<B: Serialize>(&self, url: &str, body: &B) -> Result<String> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::LlmTransport(format!("request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::LlmTransport(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(self.status_error(status, text));
        }
        Ok(text)
    }
}

// Ollama wire types

#[derive(Debug, Serialize)]
struct WireGenerateRequest {
    model: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<Value>,
    options: WireOptions,
}

#[derive(Debug, Serialize)]
struct WireOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireGenerateResponse {
    model: String,
    response: String,
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Serialize)]
struct WireEmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireEmbedResponse {
    model: String,
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct WireTagsResponse {
    models: Vec<WireModel>,
}

#[derive(Debug, Deserialize)]
struct WireModel {
    name: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    modified_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    error: String,
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        let url = self.generate_url();
        let wire = self.wire_request(&request, false);

        let body = self.retry.run(|| self.post_json(&url, &wire)).await?;

        let parsed: WireGenerateResponse = serde_json::from_str(&body)
            .map_err(|e| Error::LlmTransport(format!("malformed generate response: {}", e)))?;

        debug!(model = %parsed.model, chars = parsed.response.len(), "generate complete");
        Ok(GenerateResponse {
            text: parsed.response,
            model: parsed.model,
            usage: TokenUsage {
                prompt_tokens: parsed.prompt_eval_count.unwrap_or(0),
                completion_tokens: parsed.eval_count.unwrap_or(0),
            },
        })
    }

    async fn generate_stream(&self, request: GenerateRequest) -> Result<ChunkStream> {
        let url = self.generate_url();
        let wire = self.wire_request(&request, true);

        let response = self
            .http
            .post(&url)
            .json(&wire)
            .send()
            .await
            .map_err(|e| Error::LlmTransport(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.status_error(status, body));
        }

        // Newline-delimited JSON; a network chunk may carry a partial line,
        // so carry the tail across chunks.
        let stream = response
            .bytes_stream()
            .map(|item| item.map_err(|e| Error::LlmTransport(format!("stream error: {}", e))));

        let parsed = futures::stream::unfold(
            (Box::pin(stream), String::new(), false),
            |(mut inner, mut buffer, finished)| async move {
                if finished {
                    return None;
                }
                loop {
                    if let Some(pos) = buffer.find('\n') {
                        let line: String = buffer.drain(..=pos).collect();
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        return match serde_json::from_str::<WireGenerateResponse>(line) {
                            Ok(payload) => {
                                let chunk = StreamChunk {
                                    text: payload.response,
                                    done: payload.done,
                                };
                                let finished = chunk.done;
                                Some((Ok(chunk), (inner, buffer, finished)))
                            }
                            Err(e) => Some((
                                Err(Error::LlmTransport(format!(
                                    "malformed stream payload: {}",
                                    e
                                ))),
                                (inner, buffer, true),
                            )),
                        };
                    }
                    match inner.next().await {
                        Some(Ok(bytes)) => {
                            buffer.push_str(&String::from_utf8_lossy(&bytes));
                        }
                        Some(Err(e)) => return Some((Err(e), (inner, buffer, true))),
                        None => return None,
                    }
                }
            },
        );

        Ok(Box::pin(parsed))
    }

    async fn embed(&self, request: EmbedRequest) -> Result<EmbedResponse> {
        if request.texts.is_empty() {
            return Err(Error::validation("texts", "must not be empty"));
        }
        let url = self.embed_url();
        let wire = WireEmbedRequest {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.config.embed_model.clone()),
            input: request.texts.clone(),
        };

        let body = self.retry.run(|| self.post_json(&url, &wire)).await?;

        let parsed: WireEmbedResponse = serde_json::from_str(&body)
            .map_err(|e| Error::LlmTransport(format!("malformed embed response: {}", e)))?;

        if parsed.embeddings.len() != request.texts.len() {
            return Err(Error::LlmTransport(format!(
                "embed count mismatch: sent {}, got {}",
                request.texts.len(),
                parsed.embeddings.len()
            )));
        }

        Ok(EmbedResponse {
            embeddings: parsed.embeddings,
            model: parsed.model,
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = self.tags_url();
        let body = self
            .retry
            .run(|| async {
                let response = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| Error::LlmTransport(format!("request failed: {}", e)))?;
                let status = response.status();
                let text = response
                    .text()
                    .await
                    .map_err(|e| Error::LlmTransport(format!("failed to read response: {}", e)))?;
                if !status.is_success() {
                    return Err(self.status_error(status, text));
                }
                Ok(text)
            })
            .await?;

        let parsed: WireTagsResponse = serde_json::from_str(&body)
            .map_err(|e| Error::LlmTransport(format!("malformed tags response: {}", e)))?;

        Ok(parsed
            .models
            .into_iter()
            .map(|m| ModelInfo {
                name: m.name,
                size_bytes: m.size,
                modified_at: m.modified_at,
            })
            .collect())
    }

    fn provider(&self) -> &str {
        &self.config.provider
    }
}

/// Wrapper routing every call through the resource manager's LLM gate,
/// bounding concurrent in-flight requests.
pub struct GatedClient {
    inner: std::sync::Arc<dyn LlmClient>,
    gate: crate::resources::Pool<()>,
}

impl GatedClient {
    pub fn new(inner: std::sync::Arc<dyn LlmClient>, gate: crate::resources::Pool<()>) -> Self {
        Self { inner, gate }
    }
}

#[async_trait]
impl LlmClient for GatedClient {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        let _handle = self.gate.acquire().await?;
        self.inner.generate(request).await
    }

    async fn generate_stream(&self, request: GenerateRequest) -> Result<ChunkStream> {
        let handle = self.gate.acquire().await?;
        let stream = self.inner.generate_stream(request).await?;
        // The guard rides the stream so the slot stays occupied until the
        // consumer drops it.
        Ok(Box::pin(stream.map(move |chunk| {
            let _held = &handle;
            chunk
        })))
    }

    async fn embed(&self, request: EmbedRequest) -> Result<EmbedResponse> {
        let _handle = self.gate.acquire().await?;
        self.inner.embed(request).await
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let _handle = self.gate.acquire().await?;
        self.inner.list_models().await
    }

    fn provider(&self) -> &str {
        self.inner.provider()
    }
}
