//! HTTP backend adapter for the Ollama-style NDJSON inference API.
//!
//! Each backend daemon exposes `/api/generate`, `/api/chat`, `/api/embed`
//! and `/api/tags`. Streaming responses arrive as one JSON object per line;
//! the adapter splits lines and hands token events to the datapath.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;

use super::{
    Backend, BackendError, BackendMetrics, BackendSpec, EmbedRequest, EmbedResponse,
    GenerateRequest, GenerateResponse, MediaRequest, MediaResponse, RawChunk, TokenStream,
};

/// Initial line-buffer capacity. Kept small on purpose: larger buffers
/// increase worst-case first-chunk latency.
const LINE_BUF_CAPACITY: usize = 4096;

/// Idle connections kept per backend.
const POOL_MAX_IDLE: usize = 10;

/// Overall deadline for non-streaming calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Deadline for health probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct HttpBackend {
    spec: BackendSpec,
    client: Client,
    metrics: RwLock<BackendMetrics>,
}

impl HttpBackend {
    pub fn new(spec: BackendSpec) -> Result<Self, BackendError> {
        // Connection reuse across requests to the same daemon: pooled
        // client, HTTP/2 keep-alive, fast connection failure.
        let client = Client::builder()
            .pool_max_idle_per_host(POOL_MAX_IDLE)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(5))
            .http2_keep_alive_interval(Duration::from_secs(30))
            .http2_keep_alive_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BackendError::Network(e.to_string()))?;

        let metrics = RwLock::new(BackendMetrics::new(spec.avg_latency_ms));

        Ok(Self {
            spec,
            client,
            metrics,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.spec.base_url.trim_end_matches('/'), path)
    }

    /// Generation goes to `/api/chat` when messages are present, otherwise
    /// `/api/generate`.
    fn generate_endpoint(&self, req: &GenerateRequest) -> (&'static str, serde_json::Value) {
        if req.messages.is_empty() {
            (
                "/api/generate",
                serde_json::json!({
                    "model": req.model,
                    "prompt": req.prompt.clone().unwrap_or_default(),
                    "options": req.options,
                }),
            )
        } else {
            (
                "/api/chat",
                serde_json::json!({
                    "model": req.model,
                    "messages": req.messages,
                    "options": req.options,
                }),
            )
        }
    }

    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, BackendError> {
        let response = self
            .client
            .post(self.url(path))
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout
                } else {
                    BackendError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(BackendError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

/// Incremental NDJSON line splitter over a byte stream.
struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(LINE_BUF_CAPACITY),
        }
    }

    /// Append bytes, return every complete line. A trailing fragment stays
    /// buffered until its newline arrives (the backend newline-terminates
    /// every chunk).
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }
}

#[derive(Deserialize)]
struct WireMessage {
    content: String,
}

/// One NDJSON object from the backend, generate- or chat-shaped.
#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    total_duration: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

impl WireChunk {
    fn token(&self) -> String {
        if let Some(r) = &self.response {
            r.clone()
        } else if let Some(m) = &self.message {
            m.content.clone()
        } else {
            String::new()
        }
    }
}

fn parse_line(line: String) -> Result<RawChunk, BackendError> {
    let chunk: WireChunk =
        serde_json::from_str(&line).map_err(|e| BackendError::Decode(e.to_string()))?;
    if let Some(message) = chunk.error {
        return Err(BackendError::Api {
            status: 500,
            message,
        });
    }
    Ok(RawChunk {
        token: chunk.token(),
        done: chunk.done,
        total_tokens: chunk.eval_count,
    })
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Deserialize)]
struct WireEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl Backend for HttpBackend {
    fn spec(&self) -> &BackendSpec {
        &self.spec
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        let response = self
            .client
            .get(self.url("/"))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout
                } else {
                    BackendError::Network(e.to_string())
                }
            })?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Api {
                status: response.status().as_u16(),
                message: "health probe failed".into(),
            })
        }
    }

    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse, BackendError> {
        let started = Instant::now();
        let (path, mut body) = self.generate_endpoint(&req);
        body["stream"] = serde_json::Value::Bool(false);

        let response = self.post_json(path, body).await?;
        let chunk: WireChunk = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        if let Some(message) = chunk.error {
            return Err(BackendError::Api {
                status: 500,
                message,
            });
        }

        Ok(GenerateResponse {
            text: chunk.token(),
            total_tokens: chunk.eval_count.unwrap_or(0),
            duration_ms: chunk
                .total_duration
                .map(|ns| ns / 1_000_000)
                .unwrap_or_else(|| started.elapsed().as_millis() as u64),
        })
    }

    async fn generate_stream(&self, req: GenerateRequest) -> Result<TokenStream, BackendError> {
        let (path, mut body) = self.generate_endpoint(&req);
        body["stream"] = serde_json::Value::Bool(true);

        // No overall timeout here: the datapath owns stream deadlines.
        let response = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(BackendError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let stream = response
            .bytes_stream()
            .scan(LineSplitter::new(), |splitter, item| {
                let results: Vec<Result<RawChunk, BackendError>> = match item {
                    Ok(bytes) => splitter.push(&bytes).into_iter().map(parse_line).collect(),
                    Err(e) => vec![Err(BackendError::Network(e.to_string()))],
                };
                futures::future::ready(Some(futures::stream::iter(results)))
            })
            .flatten();

        Ok(Box::pin(stream))
    }

    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, BackendError> {
        let body = serde_json::json!({
            "model": req.model,
            "input": req.input,
        });
        let response = self.post_json("/api/embed", body).await?;
        let wire: WireEmbedResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(EmbedResponse {
            embeddings: wire.embeddings,
        })
    }

    async fn analyze_image(&self, req: MediaRequest) -> Result<MediaResponse, BackendError> {
        let started = Instant::now();
        let data = req
            .data
            .ok_or(BackendError::Unsupported("image_to_text without image data"))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);

        let body = serde_json::json!({
            "model": req.model,
            "prompt": req.text.unwrap_or_else(|| "Describe this image.".into()),
            "images": [encoded],
            "stream": false,
        });
        let response = self.post_json("/api/generate", body).await?;
        let chunk: WireChunk = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        Ok(MediaResponse {
            text: Some(chunk.token()),
            data: None,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let response = self
            .client
            .get(self.url("/api/tags"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    fn get_metrics(&self) -> BackendMetrics {
        self.metrics.read().expect("metrics lock poisoned").clone()
    }

    fn record_outcome(&self, latency: Duration, success: bool) {
        self.metrics
            .write()
            .expect("metrics lock poisoned")
            .record(latency, success);
    }
}
