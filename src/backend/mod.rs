pub mod http;
pub mod registry;

#[cfg(test)]
pub mod scripted;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Compute hardware class a backend runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hardware {
    Npu,
    Igpu,
    Nvidia,
    Cpu,
}

impl Hardware {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hardware::Npu => "npu",
            Hardware::Igpu => "igpu",
            Hardware::Nvidia => "nvidia",
            Hardware::Cpu => "cpu",
        }
    }
}

impl std::fmt::Display for Hardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The inference operations a request can ask for. Routing filters on these
/// via [`CapabilitySet::supports`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Generate,
    Stream,
    Embed,
    AudioToText,
    TextToAudio,
    ImageToText,
    TextToImage,
    VideoToText,
    TextToVideo,
}

/// Static capability flags of a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySet {
    #[serde(default = "default_true")]
    pub generate: bool,
    #[serde(default = "default_true")]
    pub stream: bool,
    #[serde(default)]
    pub embed: bool,
    #[serde(default)]
    pub audio_to_text: bool,
    #[serde(default)]
    pub text_to_audio: bool,
    #[serde(default)]
    pub image_to_text: bool,
    #[serde(default)]
    pub text_to_image: bool,
    #[serde(default)]
    pub video_to_text: bool,
    #[serde(default)]
    pub text_to_video: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self {
            generate: true,
            stream: true,
            embed: false,
            audio_to_text: false,
            text_to_audio: false,
            image_to_text: false,
            text_to_image: false,
            video_to_text: false,
            text_to_video: false,
        }
    }
}

impl CapabilitySet {
    pub fn supports(&self, op: Operation) -> bool {
        match op {
            Operation::Generate => self.generate,
            Operation::Stream => self.stream,
            Operation::Embed => self.embed,
            Operation::AudioToText => self.audio_to_text,
            Operation::TextToAudio => self.text_to_audio,
            Operation::ImageToText => self.image_to_text,
            Operation::TextToImage => self.text_to_image,
            Operation::VideoToText => self.video_to_text,
            Operation::TextToVideo => self.text_to_video,
        }
    }
}

/// Immutable identity and cost profile of a backend, registered once at
/// startup. Mutable health lives in the registry, rolling metrics behind
/// the [`Backend`] trait.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSpec {
    pub id: String,
    /// Wire dialect tag, e.g. "ollama".
    #[serde(default = "default_backend_type")]
    pub backend_type: String,
    pub name: String,
    pub hardware: Hardware,
    #[serde(default)]
    pub base_url: String,
    /// Largest model this backend can hold; 0 means unlimited.
    #[serde(default)]
    pub max_model_size_gb: f64,
    /// Model-name patterns this backend serves. `*` suffix is a prefix
    /// match; bare `*` matches everything; anything else is exact.
    #[serde(default)]
    pub supported_patterns: Vec<String>,
    #[serde(default)]
    pub preferred_models: Vec<String>,
    #[serde(default)]
    pub capabilities: CapabilitySet,
    pub power_watts: f64,
    /// Baseline latency estimate, refined at runtime by the EMA.
    pub avg_latency_ms: f64,
    /// Small-integer operator preference; higher scores better.
    #[serde(default)]
    pub priority: i32,
}

fn default_backend_type() -> String {
    "ollama".to_string()
}

impl BackendSpec {
    /// Pattern + size check for a model name.
    pub fn accepts_model(&self, model: &str) -> bool {
        if self.max_model_size_gb > 0.0 {
            if let Some(size) = estimate_model_size_gb(model) {
                if size > self.max_model_size_gb {
                    return false;
                }
            }
        }

        if self.preferred_models.iter().any(|m| m == model) {
            return true;
        }
        if self.supported_patterns.is_empty() {
            return true;
        }
        self.supported_patterns.iter().any(|p| {
            if p == "*" {
                true
            } else if let Some(prefix) = p.strip_suffix('*') {
                model.starts_with(prefix)
            } else {
                p == model
            }
        })
    }
}

/// Estimate the on-disk size of a model from its parameter-count suffix
/// (`llama3:8b`, `qwen2-7b`). Assumes ~0.6 GB per billion parameters at
/// common quantizations. Returns None when the name carries no count.
pub fn estimate_model_size_gb(model: &str) -> Option<f64> {
    let lower = model.to_ascii_lowercase();
    for part in lower.split(|c: char| c == ':' || c == '-' || c == '_') {
        if let Some(num) = part.strip_suffix('b') {
            if let Ok(billions) = num.parse::<f64>() {
                if billions > 0.0 {
                    return Some(billions * 0.6);
                }
            }
        }
    }
    None
}

/// One chat turn, OpenAI role vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Canonical generation request handed to a backend. Either `prompt` or
/// `messages` is populated, never both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ChatMessage>,
    /// Backend-native sampler options, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    pub total_tokens: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedRequest {
    pub model: String,
    pub input: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedResponse {
    pub embeddings: Vec<Vec<f32>>,
}

/// Request for the media operations (audio, image, video). `data` carries
/// raw media bytes for analysis ops; `text` carries the prompt/script for
/// synthesis ops.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    pub duration_ms: u64,
}

/// One token event read off a backend stream, before the datapath
/// canonicalizes it into a client-facing chunk.
#[derive(Debug, Clone, Default)]
pub struct RawChunk {
    pub token: String,
    pub done: bool,
    /// Populated on the terminal chunk when the backend reports it.
    pub total_tokens: Option<u32>,
}

pub type TokenStream = BoxStream<'static, Result<RawChunk, BackendError>>;

/// Rolling per-backend metrics. `avg_latency_ms` is an EMA so one slow
/// request cannot permanently skew routing.
#[derive(Debug, Clone, Serialize)]
pub struct BackendMetrics {
    pub request_count: u64,
    pub success_count: u64,
    pub avg_latency_ms: f64,
}

impl BackendMetrics {
    /// EMA smoothing factor for latency updates.
    const ALPHA: f64 = 0.2;

    pub fn new(baseline_latency_ms: f64) -> Self {
        Self {
            request_count: 0,
            success_count: 0,
            avg_latency_ms: baseline_latency_ms,
        }
    }

    pub fn record(&mut self, latency: Duration, success: bool) {
        self.request_count += 1;
        if success {
            self.success_count += 1;
        }
        let sample = latency.as_secs_f64() * 1000.0;
        if self.request_count == 1 {
            self.avg_latency_ms = sample;
        } else {
            self.avg_latency_ms = Self::ALPHA * sample + (1.0 - Self::ALPHA) * self.avg_latency_ms;
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),

    #[error("backend returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("failed to decode backend response: {0}")]
    Decode(String),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("backend request timed out")]
    Timeout,
}

/// The contract every backend adapter implements. The core depends only on
/// this trait; media operations default to `Unsupported` so a text-only
/// adapter stays small.
#[async_trait]
pub trait Backend: Send + Sync {
    fn spec(&self) -> &BackendSpec;

    fn supports_model(&self, model: &str) -> bool {
        self.spec().accepts_model(model)
    }

    async fn health_check(&self) -> Result<(), BackendError>;

    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse, BackendError>;

    async fn generate_stream(&self, req: GenerateRequest) -> Result<TokenStream, BackendError>;

    async fn embed(&self, _req: EmbedRequest) -> Result<EmbedResponse, BackendError> {
        Err(BackendError::Unsupported("embed"))
    }

    async fn transcribe_audio(&self, _req: MediaRequest) -> Result<MediaResponse, BackendError> {
        Err(BackendError::Unsupported("audio_to_text"))
    }

    async fn transcribe_audio_stream(&self, _req: MediaRequest) -> Result<TokenStream, BackendError> {
        Err(BackendError::Unsupported("audio_to_text_stream"))
    }

    async fn synthesize_speech(&self, _req: MediaRequest) -> Result<MediaResponse, BackendError> {
        Err(BackendError::Unsupported("text_to_audio"))
    }

    async fn synthesize_speech_stream(
        &self,
        _req: MediaRequest,
    ) -> Result<TokenStream, BackendError> {
        Err(BackendError::Unsupported("text_to_audio_stream"))
    }

    async fn analyze_image(&self, _req: MediaRequest) -> Result<MediaResponse, BackendError> {
        Err(BackendError::Unsupported("image_to_text"))
    }

    async fn generate_image(&self, _req: MediaRequest) -> Result<MediaResponse, BackendError> {
        Err(BackendError::Unsupported("text_to_image"))
    }

    async fn generate_image_stream(&self, _req: MediaRequest) -> Result<TokenStream, BackendError> {
        Err(BackendError::Unsupported("text_to_image_stream"))
    }

    async fn analyze_video(&self, _req: MediaRequest) -> Result<MediaResponse, BackendError> {
        Err(BackendError::Unsupported("video_to_text"))
    }

    async fn analyze_video_stream(&self, _req: MediaRequest) -> Result<TokenStream, BackendError> {
        Err(BackendError::Unsupported("video_to_text_stream"))
    }

    async fn generate_video(&self, _req: MediaRequest) -> Result<MediaResponse, BackendError> {
        Err(BackendError::Unsupported("text_to_video"))
    }

    async fn generate_video_stream(&self, _req: MediaRequest) -> Result<TokenStream, BackendError> {
        Err(BackendError::Unsupported("text_to_video_stream"))
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError>;

    fn get_metrics(&self) -> BackendMetrics;

    /// Feed one request outcome into the rolling metrics.
    fn record_outcome(&self, latency: Duration, success: bool);
}
