//! Scripted backend test double: deterministic token streams, failure
//! injection at each datapath suspension point, shaped latency.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use super::{
    Backend, BackendError, BackendMetrics, BackendSpec, CapabilitySet, EmbedRequest,
    EmbedResponse, GenerateRequest, GenerateResponse, Hardware, MediaRequest, MediaResponse,
    RawChunk, TokenStream,
};

/// Where a scripted stream should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// `generate_stream` itself errors.
    Open,
    /// The first read off the stream errors.
    FirstRead,
    /// The stream errors after yielding this many tokens.
    MidStream(usize),
}

pub struct ScriptedBackend {
    spec: BackendSpec,
    tokens: Vec<String>,
    token_delay: Duration,
    fail_stream_at: Option<FailPoint>,
    fail_generate: bool,
    fail_health: bool,
    metrics: RwLock<BackendMetrics>,
}

impl ScriptedBackend {
    pub fn named(id: &str) -> Self {
        let spec = BackendSpec {
            id: id.to_string(),
            backend_type: "scripted".into(),
            name: format!("scripted-{id}"),
            hardware: Hardware::Cpu,
            base_url: String::new(),
            max_model_size_gb: 0.0,
            supported_patterns: vec![],
            preferred_models: vec![],
            capabilities: CapabilitySet {
                generate: true,
                stream: true,
                embed: true,
                audio_to_text: true,
                text_to_audio: true,
                image_to_text: true,
                text_to_image: true,
                video_to_text: true,
                text_to_video: true,
            },
            power_watts: 10.0,
            avg_latency_ms: 100.0,
            priority: 1,
        };
        Self {
            metrics: RwLock::new(BackendMetrics::new(spec.avg_latency_ms)),
            spec,
            tokens: vec!["hello".into(), " world".into()],
            token_delay: Duration::ZERO,
            fail_stream_at: None,
            fail_generate: false,
            fail_health: false,
        }
    }

    pub fn with_hardware(mut self, hw: Hardware) -> Self {
        self.spec.hardware = hw;
        self
    }

    pub fn with_power(mut self, watts: f64) -> Self {
        self.spec.power_watts = watts;
        self
    }

    pub fn with_latency(mut self, ms: f64) -> Self {
        self.spec.avg_latency_ms = ms;
        *self.metrics.write().unwrap() = BackendMetrics::new(ms);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.spec.priority = priority;
        self
    }

    pub fn with_capabilities(mut self, caps: CapabilitySet) -> Self {
        self.spec.capabilities = caps;
        self
    }

    pub fn with_patterns(mut self, patterns: &[&str]) -> Self {
        self.spec.supported_patterns = patterns.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_tokens(mut self, tokens: &[&str]) -> Self {
        self.tokens = tokens.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn failing_stream_at(mut self, point: FailPoint) -> Self {
        self.fail_stream_at = Some(point);
        self
    }

    pub fn failing_generate(mut self) -> Self {
        self.fail_generate = true;
        self
    }

    pub fn failing_health(mut self) -> Self {
        self.fail_health = true;
        self
    }

    fn script(&self) -> Vec<Result<RawChunk, BackendError>> {
        let mut script: Vec<Result<RawChunk, BackendError>> = Vec::new();
        let cut = match self.fail_stream_at {
            Some(FailPoint::FirstRead) => Some(0),
            Some(FailPoint::MidStream(n)) => Some(n),
            _ => None,
        };

        for (i, token) in self.tokens.iter().enumerate() {
            if cut == Some(i) {
                script.push(Err(BackendError::Network("scripted stream failure".into())));
                return script;
            }
            script.push(Ok(RawChunk {
                token: token.clone(),
                done: false,
                total_tokens: None,
            }));
        }
        if cut == Some(self.tokens.len()) {
            script.push(Err(BackendError::Network("scripted stream failure".into())));
            return script;
        }
        script.push(Ok(RawChunk {
            token: String::new(),
            done: true,
            total_tokens: Some(self.tokens.len() as u32),
        }));
        script
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn spec(&self) -> &BackendSpec {
        &self.spec
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        if self.fail_health {
            Err(BackendError::Network("scripted health failure".into()))
        } else {
            Ok(())
        }
    }

    async fn generate(&self, _req: GenerateRequest) -> Result<GenerateResponse, BackendError> {
        if self.fail_generate {
            return Err(BackendError::Api {
                status: 500,
                message: "scripted generate failure".into(),
            });
        }
        if !self.token_delay.is_zero() {
            tokio::time::sleep(self.token_delay).await;
        }
        Ok(GenerateResponse {
            text: self.tokens.concat(),
            total_tokens: self.tokens.len() as u32,
            duration_ms: self.token_delay.as_millis() as u64,
        })
    }

    async fn generate_stream(&self, _req: GenerateRequest) -> Result<TokenStream, BackendError> {
        if self.fail_stream_at == Some(FailPoint::Open) {
            return Err(BackendError::Network("scripted open failure".into()));
        }
        let delay = self.token_delay;
        let stream = futures::stream::iter(self.script()).then(move |item| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            item
        });
        Ok(Box::pin(stream))
    }

    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, BackendError> {
        Ok(EmbedResponse {
            embeddings: req.input.iter().map(|s| vec![s.len() as f32, 1.0]).collect(),
        })
    }

    async fn transcribe_audio(&self, _req: MediaRequest) -> Result<MediaResponse, BackendError> {
        Ok(MediaResponse {
            text: Some("scripted transcript".into()),
            data: None,
            duration_ms: 5,
        })
    }

    async fn synthesize_speech(&self, req: MediaRequest) -> Result<MediaResponse, BackendError> {
        Ok(MediaResponse {
            text: None,
            data: Some(req.text.unwrap_or_default().into_bytes()),
            duration_ms: 5,
        })
    }

    async fn analyze_image(&self, _req: MediaRequest) -> Result<MediaResponse, BackendError> {
        Ok(MediaResponse {
            text: Some("scripted caption".into()),
            data: None,
            duration_ms: 5,
        })
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        Ok(vec!["scripted:1b".into()])
    }

    fn get_metrics(&self) -> BackendMetrics {
        self.metrics.read().unwrap().clone()
    }

    fn record_outcome(&self, latency: Duration, success: bool) {
        self.metrics.write().unwrap().record(latency, success);
    }
}
