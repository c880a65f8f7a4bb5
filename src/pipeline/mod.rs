//! Multi-stage pipeline executor (STT → LLM → TTS and friends).
//!
//! Each stage resolves its own backend (explicit id first, then preferred
//! hardware, then the router), transforms its input, invokes the backend
//! operation matching the stage type and feeds the result forward. A
//! forwarding policy can escalate a stage along an ordered backend path on
//! low confidence, high temperature, hard error or blown latency budget.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::registry::BackendHandle;
use crate::backend::{
    Backend, EmbedRequest, GenerateRequest, MediaRequest, Operation,
};
use crate::error::ProxyError;
use crate::power::monitor::SystemState;
use crate::routing::annotations::{Annotations, Priority};
use crate::routing::router::RoutingEngine;

/// What a stage does; maps onto a backend operation, except `Transform`
/// which runs entirely inside the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Generate,
    Embed,
    AudioToText,
    TextToAudio,
    ImageToText,
    TextToImage,
    VideoToText,
    TextToVideo,
    Transform,
}

impl StageKind {
    fn operation(self) -> Operation {
        match self {
            StageKind::Generate | StageKind::Transform => Operation::Generate,
            StageKind::Embed => Operation::Embed,
            StageKind::AudioToText => Operation::AudioToText,
            StageKind::TextToAudio => Operation::TextToAudio,
            StageKind::ImageToText => Operation::ImageToText,
            StageKind::TextToImage => Operation::TextToImage,
            StageKind::VideoToText => Operation::VideoToText,
            StageKind::TextToVideo => Operation::TextToVideo,
        }
    }
}

/// The value flowing between stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageValue {
    Text(String),
    Bytes(Vec<u8>),
    Embedding(Vec<f32>),
}

impl StageValue {
    fn as_text(&self) -> Result<&str, ProxyError> {
        match self {
            StageValue::Text(t) => Ok(t),
            other => Err(ProxyError::InvalidRequest(format!(
                "stage expected text input, got {}",
                other.kind_name()
            ))),
        }
    }

    fn as_bytes(&self) -> Result<&[u8], ProxyError> {
        match self {
            StageValue::Bytes(b) => Ok(b),
            other => Err(ProxyError::InvalidRequest(format!(
                "stage expected binary input, got {}",
                other.kind_name()
            ))),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            StageValue::Text(_) => "text",
            StageValue::Bytes(_) => "bytes",
            StageValue::Embedding(_) => "embedding",
        }
    }
}

/// Pure value rewrite applied before or after a stage call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    /// Substitute `{input}` into a template.
    Template(String),
    /// Treat the text as JSON and extract the value at a pointer.
    JsonPointer(String),
}

impl Transform {
    fn apply(&self, value: StageValue) -> Result<StageValue, ProxyError> {
        match self {
            Transform::Template(template) => {
                let text = value.as_text()?;
                Ok(StageValue::Text(template.replace("{input}", text)))
            }
            Transform::JsonPointer(pointer) => {
                let text = value.as_text()?;
                let parsed: serde_json::Value = serde_json::from_str(text).map_err(|e| {
                    ProxyError::InvalidRequest(format!("transform input is not JSON: {e}"))
                })?;
                let found = parsed.pointer(pointer).ok_or_else(|| {
                    ProxyError::InvalidRequest(format!("JSON pointer '{pointer}' not found"))
                })?;
                let text = match found {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Ok(StageValue::Text(text))
            }
        }
    }
}

/// Escalation policy for one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingPolicy {
    /// Ordered backend ids to escalate through after the first choice.
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
    #[serde(default)]
    pub max_temperature_c: Option<f64>,
    #[serde(default)]
    pub max_latency_ms: Option<u64>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub kind: StageKind,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub preferred_backend: Option<String>,
    #[serde(default)]
    pub preferred_hardware: Option<crate::backend::Hardware>,
    #[serde(default)]
    pub forwarding: Option<ForwardingPolicy>,
    #[serde(default)]
    pub input_transform: Option<Transform>,
    #[serde(default)]
    pub output_transform: Option<Transform>,
    /// Parallel-eligible: no input dependency on the previous stage.
    /// Consecutive parallel stages run concurrently; the next serial stage
    /// waits for all of them.
    #[serde(default)]
    pub parallel: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub name: String,
    pub stages: Vec<StageSpec>,
    /// Skip failing stages (value passes through unchanged) instead of
    /// aborting the pipeline.
    #[serde(default)]
    pub continue_on_error: bool,
}

/// Per-stage outcome for observability.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub kind: StageKind,
    pub backend_id: Option<String>,
    pub latency_ms: u64,
    pub escalations: u32,
    pub skipped: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub output: StageValue,
    pub stages: Vec<StageReport>,
}

/// Derives a confidence score from a stage's output. The derivation is
/// pluggable; the default derives nothing, which disables confidence
/// escalation.
pub trait ConfidenceEstimator: Send + Sync {
    fn estimate(&self, stage: &StageSpec, output: &StageValue) -> Option<f64>;
}

/// Estimator that never produces a score.
pub struct NoConfidence;

impl ConfidenceEstimator for NoConfidence {
    fn estimate(&self, _stage: &StageSpec, _output: &StageValue) -> Option<f64> {
        None
    }
}

#[derive(Clone)]
pub struct PipelineExecutor {
    engine: RoutingEngine,
    estimator: Arc<dyn ConfidenceEstimator>,
    system_state: Option<watch::Receiver<SystemState>>,
}

impl PipelineExecutor {
    pub fn new(engine: RoutingEngine) -> Self {
        Self {
            engine,
            estimator: Arc::new(NoConfidence),
            system_state: None,
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn ConfidenceEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_system_state(mut self, rx: watch::Receiver<SystemState>) -> Self {
        self.system_state = Some(rx);
        self
    }

    /// Run the pipeline over `input`. Consecutive parallel-eligible stages
    /// execute concurrently against the same input; their text outputs are
    /// joined in stage order before the next serial stage.
    pub async fn run(
        &self,
        spec: &PipelineSpec,
        input: StageValue,
    ) -> Result<PipelineResult, ProxyError> {
        if spec.stages.is_empty() {
            return Err(ProxyError::InvalidRequest("pipeline has no stages".into()));
        }
        info!(pipeline = %spec.name, stages = spec.stages.len(), "Pipeline started");

        let mut value = input;
        let mut reports = Vec::with_capacity(spec.stages.len());
        let mut index = 0;

        while index < spec.stages.len() {
            // Collect a run of parallel-eligible stages (at least one
            // stage; a serial stage forms a group of one).
            let group_start = index;
            let mut group_end = index + 1;
            if spec.stages[index].parallel {
                while group_end < spec.stages.len() && spec.stages[group_end].parallel {
                    group_end += 1;
                }
            }

            let group = &spec.stages[group_start..group_end];
            if group.len() == 1 {
                let (next, report) = self
                    .run_stage_with_policy(&group[0], value.clone(), spec.continue_on_error)
                    .await?;
                if let Some(v) = next {
                    value = v;
                }
                reports.push(report);
            } else {
                let futures = group.iter().map(|stage| {
                    self.run_stage_with_policy(stage, value.clone(), spec.continue_on_error)
                });
                let outcomes = join_all(futures).await;

                let mut outputs = Vec::new();
                for outcome in outcomes {
                    let (next, report) = outcome?;
                    if let Some(v) = next {
                        outputs.push(v);
                    }
                    reports.push(report);
                }
                value = merge_parallel_outputs(outputs, value);
            }
            index = group_end;
        }

        Ok(PipelineResult {
            output: value,
            stages: reports,
        })
    }

    /// Run one stage including transforms and escalation. Returns the new
    /// value (None when the stage was skipped) and its report.
    async fn run_stage_with_policy(
        &self,
        stage: &StageSpec,
        value: StageValue,
        continue_on_error: bool,
    ) -> Result<(Option<StageValue>, StageReport), ProxyError> {
        let started = Instant::now();
        match self.run_stage(stage, value).await {
            Ok((output, backend_id, escalations)) => Ok((
                Some(output),
                StageReport {
                    kind: stage.kind,
                    backend_id,
                    latency_ms: started.elapsed().as_millis() as u64,
                    escalations,
                    skipped: false,
                },
            )),
            Err(e) if continue_on_error => {
                warn!(stage = ?stage.kind, error = %e, "Stage failed, skipping");
                Ok((
                    None,
                    StageReport {
                        kind: stage.kind,
                        backend_id: None,
                        latency_ms: started.elapsed().as_millis() as u64,
                        escalations: 0,
                        skipped: true,
                    },
                ))
            }
            Err(e) => Err(e),
        }
    }

    async fn run_stage(
        &self,
        stage: &StageSpec,
        mut value: StageValue,
    ) -> Result<(StageValue, Option<String>, u32), ProxyError> {
        if let Some(transform) = &stage.input_transform {
            value = transform.apply(value)?;
        }

        // Pure transform stages never touch a backend.
        if stage.kind == StageKind::Transform {
            if let Some(transform) = &stage.output_transform {
                value = transform.apply(value)?;
            }
            return Ok((value, None, 0));
        }

        let mut escalations: u32 = 0;
        let max_retries = stage
            .forwarding
            .as_ref()
            .map(|p| p.max_retries)
            .unwrap_or(0);
        let path: Vec<String> = stage
            .forwarding
            .as_ref()
            .map(|p| p.path.clone())
            .unwrap_or_default();

        let mut attempt = 0usize;
        let mut last_error: Option<ProxyError> = None;

        loop {
            let backend = match self.resolve_stage_backend(stage, attempt, &path) {
                Ok(b) => b,
                Err(e) => {
                    last_error = Some(e);
                    break;
                }
            };
            let backend_id = backend.id().to_string();

            // Temperature trigger is evaluated at attempt start against the
            // latest snapshot; unknown temperatures never trigger.
            if attempt < path.len() && escalations < max_retries {
                if let Some(policy) = &stage.forwarding {
                    if let (Some(ceiling), Some(temp)) =
                        (policy.max_temperature_c, self.current_max_temp())
                    {
                        if temp > ceiling {
                            debug!(stage = ?stage.kind, backend = %backend_id, temp, "Escalating: too hot");
                            escalations += 1;
                            attempt += 1;
                            continue;
                        }
                    }
                }
            }

            let call_started = Instant::now();
            let guard = self
                .engine
                .queues()
                .mark_start(&backend_id, Priority::Normal);
            let result = self.call_stage(&backend, stage, value.clone()).await;
            let latency = call_started.elapsed();
            backend.backend.record_outcome(latency, result.is_ok());
            drop(guard);

            match result {
                Ok(output) => {
                    let mut escalate = false;
                    if let Some(policy) = &stage.forwarding {
                        if let Some(budget) = policy.max_latency_ms {
                            if latency.as_millis() as u64 > budget {
                                debug!(stage = ?stage.kind, backend = %backend_id, "Escalating: over latency budget");
                                escalate = true;
                            }
                        }
                        if !escalate {
                            if let (Some(floor), Some(confidence)) = (
                                policy.min_confidence,
                                self.estimator.estimate(stage, &output),
                            ) {
                                if confidence < floor {
                                    debug!(stage = ?stage.kind, backend = %backend_id, confidence, "Escalating: low confidence");
                                    escalate = true;
                                }
                            }
                        }
                    }

                    if escalate && escalations < max_retries && attempt < path.len() {
                        escalations += 1;
                        attempt += 1;
                        continue;
                    }

                    let mut output = output;
                    if let Some(transform) = &stage.output_transform {
                        output = transform.apply(output)?;
                    }
                    return Ok((output, Some(backend_id), escalations));
                }
                Err(e) => {
                    warn!(stage = ?stage.kind, backend = %backend_id, error = %e, "Stage attempt failed");
                    last_error = Some(e);
                    if escalations < max_retries && attempt < path.len() {
                        escalations += 1;
                        attempt += 1;
                        continue;
                    }
                    break;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ProxyError::Internal("stage ended without outcome".into())
        }))
    }

    /// Stage backend resolution: explicit id wins, then first healthy
    /// backend on the preferred hardware, then the router. Escalation
    /// attempts > 0 walk the forwarding path instead.
    fn resolve_stage_backend(
        &self,
        stage: &StageSpec,
        attempt: usize,
        path: &[String],
    ) -> Result<BackendHandle, ProxyError> {
        if attempt > 0 {
            let id = path.get(attempt - 1).ok_or_else(|| {
                ProxyError::Internal("escalation past end of forwarding path".into())
            })?;
            return self
                .engine
                .registry()
                .get(id)
                .filter(|h| h.healthy)
                .ok_or_else(|| ProxyError::TargetNotFound(id.clone()));
        }

        if let Some(id) = &stage.preferred_backend {
            return self
                .engine
                .registry()
                .get(id)
                .filter(|h| h.healthy)
                .ok_or_else(|| ProxyError::TargetNotFound(id.clone()));
        }

        if let Some(hardware) = stage.preferred_hardware {
            if let Some(handle) = self
                .engine
                .registry()
                .list()
                .into_iter()
                .find(|h| h.healthy && h.backend.spec().hardware == hardware)
            {
                return Ok(handle);
            }
        }

        let decision =
            self.engine
                .route(&stage.model, stage.kind.operation(), &Annotations::default())?;
        Ok(decision.backend)
    }

    async fn call_stage(
        &self,
        handle: &BackendHandle,
        stage: &StageSpec,
        value: StageValue,
    ) -> Result<StageValue, ProxyError> {
        let backend = &handle.backend;
        let model = stage.model.clone();
        let map_err = |e: crate::backend::BackendError| ProxyError::Backend {
            backend_id: handle.id().to_string(),
            message: e.to_string(),
        };

        match stage.kind {
            StageKind::Generate => {
                let req = GenerateRequest {
                    model,
                    prompt: Some(value.as_text()?.to_string()),
                    ..GenerateRequest::default()
                };
                let resp = backend.generate(req).await.map_err(map_err)?;
                Ok(StageValue::Text(resp.text))
            }
            StageKind::Embed => {
                let req = EmbedRequest {
                    model,
                    input: vec![value.as_text()?.to_string()],
                };
                let resp = backend.embed(req).await.map_err(map_err)?;
                let embedding = resp.embeddings.into_iter().next().ok_or_else(|| {
                    ProxyError::Backend {
                        backend_id: handle.id().to_string(),
                        message: "embedding response was empty".into(),
                    }
                })?;
                Ok(StageValue::Embedding(embedding))
            }
            StageKind::AudioToText => {
                let req = MediaRequest {
                    model,
                    data: Some(value.as_bytes()?.to_vec()),
                    ..MediaRequest::default()
                };
                let resp = backend.transcribe_audio(req).await.map_err(map_err)?;
                Ok(StageValue::Text(resp.text.unwrap_or_default()))
            }
            StageKind::TextToAudio => {
                let req = MediaRequest {
                    model,
                    text: Some(value.as_text()?.to_string()),
                    ..MediaRequest::default()
                };
                let resp = backend.synthesize_speech(req).await.map_err(map_err)?;
                Ok(StageValue::Bytes(resp.data.unwrap_or_default()))
            }
            StageKind::ImageToText => {
                let req = MediaRequest {
                    model,
                    data: Some(value.as_bytes()?.to_vec()),
                    ..MediaRequest::default()
                };
                let resp = backend.analyze_image(req).await.map_err(map_err)?;
                Ok(StageValue::Text(resp.text.unwrap_or_default()))
            }
            StageKind::TextToImage => {
                let req = MediaRequest {
                    model,
                    text: Some(value.as_text()?.to_string()),
                    ..MediaRequest::default()
                };
                let resp = backend.generate_image(req).await.map_err(map_err)?;
                Ok(StageValue::Bytes(resp.data.unwrap_or_default()))
            }
            StageKind::VideoToText => {
                let req = MediaRequest {
                    model,
                    data: Some(value.as_bytes()?.to_vec()),
                    ..MediaRequest::default()
                };
                let resp = backend.analyze_video(req).await.map_err(map_err)?;
                Ok(StageValue::Text(resp.text.unwrap_or_default()))
            }
            StageKind::TextToVideo => {
                let req = MediaRequest {
                    model,
                    text: Some(value.as_text()?.to_string()),
                    ..MediaRequest::default()
                };
                let resp = backend.generate_video(req).await.map_err(map_err)?;
                Ok(StageValue::Bytes(resp.data.unwrap_or_default()))
            }
            StageKind::Transform => unreachable!("transform stages never reach a backend"),
        }
    }

    fn current_max_temp(&self) -> Option<f64> {
        self.system_state.as_ref().and_then(|rx| rx.borrow().max_temp())
    }
}

/// Text outputs of a parallel group are joined in stage order; mixed or
/// binary outputs keep the last one; an all-skipped group passes the
/// previous value through.
fn merge_parallel_outputs(outputs: Vec<StageValue>, previous: StageValue) -> StageValue {
    if outputs.is_empty() {
        return previous;
    }
    if outputs.len() == 1 {
        return outputs.into_iter().next().unwrap();
    }
    let all_text = outputs.iter().all(|v| matches!(v, StageValue::Text(_)));
    if all_text {
        let joined = outputs
            .into_iter()
            .map(|v| match v {
                StageValue::Text(t) => t,
                _ => unreachable!(),
            })
            .collect::<Vec<_>>()
            .join("\n");
        StageValue::Text(joined)
    } else {
        outputs.into_iter().last().unwrap()
    }
}
