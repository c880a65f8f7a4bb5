//! REST/SSE protocol adapter: OpenAI-compatible inference surface plus the
//! local control endpoints (backends, mode, routing history, pipelines).

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use super::metadata_headers;
use crate::backend::{Backend, ChatMessage, EmbedRequest, GenerateRequest, Operation};
use crate::error::ProxyError;
use crate::pipeline::{PipelineSpec, StageValue};
use crate::routing::annotations::Annotations;
use crate::routing::router::RoutingDecision;
use crate::stream::{relay, SseFramer, StreamItem};
use crate::AppState;

/// Deadline for per-backend model listing during `/v1/models`.
const LIST_MODELS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct ChatCompletionRequest {
    model: String,
    #[serde(default)]
    messages: Vec<ChatMessage>,
    #[serde(default)]
    stream: bool,
    /// Sampler options passed through to the backend untouched.
    #[serde(flatten)]
    options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CompletionRequest {
    model: String,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    stream: bool,
    #[serde(flatten)]
    options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmbeddingInput {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct EmbeddingsRequest {
    model: String,
    input: EmbeddingInput,
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ProxyError> {
    serde_json::from_slice(body).map_err(|e| ProxyError::InvalidRequest(e.to_string()))
}

fn passthrough_options(options: serde_json::Map<String, serde_json::Value>) -> Option<serde_json::Value> {
    if options.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(options))
    }
}

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let parsed: ChatCompletionRequest = parse_body(&body)?;
    if parsed.model.is_empty() {
        return Err(ProxyError::InvalidRequest("model is required".into()));
    }
    if parsed.messages.is_empty() {
        return Err(ProxyError::InvalidRequest("messages must not be empty".into()));
    }

    let annotations = Annotations::from_headers(&headers);
    state.admit()?;

    info!(
        model = %parsed.model,
        stream = parsed.stream,
        priority = annotations.effective_priority().as_str(),
        "Chat completion request"
    );

    let request = GenerateRequest {
        model: parsed.model.clone(),
        prompt: None,
        messages: parsed.messages,
        options: passthrough_options(parsed.options),
    };

    if parsed.stream {
        stream_response(&state, request, &annotations).await
    } else {
        let (decision, resp) = generate_with_fallback(&state, &request, &annotations).await?;
        let body = serde_json::json!({
            "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": parsed.model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": resp.text},
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": 0,
                "completion_tokens": resp.total_tokens,
                "total_tokens": resp.total_tokens
            }
        });
        let mut response = Json(body).into_response();
        metadata_headers(response.headers_mut(), &decision);
        Ok(response)
    }
}

/// POST /v1/completions
pub async fn completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let parsed: CompletionRequest = parse_body(&body)?;
    if parsed.model.is_empty() {
        return Err(ProxyError::InvalidRequest("model is required".into()));
    }

    let annotations = Annotations::from_headers(&headers);
    state.admit()?;

    info!(
        model = %parsed.model,
        stream = parsed.stream,
        priority = annotations.effective_priority().as_str(),
        "Text completion request"
    );

    let request = GenerateRequest {
        model: parsed.model.clone(),
        prompt: Some(parsed.prompt),
        messages: vec![],
        options: passthrough_options(parsed.options),
    };

    if parsed.stream {
        stream_response(&state, request, &annotations).await
    } else {
        let (decision, resp) = generate_with_fallback(&state, &request, &annotations).await?;
        let body = serde_json::json!({
            "id": format!("cmpl-{}", uuid::Uuid::new_v4()),
            "object": "text_completion",
            "created": chrono::Utc::now().timestamp(),
            "model": parsed.model,
            "choices": [{"index": 0, "text": resp.text, "finish_reason": "stop"}],
            "usage": {
                "prompt_tokens": 0,
                "completion_tokens": resp.total_tokens,
                "total_tokens": resp.total_tokens
            }
        });
        let mut response = Json(body).into_response();
        metadata_headers(response.headers_mut(), &decision);
        Ok(response)
    }
}

/// POST /v1/embeddings
pub async fn embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let parsed: EmbeddingsRequest = parse_body(&body)?;
    let input = match parsed.input {
        EmbeddingInput::One(s) => vec![s],
        EmbeddingInput::Many(v) => v,
    };
    if input.is_empty() {
        return Err(ProxyError::InvalidRequest("input must not be empty".into()));
    }

    let annotations = Annotations::from_headers(&headers);
    state.admit()?;

    let request = EmbedRequest {
        model: parsed.model.clone(),
        input,
    };

    let decision = state
        .engine
        .route(&request.model, Operation::Embed, &annotations)?;
    let resp = match invoke_embed(&state, &decision, &request, &annotations).await {
        Ok(resp) => resp,
        Err(first) => {
            warn!(backend = %decision.backend.id(), error = %first, "Embed failed, trying fallback");
            let retry = state.engine.fallback(
                &request.model,
                Operation::Embed,
                &annotations,
                &[decision.backend.id().to_string()],
            )?;
            invoke_embed(&state, &retry, &request, &annotations).await?
        }
    };

    let data: Vec<serde_json::Value> = resp
        .embeddings
        .iter()
        .enumerate()
        .map(|(i, e)| {
            serde_json::json!({"object": "embedding", "index": i, "embedding": e})
        })
        .collect();
    let body = serde_json::json!({
        "object": "list",
        "data": data,
        "model": parsed.model,
        "usage": {"prompt_tokens": 0, "total_tokens": 0}
    });
    let mut response = Json(body).into_response();
    metadata_headers(response.headers_mut(), &decision);
    Ok(response)
}

/// GET /v1/models — union of every healthy backend's model list.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    let mut names: Vec<String> = Vec::new();
    for handle in state.registry.list() {
        if !handle.healthy {
            continue;
        }
        match tokio::time::timeout(LIST_MODELS_TIMEOUT, handle.backend.list_models()).await {
            Ok(Ok(models)) => names.extend(models),
            Ok(Err(e)) => {
                warn!(backend = %handle.id(), error = %e, "Model listing failed")
            }
            Err(_) => warn!(backend = %handle.id(), "Model listing timed out"),
        }
    }
    names.sort();
    names.dedup();

    let data: Vec<serde_json::Value> = names
        .into_iter()
        .map(|id| serde_json::json!({"id": id, "object": "model", "owned_by": "switchboard"}))
        .collect();
    Json(serde_json::json!({"object": "list", "data": data})).into_response()
}

/// GET /v1/backends — registry snapshot with queues and rolling metrics.
pub async fn list_backends(State(state): State<Arc<AppState>>) -> Response {
    let queues = state.queues.snapshot();
    let backends: Vec<serde_json::Value> = state
        .registry
        .list()
        .into_iter()
        .map(|h| {
            let spec = h.backend.spec();
            let metrics = h.backend.get_metrics();
            serde_json::json!({
                "id": spec.id,
                "name": spec.name,
                "hardware": spec.hardware,
                "healthy": h.healthy,
                "thermal_throttled": h.thermal_throttled,
                "power_watts": spec.power_watts,
                "priority": spec.priority,
                "capabilities": spec.capabilities,
                "queue": queues.get(&spec.id),
                "metrics": metrics,
            })
        })
        .collect();
    Json(serde_json::json!({"backends": backends})).into_response()
}

fn mode_body(state: &AppState) -> serde_json::Value {
    let (selected, effective) = state.controller.current();
    let profile = state.engine.active_profile();
    let system = state.monitor.sample();
    serde_json::json!({
        "selected": selected,
        "effective": effective,
        "profile": profile,
        "quiet_hours": state.config.quiet_hours,
        "system_state": system,
    })
}

/// GET /v1/system/mode
pub async fn get_mode(State(state): State<Arc<AppState>>) -> Response {
    Json(mode_body(&state)).into_response()
}

#[derive(Debug, Deserialize)]
struct SetModeRequest {
    mode: String,
}

/// PUT /v1/system/mode
pub async fn set_mode(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let parsed: SetModeRequest = parse_body(&body)?;
    let mode = crate::power::mode::EfficiencyMode::parse(&parsed.mode)
        .ok_or_else(|| ProxyError::InvalidRequest(format!("unknown mode '{}'", parsed.mode)))?;
    state.controller.set_mode(mode, "api request");
    Ok(Json(mode_body(&state)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default)]
    limit: Option<usize>,
}

/// GET /v1/routing/history
pub async fn routing_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let decisions = state.engine.history().recent(params.limit.unwrap_or(50));
    Json(serde_json::json!({"decisions": decisions})).into_response()
}

#[derive(Debug, Deserialize)]
struct RunPipelineRequest {
    pipeline: PipelineSpec,
    input: StageValue,
}

/// POST /v1/pipelines/run
pub async fn run_pipeline(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let parsed: RunPipelineRequest = parse_body(&body)?;
    state.admit()?;
    let result = state.pipelines.run(&parsed.pipeline, parsed.input).await?;
    Ok(Json(serde_json::json!({
        "output": result.output,
        "stages": result.stages,
    }))
    .into_response())
}

/// Route, call, and on the first backend failure re-route once with the
/// failed backend excluded. A second failure is reported, never retried.
pub(crate) async fn generate_with_fallback(
    state: &AppState,
    request: &GenerateRequest,
    annotations: &Annotations,
) -> Result<(RoutingDecision, crate::backend::GenerateResponse), ProxyError> {
    let decision = state
        .engine
        .route(&request.model, Operation::Generate, annotations)?;

    match invoke_generate(state, &decision, request, annotations).await {
        Ok(resp) => Ok((decision, resp)),
        Err(first) => {
            warn!(
                backend = %decision.backend.id(),
                error = %first,
                "Generate failed, trying fallback"
            );
            let retry = state.engine.fallback(
                &request.model,
                Operation::Generate,
                annotations,
                &[decision.backend.id().to_string()],
            )?;
            let resp = invoke_generate(state, &retry, request, annotations).await?;
            Ok((retry, resp))
        }
    }
}

pub(crate) async fn invoke_generate(
    state: &AppState,
    decision: &RoutingDecision,
    request: &GenerateRequest,
    annotations: &Annotations,
) -> Result<crate::backend::GenerateResponse, ProxyError> {
    let backend = &decision.backend.backend;
    let _guard = state
        .queues
        .mark_start(decision.backend.id(), annotations.effective_priority());
    let started = Instant::now();

    let call = backend.generate(request.clone());
    let result = match annotations.deadline_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), call).await {
            Ok(inner) => inner.map_err(|e| ProxyError::Backend {
                backend_id: decision.backend.id().to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(ProxyError::BackendTimeout),
        },
        None => call.await.map_err(|e| ProxyError::Backend {
            backend_id: decision.backend.id().to_string(),
            message: e.to_string(),
        }),
    };

    backend.record_outcome(started.elapsed(), result.is_ok());
    result
}

async fn invoke_embed(
    state: &AppState,
    decision: &RoutingDecision,
    request: &EmbedRequest,
    annotations: &Annotations,
) -> Result<crate::backend::EmbedResponse, ProxyError> {
    let backend = &decision.backend.backend;
    let _guard = state
        .queues
        .mark_start(decision.backend.id(), annotations.effective_priority());
    let started = Instant::now();
    let result = backend
        .embed(request.clone())
        .await
        .map_err(|e| ProxyError::Backend {
            backend_id: decision.backend.id().to_string(),
            message: e.to_string(),
        });
    backend.record_outcome(started.elapsed(), result.is_ok());
    result
}

/// Open the backend stream (with one-shot fallback on open failure) and
/// answer with an SSE body fed by the datapath.
async fn stream_response(
    state: &AppState,
    request: GenerateRequest,
    annotations: &Annotations,
) -> Result<Response, ProxyError> {
    let decision = state
        .engine
        .route(&request.model, Operation::Stream, annotations)?;

    let priority = annotations.effective_priority();
    let guard = state.queues.mark_start(decision.backend.id(), priority);

    let (decision, stream, guard) =
        match decision.backend.backend.generate_stream(request.clone()).await {
            Ok(stream) => (decision, stream, guard),
            Err(open_err) => {
                decision
                    .backend
                    .backend
                    .record_outcome(Duration::ZERO, false);
                drop(guard);
                warn!(
                    backend = %decision.backend.id(),
                    error = %open_err,
                    "Stream open failed, trying fallback"
                );
                let retry = state.engine.fallback(
                    &request.model,
                    Operation::Stream,
                    annotations,
                    &[decision.backend.id().to_string()],
                )?;
                let guard = state.queues.mark_start(retry.backend.id(), priority);
                match retry.backend.backend.generate_stream(request.clone()).await {
                    Ok(stream) => (retry, stream, guard),
                    Err(e) => {
                        let id = retry.backend.id().to_string();
                        retry.backend.backend.record_outcome(Duration::ZERO, false);
                        drop(guard);
                        return Err(ProxyError::Backend {
                            backend_id: id,
                            message: e.to_string(),
                        });
                    }
                }
            }
        };

    let deadline = annotations.deadline_ms.map(Duration::from_millis);
    let rx = relay(
        Arc::clone(&decision.backend.backend),
        stream,
        guard,
        deadline,
    );

    let body = sse_body(rx, state.framer.clone());
    let mut response = Response::builder()
        .status(200)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(body)
        .map_err(|e| ProxyError::Internal(e.to_string()))?;
    metadata_headers(response.headers_mut(), &decision);
    Ok(response)
}

/// SSE framing over the canonical chunk stream: one `data:` frame per
/// token chunk, the empty terminal chunk folds into `data: [DONE]`, and
/// mid-stream errors become a single `event: error` frame before close.
fn sse_body(rx: tokio::sync::mpsc::Receiver<StreamItem>, framer: SseFramer) -> Body {
    let stream = ReceiverStream::new(rx).flat_map(move |item| {
        let frames: Vec<Bytes> = match item {
            Ok(chunk) => {
                if chunk.done {
                    if chunk.token.is_empty() {
                        vec![framer.done()]
                    } else {
                        vec![framer.chunk(&chunk), framer.done()]
                    }
                } else {
                    vec![framer.chunk(&chunk)]
                }
            }
            Err(e) => vec![framer.error(&e)],
        };
        futures::stream::iter(frames.into_iter().map(Ok::<_, std::convert::Infallible>))
    });
    Body::from_stream(stream)
}
