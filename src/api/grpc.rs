//! gRPC protocol adapter: unary and server-streaming methods over the same
//! routing core and datapath as the REST and WebSocket surfaces.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::backend::{Backend, ChatMessage, EmbedRequest, GenerateRequest, Operation};
use crate::error::ProxyError;
use crate::routing::annotations::{Annotations, MediaType, Priority};
use crate::routing::router::RoutingDecision;
use crate::stream::{relay, TokenChunk};
use crate::AppState;

pub mod pb {
    tonic::include_proto!("switchboard.v1");
}

use pb::switchboard_server::{Switchboard, SwitchboardServer};

pub struct SwitchboardService {
    state: Arc<AppState>,
}

impl SwitchboardService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

fn status_for(err: &ProxyError) -> Status {
    let message = err.to_string();
    match err {
        ProxyError::InvalidRequest(_) => Status::invalid_argument(message),
        ProxyError::ModelNotFound(_) | ProxyError::TargetNotFound(_) => {
            Status::not_found(message)
        }
        ProxyError::NoAvailableBackends { .. } => Status::unavailable(message),
        ProxyError::RateLimited(_) => Status::resource_exhausted(message),
        ProxyError::BackendTimeout => Status::deadline_exceeded(message),
        ProxyError::Cancelled => Status::cancelled(message),
        ProxyError::Backend { .. } | ProxyError::ClientTooSlow { .. } | ProxyError::Internal(_) => {
            Status::internal(message)
        }
    }
}

/// Proto zero values mean "no hint".
fn annotations_from_pb(pb: Option<pb::Annotations>) -> Annotations {
    let Some(pb) = pb else {
        return Annotations::default();
    };
    Annotations {
        target: (!pb.target.is_empty()).then_some(pb.target),
        latency_critical: pb.latency_critical,
        prefer_power_efficiency: pb.prefer_power_efficiency,
        max_latency_ms: (pb.max_latency_ms > 0.0).then_some(pb.max_latency_ms),
        max_power_watts: (pb.max_power_watts > 0.0).then_some(pb.max_power_watts),
        cache_enabled: None,
        media_type: if pb.media_type.is_empty() {
            MediaType::Auto
        } else {
            MediaType::parse(&pb.media_type)
        },
        priority: Priority::parse(&pb.priority),
        request_id: (!pb.request_id.is_empty()).then_some(pb.request_id),
        deadline_ms: (pb.deadline_ms > 0).then_some(pb.deadline_ms),
        custom: pb.custom.into_iter().collect(),
    }
}

fn routing_meta(decision: &RoutingDecision) -> pb::RoutingMeta {
    pb::RoutingMeta {
        backend_id: decision.backend.id().to_string(),
        reason: decision.reason.to_string(),
        estimated_power_watts: decision.estimated_power_w,
        estimated_latency_ms: decision.estimated_latency_ms,
        alternatives: decision.alternatives.clone(),
        queue_depth: decision.queue_depth,
    }
}

fn chunk_to_pb(chunk: TokenChunk) -> pb::TokenChunk {
    pb::TokenChunk {
        token: chunk.token,
        done: chunk.done,
        ttft_ms: chunk.ttft_ms.unwrap_or(0),
        inter_token_ms: chunk.inter_token_ms.unwrap_or(0),
        total_tokens: chunk.total_tokens.unwrap_or(0),
        total_duration_ms: chunk.total_duration_ms.unwrap_or(0),
        backend_id: chunk.backend_id.unwrap_or_default(),
    }
}

fn generate_request_from_pb(pb: &pb::GenerateRequest) -> Result<GenerateRequest, Status> {
    if pb.model.is_empty() {
        return Err(Status::invalid_argument("model is required"));
    }
    let options = if pb.options_json.is_empty() {
        None
    } else {
        Some(
            serde_json::from_str(&pb.options_json)
                .map_err(|e| Status::invalid_argument(format!("bad options_json: {e}")))?,
        )
    };
    Ok(GenerateRequest {
        model: pb.model.clone(),
        prompt: (!pb.prompt.is_empty()).then(|| pb.prompt.clone()),
        messages: pb
            .messages
            .iter()
            .map(|m| ChatMessage {
                role: m.role.clone(),
                content: m.content.clone(),
            })
            .collect(),
        options,
    })
}

#[tonic::async_trait]
impl Switchboard for SwitchboardService {
    async fn generate(
        &self,
        request: Request<pb::GenerateRequest>,
    ) -> Result<Response<pb::GenerateReply>, Status> {
        let pb_req = request.into_inner();
        let generate = generate_request_from_pb(&pb_req)?;
        let annotations = annotations_from_pb(pb_req.annotations);

        self.state.admit().map_err(|e| status_for(&e))?;
        info!(model = %generate.model, "gRPC generate request");

        let (decision, resp) =
            super::openai::generate_with_fallback(&self.state, &generate, &annotations)
                .await
                .map_err(|e| status_for(&e))?;

        Ok(Response::new(pb::GenerateReply {
            text: resp.text,
            total_tokens: resp.total_tokens,
            total_duration_ms: resp.duration_ms,
            routing: Some(routing_meta(&decision)),
        }))
    }

    type GenerateStreamStream =
        Pin<Box<dyn Stream<Item = Result<pb::TokenChunk, Status>> + Send + 'static>>;

    async fn generate_stream(
        &self,
        request: Request<pb::GenerateRequest>,
    ) -> Result<Response<Self::GenerateStreamStream>, Status> {
        let pb_req = request.into_inner();
        let generate = generate_request_from_pb(&pb_req)?;
        let annotations = annotations_from_pb(pb_req.annotations);

        self.state.admit().map_err(|e| status_for(&e))?;
        info!(model = %generate.model, "gRPC stream request");

        let decision = self
            .state
            .engine
            .route(&generate.model, Operation::Stream, &annotations)
            .map_err(|e| status_for(&e))?;

        let guard = self
            .state
            .queues
            .mark_start(decision.backend.id(), annotations.effective_priority());

        let stream = match decision.backend.backend.generate_stream(generate).await {
            Ok(s) => s,
            Err(e) => {
                decision
                    .backend
                    .backend
                    .record_outcome(Duration::ZERO, false);
                drop(guard);
                warn!(backend = %decision.backend.id(), error = %e, "gRPC stream open failed");
                return Err(status_for(&ProxyError::Backend {
                    backend_id: decision.backend.id().to_string(),
                    message: e.to_string(),
                }));
            }
        };

        let deadline = annotations.deadline_ms.map(Duration::from_millis);
        let rx = relay(
            Arc::clone(&decision.backend.backend),
            stream,
            guard,
            deadline,
        );

        let out = ReceiverStream::new(rx).map(|item| match item {
            Ok(chunk) => Ok(chunk_to_pb(chunk)),
            Err(e) => Err(status_for(&e)),
        });

        Ok(Response::new(Box::pin(out)))
    }

    async fn embed(
        &self,
        request: Request<pb::EmbedRequest>,
    ) -> Result<Response<pb::EmbedReply>, Status> {
        let pb_req = request.into_inner();
        if pb_req.model.is_empty() {
            return Err(Status::invalid_argument("model is required"));
        }
        if pb_req.input.is_empty() {
            return Err(Status::invalid_argument("input must not be empty"));
        }
        let annotations = annotations_from_pb(pb_req.annotations);
        self.state.admit().map_err(|e| status_for(&e))?;

        let embed = EmbedRequest {
            model: pb_req.model,
            input: pb_req.input,
        };

        let decision = self
            .state
            .engine
            .route(&embed.model, Operation::Embed, &annotations)
            .map_err(|e| status_for(&e))?;

        let _guard = self
            .state
            .queues
            .mark_start(decision.backend.id(), annotations.effective_priority());
        let started = tokio::time::Instant::now();
        let result = decision.backend.backend.embed(embed).await;
        decision
            .backend
            .backend
            .record_outcome(started.elapsed(), result.is_ok());

        let resp = result.map_err(|e| {
            status_for(&ProxyError::Backend {
                backend_id: decision.backend.id().to_string(),
                message: e.to_string(),
            })
        })?;

        Ok(Response::new(pb::EmbedReply {
            embeddings: resp
                .embeddings
                .into_iter()
                .map(|values| pb::Embedding { values })
                .collect(),
            routing: Some(routing_meta(&decision)),
        }))
    }

    async fn list_models(
        &self,
        _request: Request<pb::ListModelsRequest>,
    ) -> Result<Response<pb::ListModelsReply>, Status> {
        let mut models = Vec::new();
        for handle in self.state.registry.list() {
            if !handle.healthy {
                continue;
            }
            if let Ok(Ok(list)) = tokio::time::timeout(
                Duration::from_secs(5),
                handle.backend.list_models(),
            )
            .await
            {
                models.extend(list);
            }
        }
        models.sort();
        models.dedup();
        Ok(Response::new(pb::ListModelsReply { models }))
    }
}

/// Bind and serve the gRPC surface.
pub async fn serve(state: Arc<AppState>, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    info!(%addr, "gRPC server listening");
    tonic::transport::Server::builder()
        .add_service(SwitchboardServer::new(SwitchboardService::new(state)))
        .serve(addr)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pb_annotations_are_all_defaults() {
        let ann = annotations_from_pb(Some(pb::Annotations::default()));
        assert!(ann.target.is_none());
        assert!(!ann.latency_critical);
        assert!(ann.max_latency_ms.is_none());
        assert_eq!(ann.media_type, MediaType::Auto);
        assert!(ann.priority.is_none());
    }

    #[test]
    fn pb_annotations_map_to_hints() {
        let ann = annotations_from_pb(Some(pb::Annotations {
            target: "npu0".into(),
            latency_critical: true,
            max_latency_ms: 250.0,
            priority: "high".into(),
            media_type: "audio".into(),
            deadline_ms: 3000,
            ..pb::Annotations::default()
        }));
        assert_eq!(ann.target.as_deref(), Some("npu0"));
        assert!(ann.latency_critical);
        assert_eq!(ann.max_latency_ms, Some(250.0));
        assert_eq!(ann.priority, Some(Priority::High));
        assert_eq!(ann.media_type, MediaType::Audio);
        assert_eq!(ann.deadline_ms, Some(3000));
    }

    #[test]
    fn chunk_conversion_keeps_terminal_fields() {
        let chunk = TokenChunk {
            token: "".into(),
            done: true,
            total_tokens: Some(20),
            total_duration_ms: Some(400),
            backend_id: Some("npu0".into()),
            ..TokenChunk::default()
        };
        let pb = chunk_to_pb(chunk);
        assert!(pb.done);
        assert_eq!(pb.total_tokens, 20);
        assert_eq!(pb.backend_id, "npu0");
    }

    #[test]
    fn generate_request_requires_model() {
        let err = generate_request_from_pb(&pb::GenerateRequest::default()).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }
}
