pub mod grpc;
pub mod openai;
pub mod ws;

use std::sync::Arc;

use axum::http::header::{HeaderName, HeaderValue};
use axum::http::HeaderMap;
use axum::routing::{any, get, post};
use axum::Router;

use crate::error::ProxyError;
use crate::routing::router::RoutingDecision;
use crate::AppState;

/// REST + WebSocket route table. The gRPC surface binds separately in
/// `grpc::serve`.
pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/completions", post(openai::completions))
        .route("/v1/embeddings", post(openai::embeddings))
        .route("/v1/models", get(openai::list_models))
        .route("/v1/backends", get(openai::list_backends))
        .route(
            "/v1/system/mode",
            get(openai::get_mode).put(openai::set_mode),
        )
        .route("/v1/routing/history", get(openai::routing_history))
        .route("/v1/pipelines/run", post(openai::run_pipeline))
        .route("/ws", any(ws::ws_handler))
        .with_state(state)
}

/// Routing metadata echoed on every response. Zero or empty values are
/// omitted.
pub fn metadata_headers(headers: &mut HeaderMap, decision: &RoutingDecision) {
    let mut put = |name: &'static str, value: String| {
        if value.is_empty() {
            return;
        }
        if let Ok(v) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), v);
        }
    };

    put("x-backend-used", decision.backend.id().to_string());
    put("x-routing-reason", decision.reason.to_string());
    if decision.estimated_power_w > 0.0 {
        put(
            "x-estimated-power-watts",
            format!("{:.1}", decision.estimated_power_w),
        );
    }
    if decision.estimated_latency_ms > 0.0 {
        put(
            "x-estimated-latency-ms",
            format!("{}", decision.estimated_latency_ms.round() as u64),
        );
    }
    if !decision.alternatives.is_empty() {
        put("x-alternatives", decision.alternatives.join(","));
    }
    if decision.queue_depth > 0 {
        put("x-queue-depth", decision.queue_depth.to_string());
    }
}

impl AppState {
    /// Admission control: the active mode may cap total in-flight work
    /// (UltraEfficiency caps at 2).
    pub fn admit(&self) -> Result<(), ProxyError> {
        let profile = self.engine.active_profile();
        if let Some(cap) = profile.concurrency_cap {
            let in_flight = self.queues.total_in_flight();
            if in_flight >= cap {
                return Err(ProxyError::RateLimited(format!(
                    "{} mode limits concurrency to {cap}",
                    profile.mode
                )));
            }
        }
        Ok(())
    }
}
