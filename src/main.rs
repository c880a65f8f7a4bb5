mod api;
mod backend;
mod config;
mod error;
mod pipeline;
mod power;
mod routing;
mod stream;

#[cfg(test)]
mod routing_tests;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{HeaderValue, Method};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::backend::http::HttpBackend;
use crate::backend::registry::Registry;
use crate::backend::Hardware;
use crate::config::AppConfig;
use crate::pipeline::PipelineExecutor;
use crate::power::monitor::SystemMonitor;
use crate::power::EfficiencyController;
use crate::routing::history::DecisionRing;
use crate::routing::queue::QueueManager;
use crate::routing::router::RoutingEngine;
use crate::stream::SseFramer;

/// Shared application state available to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub registry: Registry,
    pub queues: QueueManager,
    pub engine: RoutingEngine,
    pub controller: EfficiencyController,
    pub monitor: SystemMonitor,
    pub pipelines: PipelineExecutor,
    pub framer: SseFramer,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (not required)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchboard=info,tower_http=info".into()),
        )
        .init();

    info!("Starting switchboard v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::from_env()?;
    info!(
        listen_addr = %config.listen_addr,
        grpc_addr = %config.grpc_listen_addr,
        mode = %config.default_mode,
        "Configuration loaded"
    );

    // Register the backend pool
    let registry = Registry::new();
    let mut inventory: Vec<(String, Hardware)> = Vec::new();
    match &config.backends_path {
        Some(path) => {
            let specs = config::load_backend_specs(path)?;
            if specs.is_empty() {
                warn!(path = %path, "Backends file is empty — all requests will 503");
            }
            for spec in specs {
                inventory.push((spec.id.clone(), spec.hardware));
                let backend = HttpBackend::new(spec).context("failed to build backend client")?;
                registry.register(Arc::new(backend));
            }
        }
        None => {
            warn!("BACKENDS_PATH not set — starting with an empty pool; all requests will 503");
        }
    }

    // Queue accounting + leak audit
    let queues = QueueManager::new();
    queues.spawn_auditor();

    // Health probing
    registry.spawn_prober(Duration::from_secs(config.health_probe_secs));

    // System-state monitoring
    let monitor = SystemMonitor::new(Path::new(&config.sensor_root));
    monitor.spawn_poller(Duration::from_secs(config.poll_interval_secs));

    // Efficiency-mode controller; sole writer of thermal throttles
    let (controller, throttle_rx) =
        EfficiencyController::new(config.default_mode, config.quiet_hours, inventory);
    registry.spawn_throttle_listener(throttle_rx);
    controller.spawn(
        monitor.subscribe(),
        registry.subscribe_health(),
        Duration::from_secs(config.poll_interval_secs),
    );

    // Routing engine + pipeline executor
    let engine = RoutingEngine::new(
        registry.clone(),
        queues.clone(),
        controller.profile(),
        DecisionRing::default(),
    );
    let pipelines = PipelineExecutor::new(engine.clone()).with_system_state(monitor.subscribe());

    let state = Arc::new(AppState {
        config: config.clone(),
        registry,
        queues,
        engine,
        controller,
        monitor,
        pipelines,
        framer: SseFramer::default(),
    });

    // gRPC surface on its own port
    {
        let grpc_state = state.clone();
        let addr = config
            .grpc_listen_addr
            .parse::<std::net::SocketAddr>()
            .context("invalid GRPC_LISTEN_ADDR")?;
        tokio::spawn(async move {
            if let Err(e) = api::grpc::serve(grpc_state, addr).await {
                error!(error = %e, "gRPC server exited");
            }
        });
    }

    // HTTP surface (REST + SSE + WebSocket)
    let app = api::routes(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(build_cors_layer(&config));

    let addr = config
        .listen_addr
        .parse::<std::net::SocketAddr>()
        .context("invalid LISTEN_ADDR")?;
    info!(%addr, "HTTP server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_cors_layer(config: &AppConfig) -> CorsLayer {
    match &config.cors_allow_origin {
        Some(origin) => {
            let origin = origin
                .parse::<HeaderValue>()
                .unwrap_or_else(|_| HeaderValue::from_static("http://localhost"));
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
                .allow_headers(tower_http::cors::Any)
        }
        None => CorsLayer::permissive(),
    }
}
