//! HTTP server implementation using Axum.

use axum::{Router, routing::get};
use bharat_core::config::GatewayConfig;
use bharat_db::CrmDb;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub gateway_config: GatewayConfig,
    pub db: Arc<CrmDb>,
    pub node_id: String,
    /// Jobs this worker registered; listed even before their first tick.
    pub job_names: Vec<String>,
    pub start_time: std::time::Instant,
}

/// Build the router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([axum::http::Method::GET])
        .allow_headers(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(super::routes::health_check))
        .route("/health/jobs", get(super::routes::job_health))
        .route("/health/dedup", get(super::routes::dedup_runs))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Serve until `stop` flips to true.
pub async fn serve(state: AppState, mut stop: watch::Receiver<bool>) -> std::io::Result<()> {
    let addr = format!("{}:{}", state.gateway_config.host, state.gateway_config.port);
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Health gateway listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        })
        .await
}
