// =============================================================================
// HTTP Bridge — read-only status surface for the platform (Axum 0.7)
// =============================================================================
//
// Exposes the orchestrator's aggregated status so the external platform can
// render dashboards without touching strategy state. Strictly read-only.

use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::orchestrator::GridRunner;

/// Build the bridge router with CORS and shared runner state.
pub fn router(runner: Arc<GridRunner>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/status", get(status))
        .layer(cors)
        .with_state(runner)
}

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    scope: String,
    session_id: String,
    server_time: i64,
}

async fn health(State(runner): State<Arc<GridRunner>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        scope: runner.user_scope.clone(),
        session_id: runner.session_id.clone(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn status(State(runner): State<Arc<GridRunner>>) -> impl IntoResponse {
    Json(runner.get_all_status())
}

/// Serve the bridge until the process exits.
pub async fn serve(runner: Arc<GridRunner>, bind_addr: String) {
    let app = router(runner);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "bridge failed to bind");
            return;
        }
    };
    info!(addr = %bind_addr, "bridge listening");
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "bridge server failed");
    }
}
