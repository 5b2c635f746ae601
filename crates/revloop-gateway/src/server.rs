//! HTTP server implementation using Axum.

use axum::{
    Router,
    extract::State,
    routing::{get, post, put},
};
use revloop_core::RevloopConfig;
use revloop_core::error::{Result, RevloopError};
use revloop_core::traits::Outbound;
use revloop_db::Store;
use revloop_engine::Telemetry;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub config: RevloopConfig,
    /// Single SQLite store shared between request handlers and the
    /// in-process executor loop.
    pub store: Arc<tokio::sync::Mutex<Store>>,
    pub outbound: Arc<dyn Outbound>,
    pub telemetry: Telemetry,
    pub start_time: std::time::Instant,
}

/// Shared-secret auth middleware — validates the X-Revloop-Secret header.
/// An empty configured secret leaves the API open (local development).
async fn require_secret(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let expected = &state.config.gateway.shared_secret;
    if expected.is_empty() {
        return next.run(req).await;
    }

    let provided = req
        .headers()
        .get("X-Revloop-Secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided == expected {
        return next.run(req).await;
    }

    axum::response::Response::builder()
        .status(axum::http::StatusCode::UNAUTHORIZED)
        .header("Content-Type", "application/json")
        .body(axum::body::Body::from(
            serde_json::json!({"ok": false, "error": "Unauthorized — invalid or missing shared secret"})
                .to_string(),
        ))
        .unwrap()
}

/// Build the Axum router with all routes.
pub fn build_router(shared: Arc<AppState>) -> Router {
    // Protected routes — require the shared secret.
    let protected = Router::new()
        // Trigger ingestion + enrollment
        .route(
            "/api/v1/triggers/process-event",
            post(super::routes::process_event),
        )
        .route("/api/v1/sequences/enroll", post(super::routes::manual_enroll))
        // Executor — intended for an external scheduler on a fixed interval
        .route(
            "/_cron/automation-executor",
            post(super::routes::run_executor),
        )
        // Directory
        .route("/api/v1/businesses", get(super::routes::list_businesses))
        .route("/api/v1/businesses", post(super::routes::create_business))
        .route(
            "/api/v1/businesses/{id}/customers",
            post(super::routes::create_customer),
        )
        .route(
            "/api/v1/businesses/{id}/customers/sync",
            post(super::routes::sync_customer),
        )
        .route(
            "/api/v1/businesses/{id}/customers/{customer_id}/consent",
            put(super::routes::update_consent),
        )
        .route(
            "/api/v1/businesses/{id}/sequences",
            get(super::routes::list_sequences),
        )
        .route(
            "/api/v1/businesses/{id}/sequences",
            post(super::routes::create_sequence),
        )
        .route(
            "/api/v1/businesses/{id}/sequences/{sequence_id}/steps",
            get(super::routes::list_steps),
        )
        .route(
            "/api/v1/businesses/{id}/sequences/{sequence_id}/steps",
            post(super::routes::add_step),
        )
        .route(
            "/api/v1/businesses/{id}/sequences/{sequence_id}/status",
            put(super::routes::set_sequence_status),
        )
        .route(
            "/api/v1/businesses/{id}/templates",
            get(super::routes::list_templates),
        )
        .route(
            "/api/v1/businesses/{id}/templates",
            post(super::routes::create_template),
        )
        .route(
            "/api/v1/businesses/{id}/enrollments/{enrollment_id}/cancel",
            post(super::routes::cancel_enrollment),
        )
        .route("/api/v1/jobs/schedule", post(super::routes::schedule_job))
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_secret,
        ));

    // Public routes — provider webhooks carry their own HMAC signature.
    let public = Router::new()
        .route("/health", get(super::routes::health_check))
        .route(
            "/api/v1/webhooks/{provider}",
            post(super::webhooks::provider_webhook),
        );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(protected)
        .merge(public)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(shared)
}

/// Bind and serve until shutdown.
pub async fn start(shared: Arc<AppState>) -> Result<()> {
    let addr = format!(
        "{}:{}",
        shared.config.gateway.host, shared.config.gateway.port
    );
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RevloopError::Config(format!("Failed to bind {addr}: {e}")))?;
    tracing::info!("🚀 Revloop gateway listening on http://{addr}");

    let router = build_router(shared);
    axum::serve(listener, router)
        .await
        .map_err(|e| RevloopError::Channel(format!("Server error: {e}")))?;
    Ok(())
}
