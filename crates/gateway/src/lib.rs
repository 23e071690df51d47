//! HTTP gateway for chatspan.
//!
//! Exposes the chat SSE endpoint and conversation management REST routes.
//! Built on Axum.

pub mod api;

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use chatspan_config::AppConfig;
use chatspan_core::store::ConversationStore;
use chatspan_engine::LocalEngine;
use chatspan_session::ChatController;
use chatspan_store::SqliteStore;

/// Shared application state for the gateway.
pub struct GatewayState {
    pub controller: ChatController,
    pub store: Arc<dyn ConversationStore>,
}

pub type SharedState = Arc<GatewayState>;

/// Build the Axum router with all gateway routes.
pub fn build_router(state: SharedState, config: &AppConfig) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .nest("/api", api::api_router(state))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors_layer(&config.gateway.allowed_origins))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// CORS restricted to the configured origins. Unparseable entries are
/// skipped with a warning rather than poisoning the whole layer.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "Ignoring unparseable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
        ])
        .allow_headers([axum::http::header::CONTENT_TYPE])
        .max_age(std::time::Duration::from_secs(3600))
}

/// Start the gateway HTTP server: open the store, stand up the engine, and
/// serve until shutdown.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let store: Arc<dyn ConversationStore> = Arc::new(SqliteStore::new(&config.store.path).await?);
    let engine = Arc::new(LocalEngine::new(&config.model.name)?);

    let controller = ChatController::new(
        engine,
        Arc::clone(&store),
        config.context,
        config.preamble.clone(),
        config.sampling.params,
        config.sampling.max_response_tokens,
    );

    let state = Arc::new(GatewayState { controller, store });
    let app = build_router(state, &config);

    info!(addr = %addr, model = %config.model.name, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
