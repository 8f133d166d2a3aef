use axum::{
    Json, Router,
    http::StatusCode,
    routing::{get, post},
};
use hx_session::{ConnectionController, NameResolver};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

mod config;
mod session;

use config::ServiceConfig;
use session::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    service: &'static str,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct VersionResponse {
    service: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ServiceConfig::from_env()?;
    let registry = Arc::new(config.build_registry(reqwest::Client::new()));
    let controller = Arc::new(ConnectionController::new(registry));
    let names = Arc::new(NameResolver::new());
    names.track(controller.subscribe());

    let state = Arc::new(AppState::new(
        Arc::clone(&controller),
        names,
        config.required_chain,
    ));

    let required = config.required_chain.chain_id();
    tokio::spawn(async move {
        match controller.eager_connect(required).await {
            Ok(outcome) => info!(?outcome, "eager connection finished"),
            Err(err) => warn!(error = %err, "eager connection failed"),
        }
    });

    let app = router(state).layer(CorsLayer::permissive());

    info!("connect-service listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
    }
    info!("shutting down");
}

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/connectors", get(session::connectors))
        .route("/session", get(session::session))
        .route("/session/activate/{connector}", post(session::activate))
        .route("/session/deactivate", post(session::deactivate))
        .route("/session/switch-chain", post(session::switch_chain))
        .route("/session/pairing", get(session::pairing))
        .route("/session/provider-event", post(session::provider_event))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        service: "connect-service",
        status: "ok",
    })
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        service: "connect-service",
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn error_response(status: StatusCode, err: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

fn not_found(err: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
    error_response(StatusCode::NOT_FOUND, err)
}

fn conflict(err: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
    error_response(StatusCode::CONFLICT, err)
}
