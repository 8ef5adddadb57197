//! Read-only HTTP API for health checks, status, and workflow lookup

use crate::chain::ChainManager;
use crate::config::ApiConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::state::WorkflowStore;
use crate::workflow::{ContractInvokeRecord, SyncRecord};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn WorkflowStore>,
    pub chain_manager: Arc<ChainManager>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/chains", get(get_chains))
        .route("/stats", get(get_stats))
        .route("/workflows/invoke/:id", get(get_invoke))
        .route("/workflows/sync/:id", get(get_sync))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> RelayerResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Config(format!("Cannot bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayerError::Internal(e.to_string()))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify all dependencies
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.store.health_check().await.is_ok();

    let chain_health = state.chain_manager.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let status = if db_ok && chains_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: db_ok && chains_ok,
            database: db_ok,
            chains: chains_ok,
            details: chain_health
                .into_iter()
                .map(|(chain_id, healthy)| ChainHealth { chain_id, healthy })
                .collect(),
        }),
    )
}

/// Get connected chains
async fn get_chains(State(state): State<AppState>) -> impl IntoResponse {
    let mut chains = state.chain_manager.connected_chains();
    chains.sort();
    Json(ChainsResponse { chains })
}

/// Workflow counts by status
async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let invoke = state
        .store
        .invoke_status_counts()
        .await?
        .into_iter()
        .map(|(status, count)| (status.to_string(), count))
        .collect();
    let sync = state
        .store
        .sync_status_counts()
        .await?
        .into_iter()
        .map(|(status, count)| (status.to_string(), count))
        .collect();
    let pending_syncs = state.store.pending_sync_ids().await?.len();

    Ok(Json(StatsResponse {
        contract_invoke: invoke,
        token_sync: sync,
        pending_syncs,
    }))
}

async fn get_invoke(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ContractInvokeRecord>, ApiError> {
    state
        .store
        .get_invoke(&id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(id))
}

async fn get_sync(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SyncRecord>, ApiError> {
    state
        .store
        .get_sync(&id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(id))
}

enum ApiError {
    NotFound(String),
    Internal(RelayerError),
}

impl From<RelayerError> for ApiError {
    fn from(e: RelayerError) -> Self {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            ApiError::NotFound(id) => (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: format!("workflow {} not found", id),
                }),
            )
                .into_response(),
            ApiError::Internal(e) => {
                warn!("API request failed: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: "internal error".to_string(),
                    }),
                )
                    .into_response()
            }
        }
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: String,
    healthy: bool,
}

#[derive(Serialize)]
struct ChainsResponse {
    chains: Vec<String>,
}

#[derive(Serialize)]
struct StatsResponse {
    contract_invoke: BTreeMap<String, u64>,
    token_sync: BTreeMap<String, u64>,
    pending_syncs: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}
