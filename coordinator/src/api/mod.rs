//! HTTP API for health checks, swap status and negotiation

use crate::chain::{BlockRef, ChainManager};
use crate::config::ApiConfig;
use crate::error::{SwapError, SwapResult};
use crate::state::SwapStore;
use crate::swap::{SwapCoordinator, SwapId, SwapInstance, SwapRequest, SwapStatus, SwapTerms};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers::types::H256;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SwapStore>,
    pub chain_manager: Arc<ChainManager>,
    pub coordinator: Arc<SwapCoordinator>,
    pub started_at: Instant,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/swaps", post(initiate_swap))
        .route("/swaps/accept", post(accept_swap))
        .route("/swaps/:id", get(get_swap))
        .route("/swaps/:id/claim", post(claim_swap))
        .route("/swaps/:id/abandon", post(abandon_swap))
        .route("/validators", get(get_validators))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> SwapResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| SwapError::Config(format!("cannot bind API address {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| SwapError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

/// Maps core errors onto HTTP responses
struct ApiError(SwapError);

impl From<SwapError> for ApiError {
    fn from(e: SwapError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SwapError::SwapNotFound(_) | SwapError::ChainNotFound { .. } => StatusCode::NOT_FOUND,
            e => {
                error!("API request failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.kind().to_string(),
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
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

/// Get coordinator status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let chain_health = state.chain_manager.health_check().await;

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        connected_chains: state.chain_manager.connected_chains(),
        chain_status: chain_health
            .into_iter()
            .map(|(chain_id, healthy)| ChainHealth { chain_id, healthy })
            .collect(),
        active_swaps: state.coordinator.active_count(),
    })
}

async fn get_swap(
    State(state): State<AppState>,
    Path(id): Path<SwapId>,
) -> Result<Json<SwapResponse>, ApiError> {
    let swap = state.coordinator.get_swap(id).await?;
    Ok(Json(SwapResponse::from(&swap)))
}

async fn initiate_swap(
    State(state): State<AppState>,
    Json(request): Json<SwapRequest>,
) -> Result<(StatusCode, Json<InitiateResponse>), ApiError> {
    let (swap, terms) = state.coordinator.initiate(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(InitiateResponse {
            swap: SwapResponse::from(&swap),
            terms,
        }),
    ))
}

async fn accept_swap(
    State(state): State<AppState>,
    Json(terms): Json<SwapTerms>,
) -> Result<Json<SwapResponse>, ApiError> {
    let swap = state.coordinator.accept(terms).await?;
    Ok(Json(SwapResponse::from(&swap)))
}

async fn claim_swap(
    State(state): State<AppState>,
    Path(id): Path<SwapId>,
) -> Result<Json<Vec<H256>>, ApiError> {
    Ok(Json(state.coordinator.claim(id).await?))
}

async fn abandon_swap(
    State(state): State<AppState>,
    Path(id): Path<SwapId>,
) -> Result<Json<SwapResponse>, ApiError> {
    let swap = state.coordinator.abandon(id).await?;
    Ok(Json(SwapResponse::from(&swap)))
}

#[derive(Deserialize)]
struct ValidatorQuery {
    chain_id: u64,
    block_hash: Option<String>,
}

async fn get_validators(
    State(state): State<AppState>,
    Query(query): Query<ValidatorQuery>,
) -> Result<Response, ApiError> {
    let block = match query.block_hash.as_deref() {
        None => None,
        Some(hash) => match H256::from_str(hash) {
            Ok(hash) => Some(BlockRef::Hash(hash)),
            Err(e) => {
                return Ok((StatusCode::BAD_REQUEST, format!("invalid block hash: {}", e)).into_response())
            }
        },
    };

    let handle = state.chain_manager.get(query.chain_id)?;
    let set = handle.registry.get_validator_set(block).await?;
    Ok(Json(set.as_ref().clone()).into_response())
}

// Response types

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

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
    chain_id: u64,
    healthy: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    connected_chains: Vec<u64>,
    chain_status: Vec<ChainHealth>,
    active_swaps: usize,
}

#[derive(Serialize)]
struct InitiateResponse {
    swap: SwapResponse,
    terms: SwapTerms,
}

#[derive(Serialize)]
struct LegResponse {
    chain_id: u64,
    leg_id: H256,
    lock_state: String,
    expiry: u64,
    lock_tx_ref: Option<H256>,
    submitted_tx: Option<H256>,
}

/// Public view of a swap. Never includes the pre-image.
#[derive(Serialize)]
struct SwapResponse {
    swap_id: SwapId,
    trade_id: String,
    role: String,
    status: SwapStatus,
    secret_hash: String,
    revealed: bool,
    side_a: LegResponse,
    side_b: LegResponse,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<&SwapInstance> for SwapResponse {
    fn from(swap: &SwapInstance) -> Self {
        let leg = |leg: &crate::swap::EscrowLeg| LegResponse {
            chain_id: leg.chain_id(),
            leg_id: leg.leg_id,
            lock_state: leg.lock_state().to_string(),
            expiry: leg.expiry,
            lock_tx_ref: leg.lock_tx_ref,
            submitted_tx: leg.submitted_tx,
        };
        Self {
            swap_id: swap.swap_id,
            trade_id: swap.trade_id.clone(),
            role: swap.role.as_str().to_string(),
            status: swap.status,
            secret_hash: swap.secret_hash.to_hex(),
            revealed: swap.secret().is_some(),
            side_a: leg(&swap.side_a),
            side_b: leg(&swap.side_b),
            created_at: swap.created_at,
            updated_at: swap.updated_at,
        }
    }
}
