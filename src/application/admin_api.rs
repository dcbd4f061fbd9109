//! Operator HTTP surface

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::application::engine::{BulkCloseReport, DispatchReport, TradingEngine};
use crate::auth::{require_auth, ApiKeys, AuthConfigError};
use crate::domain::entities::exchange::Exchange;
use crate::domain::entities::position::{Position, PositionSide};
use crate::domain::entities::signal::{Signal, SignalKind};
use crate::domain::errors::{EngineError, ErrorSeverity};
use crate::domain::services::risk_gate::EffectiveIndex;
use crate::domain::services::trading_control::TradingStatus;
use crate::rate_limit::{create_rate_limiter, rate_limit_middleware, RateLimiterConfig};

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(error: EngineError) -> ApiError {
    let status = match &error {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::AlreadyClosed { .. } => StatusCode::CONFLICT,
        EngineError::ValidationRejected { .. } | EngineError::InvalidPrice { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        EngineError::PriceUnavailable { .. } | EngineError::IndexUnavailable { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        e if e.severity() == ErrorSeverity::Critical => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_GATEWAY,
    };
    (
        status,
        Json(ErrorResponse {
            code: error.error_code().to_string(),
            error: error.to_string(),
        }),
    )
}

fn bad_request(message: String) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message,
            code: "ERR_BAD_REQUEST".to_string(),
        }),
    )
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub trading: TradingStatus,
    pub index_degraded: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CloseRequest {
    pub exit_price: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CloseResponse {
    pub position: Position,
    pub pnl: f64,
    pub commission: f64,
    /// Venue-side closes still running; failures surface as reconciliation flags
    pub exchange_closes_pending: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PauseRequest {
    /// Omit to pause or resume every exchange
    pub exchange: Option<String>,
}

fn entry_kind() -> SignalKind {
    SignalKind::Entry
}

/// Signal pushed by an upstream strategy or webhook relay
#[derive(Debug, Serialize, Deserialize)]
pub struct SignalRequest {
    pub symbol: String,
    pub direction: PositionSide,
    #[serde(default = "entry_kind")]
    pub kind: SignalKind,
    pub price: f64,
    pub confidence: Option<f64>,
    pub source: Option<String>,
}

impl SignalRequest {
    fn into_signal(self) -> Signal {
        let mut signal = Signal::entry(self.symbol, self.direction, self.price).with_kind(self.kind);
        if let Some(confidence) = self.confidence {
            signal = signal.with_confidence(confidence);
        }
        if let Some(source) = self.source {
            signal = signal.with_source(source);
        }
        signal
    }
}

async fn health(State(engine): State<Arc<TradingEngine>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        trading: engine.trading_status(),
        index_degraded: engine.risk_index(Utc::now()).degraded,
    })
}

async fn list_positions(State(engine): State<Arc<TradingEngine>>) -> Result<Json<Vec<Position>>, ApiError> {
    engine.open_positions().await.map(Json).map_err(api_error)
}

async fn get_position(
    State(engine): State<Arc<TradingEngine>>,
    Path(position_id): Path<String>,
) -> Result<Json<Position>, ApiError> {
    engine.position(&position_id).await.map(Json).map_err(api_error)
}

async fn close_position(
    State(engine): State<Arc<TradingEngine>>,
    Path(position_id): Path<String>,
    body: Option<Json<CloseRequest>>,
) -> Result<Json<CloseResponse>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let closed = engine
        .close_position(&position_id, request.exit_price)
        .await
        .map_err(api_error)?;
    Ok(Json(CloseResponse {
        commission: closed.commission.as_ref().map(|c| c.amount).unwrap_or(0.0),
        pnl: closed.pnl,
        exchange_closes_pending: closed.flattening,
        position: closed.position,
    }))
}

fn parse_exchange(request: Option<Json<PauseRequest>>) -> Result<Option<Exchange>, ApiError> {
    match request.and_then(|Json(r)| r.exchange) {
        Some(name) => Exchange::from_str(&name).map(Some).map_err(bad_request),
        None => Ok(None),
    }
}

async fn pause(
    State(engine): State<Arc<TradingEngine>>,
    body: Option<Json<PauseRequest>>,
) -> Result<Json<TradingStatus>, ApiError> {
    engine.pause(parse_exchange(body)?);
    Ok(Json(engine.trading_status()))
}

async fn resume(
    State(engine): State<Arc<TradingEngine>>,
    body: Option<Json<PauseRequest>>,
) -> Result<Json<TradingStatus>, ApiError> {
    engine.resume(parse_exchange(body)?);
    Ok(Json(engine.trading_status()))
}

async fn emergency_close(State(engine): State<Arc<TradingEngine>>) -> Result<Json<BulkCloseReport>, ApiError> {
    engine.emergency_close_all().await.map(Json).map_err(api_error)
}

async fn dispatch_signal(
    State(engine): State<Arc<TradingEngine>>,
    Json(request): Json<SignalRequest>,
) -> Result<Json<DispatchReport>, ApiError> {
    if request.symbol.trim().is_empty() {
        return Err(bad_request("symbol must not be empty".to_string()));
    }
    engine
        .dispatch_signal(&request.into_signal())
        .await
        .map(Json)
        .map_err(api_error)
}

async fn risk_index(State(engine): State<Arc<TradingEngine>>) -> Json<EffectiveIndex> {
    Json(engine.risk_index(Utc::now()))
}

/// `/health` is open; everything else needs a bearer key and counts against the rate limit
pub fn router(engine: Arc<TradingEngine>, keys: Arc<ApiKeys>, requests_per_minute: u32) -> Router {
    let limiter = create_rate_limiter(RateLimiterConfig {
        requests_per_minute,
    });

    let protected = Router::new()
        .route("/positions", get(list_positions))
        .route("/positions/:id", get(get_position))
        .route("/positions/:id/close", post(close_position))
        .route("/admin/pause", post(pause))
        .route("/admin/resume", post(resume))
        .route("/admin/emergency-close", post(emergency_close))
        .route("/risk-index", get(risk_index))
        .route("/signals", post(dispatch_signal))
        .route_layer(middleware::from_fn_with_state(keys, require_auth))
        .route_layer(middleware::from_fn_with_state(limiter, rate_limit_middleware));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

/// Serve the admin API until `shutdown` flips to true
pub async fn serve(
    engine: Arc<TradingEngine>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), AdminServerError> {
    let config = engine.config().clone();
    config.admin_api_keys.require_configured()?;

    let app = router(
        Arc::clone(&engine),
        Arc::new(config.admin_api_keys.clone()),
        config.admin_requests_per_minute,
    );
    let listener = tokio::net::TcpListener::bind(config.admin_bind_address.as_str()).await?;
    tracing::info!("Admin API listening on {}", config.admin_bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            tracing::info!("Admin API shutting down");
        })
        .await?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum AdminServerError {
    #[error("Admin API not configured: {0}")]
    Auth(#[from] AuthConfigError),

    #[error("Admin API I/O error: {0}")]
    Io(#[from] std::io::Error),
}
