// 🌐 REST API - thin JSON layer over the reconciliation core
//
// Every handler answers with the same envelope: { success, data, error }.
// Blocking work (SQLite, dataset parsing) runs on the blocking pool.

use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::db::get_voting_dates;
use crate::error::ReconcileError;
use crate::model::{parse_voting_date, BfsCode};
use crate::reconciliation::{ReconciliationEngine, VerdictStatus};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
    pub engine: Arc<ReconciliationEngine>,
}

impl AppState {
    pub fn new(conn: Connection, engine: ReconciliationEngine) -> Self {
        AppState {
            db: Arc::new(Mutex::new(conn)),
            engine: Arc::new(engine),
        }
    }
}

fn lock(db: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    // the connection is read-only, a panicked holder cannot leave it half-written
    db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// API Response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>, data: Option<T>) -> Self {
        Self {
            success: false,
            data,
            error: Some(message.into()),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        let status = if err.is_bad_request() {
            StatusCode::BAD_REQUEST
        } else if err.is_not_found() {
            StatusCode::NOT_FOUND
        } else {
            error!(error = %err, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        };
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        error!(error = %err, "blocking task failed");
        ApiError::internal("internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::<()>::failed(self.message, None))).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

fn parse_code(raw: &str) -> Result<BfsCode, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid municipality code '{raw}'")))
}

// ============================================================================
// API Handlers
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ReconcileParams {
    date: Option<String>,
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PredecessorParams {
    as_of: Option<String>,
}

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/voting-dates - Dates with results and their proposal counts
async fn voting_dates(State(state): State<AppState>) -> ApiResult {
    let db = state.db.clone();
    let dates = tokio::task::spawn_blocking(move || get_voting_dates(&lock(&db))).await??;
    Ok(Json(ApiResponse::ok(dates)).into_response())
}

/// GET /api/municipalities - Current municipalities formed by a merger
async fn municipalities(State(state): State<AppState>) -> ApiResult {
    let listing = state.engine.graph().mergeable_municipalities();
    Ok(Json(ApiResponse::ok(listing)).into_response())
}

/// GET /api/reconcile?date=&code= - Reconcile one municipality on one date
async fn reconcile(State(state): State<AppState>, Query(params): Query<ReconcileParams>) -> ApiResult {
    let date = params
        .date
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("missing query parameter 'date'"))?;
    let date = parse_voting_date(date)?;
    let code = params
        .code
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("missing query parameter 'code'"))?;
    let code = parse_code(code)?;

    let verdict = tokio::task::spawn_blocking(move || {
        let conn = lock(&state.db);
        state.engine.reconcile(&*conn, date, code)
    })
    .await??;

    if verdict.status == VerdictStatus::ProposalAlignmentError {
        let body = ApiResponse::failed("proposal alignment error", Some(verdict));
        return Ok((StatusCode::CONFLICT, Json(body)).into_response());
    }

    Ok(Json(ApiResponse::ok(verdict)).into_response())
}

/// GET /api/predecessors/:code?as_of= - Resolved predecessor set
async fn predecessors(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(params): Query<PredecessorParams>,
) -> ApiResult {
    let code = parse_code(&code)?;
    let as_of = params.as_of.as_deref().map(parse_voting_date).transpose()?;

    let set = state.engine.graph().resolve_predecessors(code, as_of)?;
    Ok(Json(ApiResponse::ok(set)).into_response())
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/voting-dates", get(voting_dates))
        .route("/municipalities", get(municipalities))
        .route("/reconcile", get(reconcile))
        .route("/predecessors/:code", get(predecessors))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
