use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use capture_core::{
    CaptureError, CaptureMetrics, HttpMethod, MetricsSnapshot, NetworkCollector,
    NetworkTransaction, NetworkRule, RuleApplicationResult, TransactionQuery, TransactionStatus,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info};

use crate::error::{InspectorError, StoreError};
use crate::repository::TransactionRepository;
use crate::rules::{ImportMode, ImportSummary, RuleService};

const DEFAULT_HISTORY_LIMIT: u32 = 100;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct ApiState {
    pub repository: TransactionRepository,
    pub rules: RuleService,
    pub metrics: Arc<CaptureMetrics>,
}

/// Query parameters for transaction listings.
/// One filter applies, in this order: search, method, status, time range.
/// `limit`/`offset` page the result.
#[derive(Debug, Default, Deserialize)]
pub struct TransactionParams {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub search: Option<String>,
    pub method: Option<String>,
    pub status: Option<String>,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

/// Response for transaction listings
#[derive(Serialize)]
pub struct TransactionsResponse {
    pub transactions: Vec<NetworkTransaction>,
    pub total_count: u64,
}

/// Response for a single transaction
#[derive(Serialize)]
pub struct TransactionDetail {
    pub transaction: NetworkTransaction,
    pub rule_applications: Vec<RuleApplicationResult>,
}

#[derive(Serialize, Deserialize)]
pub struct DeletedResponse {
    pub deleted: u64,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub transaction_count: u64,
    pub live_window: usize,
    pub methods: Vec<HttpMethod>,
    pub statuses: Vec<TransactionStatus>,
    pub capture: MetricsSnapshot,
}

#[derive(Deserialize)]
pub struct DeleteParams {
    pub older_than: Option<i64>,
}

#[derive(Deserialize)]
pub struct EnabledRequest {
    pub enabled: bool,
}

#[derive(Deserialize)]
pub struct ImportParams {
    #[serde(default)]
    pub mode: ImportMode,
}

#[derive(Deserialize)]
pub struct HistoryParams {
    pub limit: Option<u32>,
}

/// Error returned by handlers, rendered as `{"error": "..."}`
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RuleNotFound(id) => ApiError::NotFound(format!("rule not found: {}", id)),
            StoreError::Capture(e @ (CaptureError::InvalidRule { .. } | CaptureError::Serialization(_))) => {
                ApiError::BadRequest(e.to_string())
            }
            other => {
                error!("Store error while handling request: {}", other);
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// What a transaction listing asks for, ignoring paging
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Everything,
    Matching(TransactionQuery),
    /// A filter value no transaction can have
    Nothing,
}

impl TransactionParams {
    pub fn selection(&self) -> Selection {
        if let Some(search) = self.search.as_deref().filter(|s| !s.is_empty()) {
            return Selection::Matching(TransactionQuery::Search(search.to_string()));
        }
        if let Some(method) = self.method.as_deref().filter(|s| !s.is_empty()) {
            return Selection::Matching(TransactionQuery::ByMethod(HttpMethod::from(method)));
        }
        if let Some(status) = self.status.as_deref().filter(|s| !s.is_empty()) {
            return match status.parse::<TransactionStatus>() {
                Ok(status) => Selection::Matching(TransactionQuery::ByStatus(status)),
                Err(e) => {
                    debug!("Ignoring status filter: {}", e);
                    Selection::Nothing
                }
            };
        }
        if self.start.is_some() || self.end.is_some() {
            return Selection::Matching(TransactionQuery::TimeRange {
                start: self.start.unwrap_or(i64::MIN),
                end: self.end.unwrap_or(i64::MAX),
            });
        }
        Selection::Everything
    }
}

/// Build the REST router
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/api/transactions",
            get(list_transactions_handler).delete(clear_transactions_handler),
        )
        .route(
            "/api/transactions/:id",
            get(get_transaction_handler).delete(delete_transaction_handler),
        )
        .route("/api/stats", get(stats_handler))
        .route("/api/rules", get(list_rules_handler).post(save_rule_handler))
        .route("/api/rules/export", get(export_rules_handler))
        .route("/api/rules/import", post(import_rules_handler))
        .route("/api/rules/history", get(rule_history_handler))
        .route("/api/rules/:id", get(get_rule_handler).delete(delete_rule_handler))
        .route("/api/rules/:id/enabled", put(set_rule_enabled_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Serve `router` on `port` until `shutdown` fires
pub async fn serve(router: Router, port: u16, shutdown: CancellationToken) -> Result<(), InspectorError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("HTTP API listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("HTTP API stopped");
    Ok(())
}

/// Basic health check handler
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": "inspector"
    }))
}

async fn list_transactions_handler(
    State(state): State<ApiState>,
    Query(params): Query<TransactionParams>,
) -> ApiResult<Json<TransactionsResponse>> {
    let offset = params.offset.unwrap_or(0);

    let (transactions, total_count) = match params.selection() {
        Selection::Nothing => (Vec::new(), 0),
        Selection::Matching(filter) => {
            let matching = state.repository.query(&filter).await?;
            let total = matching.len() as u64;
            let page = matching
                .into_iter()
                .skip(offset as usize)
                .take(params.limit.map_or(usize::MAX, |limit| limit as usize))
                .collect();
            (page, total)
        }
        Selection::Everything => {
            let total = state.repository.transaction_count().await?;
            let page = match params.limit {
                Some(limit) => state.repository.paged(limit, offset).await?,
                None => state
                    .repository
                    .all()
                    .await?
                    .into_iter()
                    .skip(offset as usize)
                    .collect(),
            };
            (page, total)
        }
    };

    Ok(Json(TransactionsResponse {
        transactions,
        total_count,
    }))
}

async fn get_transaction_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TransactionDetail>> {
    let transaction = state
        .repository
        .by_id(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("transaction not found: {}", id)))?;
    let rule_applications = state.repository.rule_history_for(&id).await?;

    Ok(Json(TransactionDetail {
        transaction,
        rule_applications,
    }))
}

async fn clear_transactions_handler(
    State(state): State<ApiState>,
    Query(params): Query<DeleteParams>,
) -> ApiResult<Json<DeletedResponse>> {
    let deleted = match params.older_than {
        Some(timestamp) => state.repository.clear_older_than(timestamp).await?,
        None => state.repository.clear_all().await?,
    };
    Ok(Json(DeletedResponse { deleted }))
}

async fn delete_transaction_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.repository.delete(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("transaction not found: {}", id)))
    }
}

async fn stats_handler(State(state): State<ApiState>) -> ApiResult<Json<StatsResponse>> {
    let collector: &NetworkCollector = state.repository.collector();

    Ok(Json(StatsResponse {
        transaction_count: state.repository.transaction_count().await?,
        live_window: collector.len(),
        methods: state.repository.distinct_methods().await?,
        statuses: state.repository.distinct_statuses().await?,
        capture: state.metrics.snapshot(),
    }))
}

async fn list_rules_handler(State(state): State<ApiState>) -> ApiResult<Json<Vec<NetworkRule>>> {
    Ok(Json(state.rules.list().await?))
}

async fn get_rule_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<NetworkRule>> {
    Ok(Json(state.rules.get(&id).await?))
}

async fn save_rule_handler(
    State(state): State<ApiState>,
    Json(rule): Json<NetworkRule>,
) -> ApiResult<Json<NetworkRule>> {
    Ok(Json(state.rules.save(rule).await?))
}

async fn delete_rule_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.rules.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_rule_enabled_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<EnabledRequest>,
) -> ApiResult<Json<NetworkRule>> {
    Ok(Json(state.rules.set_enabled(&id, request.enabled).await?))
}

async fn export_rules_handler(State(state): State<ApiState>) -> ApiResult<Response> {
    let json = state.rules.export_json().await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], json).into_response())
}

async fn import_rules_handler(
    State(state): State<ApiState>,
    Query(params): Query<ImportParams>,
    body: String,
) -> ApiResult<Json<ImportSummary>> {
    Ok(Json(state.rules.import_json(&body, params.mode).await?))
}

async fn rule_history_handler(
    State(state): State<ApiState>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<Vec<RuleApplicationResult>>> {
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(Json(state.repository.rule_history(limit).await?))
}
