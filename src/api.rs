use std::{str::FromStr, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Extension, Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use retroledger_core::{
    models::read::{
        AdjustmentView, AggregateView, CapitalView, ClosedPeriodView, LedgerEntryView, ProfitView,
    },
    AdjustmentCategory, AdjustmentStatus, CreateAdjustmentCommand, CreateCompanyCommand,
    ParsePeriodError, Period, RequestId, StorageBackend, StorageError,
};

use crate::auth::{auth_middleware, CallerIdentity};
use crate::config::AuthConfig;
use crate::error::{EngineError, RejectionClass};
use crate::posting::PostingOutcome;
use crate::workflow::AdjustmentWorkflow;

#[derive(Clone)]
pub struct AppState {
    pub workflow: Arc<AdjustmentWorkflow>,
    pub storage: Arc<dyn StorageBackend>,
    pub metrics: PrometheusHandle,
}

/// Everything except /health and /metrics runs behind the identity
/// middleware; the caller name it resolves is what lands in the audit fields.
pub fn router(state: AppState, auth: Arc<AuthConfig>) -> Router {
    let protected = Router::new()
        .route(
            "/adjustments",
            post(create_adjustment).get(list_adjustments),
        )
        .route("/adjustments/:id", get(get_adjustment))
        .route("/adjustments/:id/approve", post(approve_adjustment))
        .route("/adjustments/:id/reject", post(reject_adjustment))
        .route("/companies", post(create_company))
        .route("/companies/:id/capital", get(get_capital))
        .route("/closed-periods", post(close_period))
        .route(
            "/divisions/:division/closed-periods",
            get(list_closed_periods),
        )
        .route(
            "/divisions/:division/periods/:month/aggregate",
            get(get_aggregate),
        )
        .route(
            "/divisions/:division/periods/:month/ledger",
            get(get_ledger),
        )
        .route(
            "/divisions/:division/periods/:month/profit",
            get(get_profit),
        )
        .route(
            "/divisions/:division/periods/:month/profit-base",
            put(set_profit_base),
        )
        .route_layer(middleware::from_fn(auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .merge(protected)
        .layer(Extension(auth))
        .with_state(state)
}

pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        Self(EngineError::Storage(e))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    kind: &'static str,
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Validation(_) | EngineError::IneligiblePeriod { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EngineError::InvalidStateTransition { .. } | EngineError::ConcurrencyConflict(_) => {
                StatusCode::CONFLICT
            }
            EngineError::PostingFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::RequestNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Storage(e) => match e {
                StorageError::CompanyNotFound(_) | StorageError::RequestNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                StorageError::CompanyAlreadyExists(_)
                | StorageError::PeriodAlreadyClosed { .. } => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        };
        let kind = match &self.0 {
            EngineError::Storage(StorageError::CompanyAlreadyExists(_))
            | EngineError::Storage(StorageError::PeriodAlreadyClosed { .. }) => {
                RejectionClass::BusinessRule
            }
            EngineError::Storage(StorageError::CompanyNotFound(_))
            | EngineError::Storage(StorageError::RequestNotFound(_)) => RejectionClass::NotFound,
            other => other.class(),
        };
        let body = ErrorBody {
            success: false,
            kind: kind.as_str(),
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct PostingView {
    capital_delta: Decimal,
    profit_delta: Decimal,
    ledger_entry_written: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    capital_balance: Option<Decimal>,
    negative_balance: bool,
}

impl From<&PostingOutcome> for PostingView {
    fn from(outcome: &PostingOutcome) -> Self {
        Self {
            capital_delta: outcome.capital_delta,
            profit_delta: outcome.profit_delta,
            ledger_entry_written: outcome.ledger_entry_written,
            capital_balance: outcome.capital_balance,
            negative_balance: outcome.negative_balance,
        }
    }
}

#[derive(Serialize)]
struct Ack {
    success: bool,
}

fn parse_request_id(raw: &str) -> Result<RequestId, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|_| EngineError::Validation(format!("invalid request id: {}", raw)).into())
}

fn parse_period(raw: &str) -> Result<Period, ApiError> {
    raw.parse()
        .map_err(|e: ParsePeriodError| EngineError::Validation(e.to_string()).into())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

#[derive(Deserialize)]
struct CreateAdjustmentBody {
    month: Period,
    division: String,
    category: String,
    company_id: i64,
    nominal: Decimal,
    description: String,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Serialize)]
struct CreateResponse {
    success: bool,
    request: AdjustmentView,
    #[serde(skip_serializing_if = "Option::is_none")]
    posting: Option<PostingView>,
}

async fn create_adjustment(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
    Json(body): Json<CreateAdjustmentBody>,
) -> Result<impl IntoResponse, ApiError> {
    let category = AdjustmentCategory::from_str(&body.category)
        .map_err(|e| EngineError::Validation(e.to_string()))?;
    let command = CreateAdjustmentCommand {
        period: body.month,
        division: Arc::from(body.division.as_str()),
        category,
        company_id: body.company_id,
        nominal: body.nominal,
        description: Arc::from(body.description.as_str()),
        notes: body.notes.as_deref().map(Arc::from),
    };
    let outcome = state.workflow.create_request(&command, &identity.name)?;
    Ok((
        StatusCode::CREATED,
        Json(CreateResponse {
            success: true,
            request: AdjustmentView::from(&outcome.request),
            posting: outcome.posting.as_ref().map(PostingView::from),
        }),
    ))
}

#[derive(Deserialize)]
struct ListParams {
    division: Option<String>,
    status: Option<String>,
}

async fn list_adjustments(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(AdjustmentStatus::from_str)
        .transpose()
        .map_err(|e| EngineError::Validation(e.to_string()))?;
    let requests = state
        .storage
        .list_requests(params.division.as_deref(), status)?;
    let views: Vec<AdjustmentView> = requests.iter().map(AdjustmentView::from).collect();
    Ok(Json(views))
}

async fn get_adjustment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_request_id(&id)?;
    let request = state.workflow.get_request(id)?;
    Ok(Json(AdjustmentView::from(&request)))
}

#[derive(Serialize)]
struct DecisionResponse {
    success: bool,
    request: AdjustmentView,
    #[serde(skip_serializing_if = "Option::is_none")]
    posting: Option<PostingView>,
}

async fn approve_adjustment(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_request_id(&id)?;
    let outcome = state.workflow.approve(id, &identity.name)?;
    let request = state.workflow.get_request(id)?;
    Ok(Json(DecisionResponse {
        success: true,
        request: AdjustmentView::from(&request),
        posting: Some(PostingView::from(&outcome)),
    }))
}

#[derive(Deserialize)]
struct RejectBody {
    reason: String,
}

async fn reject_adjustment(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
    Path(id): Path<String>,
    Json(body): Json<RejectBody>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_request_id(&id)?;
    let request = state.workflow.reject(id, &identity.name, &body.reason)?;
    Ok(Json(DecisionResponse {
        success: true,
        request: AdjustmentView::from(&request),
        posting: None,
    }))
}

#[derive(Deserialize)]
struct CreateCompanyBody {
    id: i64,
    name: String,
    division: String,
    #[serde(default)]
    opening_capital: Decimal,
}

async fn create_company(
    State(state): State<AppState>,
    Json(body): Json<CreateCompanyBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.storage.create_company(&CreateCompanyCommand {
        id: body.id,
        name: Arc::from(body.name.as_str()),
        division: Arc::from(body.division.as_str()),
        opening_capital: body.opening_capital,
    })?;
    let company = state.storage.get_company(body.id)?;
    Ok((StatusCode::CREATED, Json(CapitalView::from(&company))))
}

async fn get_capital(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let company = state.storage.get_company(id)?;
    Ok(Json(CapitalView::from(&company)))
}

#[derive(Deserialize)]
struct ClosePeriodBody {
    division: String,
    month: Period,
}

async fn close_period(
    State(state): State<AppState>,
    Json(body): Json<ClosePeriodBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.storage.close_period(&body.division, body.month)?;
    Ok((StatusCode::CREATED, Json(Ack { success: true })))
}

async fn list_closed_periods(
    State(state): State<AppState>,
    Path(division): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let periods = state.storage.list_closed_periods(&division)?;
    let views: Vec<ClosedPeriodView> = periods.iter().map(ClosedPeriodView::from).collect();
    Ok(Json(views))
}

async fn get_aggregate(
    State(state): State<AppState>,
    Path((division, month)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let period = parse_period(&month)?;
    match state.storage.get_aggregate(&division, period)? {
        Some(aggregate) => Ok(Json(AggregateView::from(&aggregate)).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                success: false,
                kind: RejectionClass::NotFound.as_str(),
                error: format!("no adjustments recorded for {} {}", division, period),
            }),
        )
            .into_response()),
    }
}

async fn get_ledger(
    State(state): State<AppState>,
    Path((division, month)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let period = parse_period(&month)?;
    let entries = state.storage.get_ledger_entries(&division, period)?;
    let views: Vec<LedgerEntryView> = entries.iter().map(LedgerEntryView::from).collect();
    Ok(Json(views))
}

async fn get_profit(
    State(state): State<AppState>,
    Path((division, month)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let period = parse_period(&month)?;
    let profit = state.storage.get_profit(&division, period)?;
    Ok(Json(ProfitView::new(&division, period, profit)))
}

#[derive(Deserialize)]
struct ProfitBaseBody {
    amount: Decimal,
}

async fn set_profit_base(
    State(state): State<AppState>,
    Path((division, month)): Path<(String, String)>,
    Json(body): Json<ProfitBaseBody>,
) -> Result<impl IntoResponse, ApiError> {
    let period = parse_period(&month)?;
    state.storage.set_base_profit(&division, period, body.amount)?;
    Ok(Json(Ack { success: true }))
}
