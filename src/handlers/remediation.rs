use crate::{
    auth::Actor,
    entities::{
        replacement_request,
        return_request::{self, Decision, PickupStatus},
    },
    handlers::common::{created_response, CreatedResult},
    services::remediation::{
        CreateReplacementRequest, CreateReturnRequest, RemediationKind, RemediationRequest,
    },
    ApiResponse, ApiResult, AppState,
};
use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn remediation_routes() -> Router<AppState> {
    Router::new()
        .route("/returns", post(create_return))
        .route("/returns/:id", get(get_return))
        .route("/returns/:id/pickup", post(return_pickup))
        .route("/returns/:id/warehouse", post(return_warehouse))
        .route("/returns/:id/admin", post(return_admin))
        .route("/returns/:id/refund/retry", post(retry_refund))
        .route("/replacements", post(create_replacement))
        .route("/replacements/:id", get(get_replacement))
        .route("/replacements/:id/pickup", post(replacement_pickup))
        .route("/replacements/:id/warehouse", post(replacement_warehouse))
        .route("/replacements/:id/admin", post(replacement_admin))
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PickupBody {
    pub outcome: PickupStatus,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DecisionBody {
    pub decision: Decision,
    pub comment: String,
    #[serde(default)]
    pub refund_amount: Option<Decimal>,
}

async fn create_return(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<CreateReturnRequest>,
) -> CreatedResult<return_request::Model> {
    let created = state.services.remediation.create_return(actor, payload).await?;
    Ok(created_response(created))
}

async fn get_return(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> ApiResult<return_request::Model> {
    let request = state.services.remediation.get_return(actor, id).await?;
    Ok(Json(ApiResponse::success(request)))
}

async fn create_replacement(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<CreateReplacementRequest>,
) -> CreatedResult<replacement_request::Model> {
    let created = state
        .services
        .remediation
        .create_replacement(actor, payload)
        .await?;
    Ok(created_response(created))
}

async fn get_replacement(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> ApiResult<replacement_request::Model> {
    let request = state.services.remediation.get_replacement(actor, id).await?;
    Ok(Json(ApiResponse::success(request)))
}

async fn return_pickup(
    state: State<AppState>,
    actor: Actor,
    id: Path<Uuid>,
    body: Json<PickupBody>,
) -> ApiResult<RemediationRequest> {
    record_pickup(state, actor, RemediationKind::Return, id, body).await
}

async fn replacement_pickup(
    state: State<AppState>,
    actor: Actor,
    id: Path<Uuid>,
    body: Json<PickupBody>,
) -> ApiResult<RemediationRequest> {
    record_pickup(state, actor, RemediationKind::Replacement, id, body).await
}

async fn return_warehouse(
    state: State<AppState>,
    actor: Actor,
    id: Path<Uuid>,
    body: Json<DecisionBody>,
) -> ApiResult<RemediationRequest> {
    record_warehouse(state, actor, RemediationKind::Return, id, body).await
}

async fn replacement_warehouse(
    state: State<AppState>,
    actor: Actor,
    id: Path<Uuid>,
    body: Json<DecisionBody>,
) -> ApiResult<RemediationRequest> {
    record_warehouse(state, actor, RemediationKind::Replacement, id, body).await
}

async fn return_admin(
    state: State<AppState>,
    actor: Actor,
    id: Path<Uuid>,
    body: Json<DecisionBody>,
) -> ApiResult<RemediationRequest> {
    record_admin(state, actor, RemediationKind::Return, id, body).await
}

async fn replacement_admin(
    state: State<AppState>,
    actor: Actor,
    id: Path<Uuid>,
    body: Json<DecisionBody>,
) -> ApiResult<RemediationRequest> {
    record_admin(state, actor, RemediationKind::Replacement, id, body).await
}

async fn retry_refund(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> ApiResult<return_request::Model> {
    let request = state.services.remediation.retry_refund(actor, id).await?;
    Ok(Json(ApiResponse::success(request)))
}

async fn record_pickup(
    State(state): State<AppState>,
    actor: Actor,
    kind: RemediationKind,
    Path(id): Path<Uuid>,
    Json(body): Json<PickupBody>,
) -> ApiResult<RemediationRequest> {
    let request = state
        .services
        .remediation
        .decide_pickup(actor, kind, id, body.outcome, body.comment)
        .await?;
    Ok(Json(ApiResponse::success(request)))
}

async fn record_warehouse(
    State(state): State<AppState>,
    actor: Actor,
    kind: RemediationKind,
    Path(id): Path<Uuid>,
    Json(body): Json<DecisionBody>,
) -> ApiResult<RemediationRequest> {
    let request = state
        .services
        .remediation
        .decide_warehouse(actor, kind, id, body.decision, &body.comment)
        .await?;
    Ok(Json(ApiResponse::success(request)))
}

async fn record_admin(
    State(state): State<AppState>,
    actor: Actor,
    kind: RemediationKind,
    Path(id): Path<Uuid>,
    Json(body): Json<DecisionBody>,
) -> ApiResult<RemediationRequest> {
    let request = state
        .services
        .remediation
        .decide_admin(
            actor,
            kind,
            id,
            body.decision,
            &body.comment,
            body.refund_amount,
        )
        .await?;
    Ok(Json(ApiResponse::success(request)))
}
