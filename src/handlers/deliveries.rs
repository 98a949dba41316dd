use crate::{
    auth::Actor,
    entities::order_item,
    handlers::common::{validate_input, ReasonBody},
    ApiResponse, ApiResult, AppState,
};
use axum::{
    extract::{Path, State},
    response::Json,
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn deliveries_routes() -> Router<AppState> {
    Router::new()
        .route("/order-items/:item_id/delivery/failed", post(mark_delivery_failed))
        .route("/order-items/:item_id/delivery/reschedule", post(reschedule_delivery))
        .route("/order-items/:item_id/otp/send", post(send_otp))
        .route("/order-items/:item_id/otp/resend", post(resend_otp))
        .route("/order-items/:item_id/otp/verify", post(verify_otp))
}

#[derive(Debug, Deserialize, Serialize)]
pub struct VerifyOtpBody {
    pub code: String,
}

async fn mark_delivery_failed(
    State(state): State<AppState>,
    actor: Actor,
    Path(item_id): Path<Uuid>,
    Json(payload): Json<ReasonBody>,
) -> ApiResult<order_item::Model> {
    validate_input(&payload)?;
    let item = state
        .services
        .fulfillment
        .mark_delivery_failed(actor, item_id, &payload.reason)
        .await?;
    Ok(Json(ApiResponse::success(item)))
}

async fn reschedule_delivery(
    State(state): State<AppState>,
    actor: Actor,
    Path(item_id): Path<Uuid>,
) -> ApiResult<order_item::Model> {
    let item = state
        .services
        .fulfillment
        .reschedule_delivery(actor, item_id)
        .await?;
    Ok(Json(ApiResponse::success(item)))
}

async fn send_otp(
    State(state): State<AppState>,
    actor: Actor,
    Path(item_id): Path<Uuid>,
) -> ApiResult<order_item::Model> {
    let item = state.services.delivery.send_otp(actor, item_id).await?;
    Ok(Json(ApiResponse::success(item)))
}

async fn resend_otp(
    State(state): State<AppState>,
    actor: Actor,
    Path(item_id): Path<Uuid>,
) -> ApiResult<order_item::Model> {
    let item = state.services.delivery.resend_otp(actor, item_id).await?;
    Ok(Json(ApiResponse::success(item)))
}

/// Completes the handover when the customer's code matches
async fn verify_otp(
    State(state): State<AppState>,
    actor: Actor,
    Path(item_id): Path<Uuid>,
    Json(payload): Json<VerifyOtpBody>,
) -> ApiResult<order_item::Model> {
    let item = state
        .services
        .delivery
        .verify_otp(actor, item_id, &payload.code)
        .await?;
    Ok(Json(ApiResponse::success(item)))
}
