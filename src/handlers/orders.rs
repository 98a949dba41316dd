use crate::{
    auth::Actor,
    entities::{order, order_item},
    handlers::common::{created_response, validate_input, CreatedResult, ReasonBody},
    services::{
        fulfillment::FulfillmentService, order_intake::CreateOrderRequest,
        payments::PaymentConfirmation, OrderDetails,
    },
    ApiResponse, ApiResult, AppState,
};
use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn orders_routes() -> Router<AppState> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:order_number", get(get_order))
        .route("/orders/:order_number/cancel", post(cancel_order))
        .route("/orders/:order_number/payment/verify", post(verify_payment))
        .route("/orders/:order_number/payment/retry", post(retry_payment))
        .route("/orders/:order_number/assign", post(assign_delivery_agent))
        .route("/order-items/:item_id/advance", post(advance_item))
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AdvanceItemBody {
    pub target: order_item::FulfillmentStatus,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AssignAgentBody {
    pub agent_id: Uuid,
}

/// Buy-now checkout with explicit lines
async fn create_order(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<CreateOrderRequest>,
) -> CreatedResult<OrderDetails> {
    let details = state.services.intake.create_order(actor, payload).await?;
    Ok(created_response(details))
}

async fn get_order(
    State(state): State<AppState>,
    actor: Actor,
    Path(order_number): Path<String>,
) -> ApiResult<OrderDetails> {
    let details = fulfillment(&state).get_order(actor, &order_number).await?;
    Ok(Json(ApiResponse::success(details)))
}

async fn cancel_order(
    State(state): State<AppState>,
    actor: Actor,
    Path(order_number): Path<String>,
    Json(payload): Json<ReasonBody>,
) -> ApiResult<OrderDetails> {
    validate_input(&payload)?;
    let details = fulfillment(&state)
        .cancel_order(actor, &order_number, &payload.reason)
        .await?;
    Ok(Json(ApiResponse::success(details)))
}

async fn verify_payment(
    State(state): State<AppState>,
    actor: Actor,
    Path(order_number): Path<String>,
    Json(payload): Json<PaymentConfirmation>,
) -> ApiResult<order::Model> {
    let order = state
        .services
        .payments
        .verify_payment(actor, &order_number, payload)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

async fn retry_payment(
    State(state): State<AppState>,
    actor: Actor,
    Path(order_number): Path<String>,
) -> ApiResult<order::Model> {
    let order = state
        .services
        .payments
        .retry_payment(actor, &order_number)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

async fn assign_delivery_agent(
    State(state): State<AppState>,
    actor: Actor,
    Path(order_number): Path<String>,
    Json(payload): Json<AssignAgentBody>,
) -> ApiResult<OrderDetails> {
    let details = fulfillment(&state)
        .assign_delivery_agent(actor, &order_number, payload.agent_id)
        .await?;
    Ok(Json(ApiResponse::success(details)))
}

/// Warehouse pick / pack / ship step for one item
async fn advance_item(
    State(state): State<AppState>,
    actor: Actor,
    Path(item_id): Path<Uuid>,
    Json(payload): Json<AdvanceItemBody>,
) -> ApiResult<order_item::Model> {
    let item = fulfillment(&state)
        .advance_item(actor, item_id, payload.target)
        .await?;
    Ok(Json(ApiResponse::success(item)))
}

fn fulfillment(state: &AppState) -> &FulfillmentService {
    &state.services.fulfillment
}
