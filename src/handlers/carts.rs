use crate::{
    auth::Actor,
    handlers::common::{created_response, CreatedResult},
    services::{
        cart_reconciler::{CartView, ReconcileOutcome, ReconcileRequest},
        order_intake::CheckoutCartRequest,
        OrderDetails,
    },
    ApiResponse, ApiResult, AppState,
};
use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};

pub fn carts_routes() -> Router<AppState> {
    Router::new()
        .route("/carts/me", get(get_cart))
        .route("/carts/reconcile", post(reconcile_guest_cart))
        .route("/carts/checkout", post(checkout_cart))
}

/// Merge a guest cart snapshot into the caller's server cart
async fn reconcile_guest_cart(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<ReconcileRequest>,
) -> ApiResult<ReconcileOutcome> {
    let outcome = state.services.carts.reconcile(actor, payload).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

async fn get_cart(State(state): State<AppState>, actor: Actor) -> ApiResult<CartView> {
    let cart = state.services.carts.get_cart(actor).await?;
    Ok(Json(ApiResponse::success(cart)))
}

/// Turn the caller's server cart into an order
async fn checkout_cart(
    State(state): State<AppState>,
    actor: Actor,
    Json(payload): Json<CheckoutCartRequest>,
) -> CreatedResult<OrderDetails> {
    let details = state.services.intake.checkout_cart(actor, payload).await?;
    Ok(created_response(details))
}
