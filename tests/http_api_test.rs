mod common;

use axum::http::{Method, StatusCode};
use common::{response_json, TestApp, TEST_OTP};
use fulfillment_api::auth::Actor;
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

fn order_body(variant_id: Uuid, quantity: i32, payment_method: &str) -> serde_json::Value {
    json!({
        "items": [{ "variant_id": variant_id, "quantity": quantity }],
        "shipping_address": serde_json::to_value(common::address()).unwrap(),
        "payment_method": payment_method,
    })
}

#[tokio::test]
async fn health_reports_database_up() {
    let app = TestApp::new().await;

    let response = app.request(Method::GET, "/health", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["status"], "up");
    assert_eq!(body["database"]["status"], "up");

    let response = app.request(Method::GET, "/health/live", None, None).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn requests_without_an_actor_are_unauthorized() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("HTTP-ANON", dec!(100), 5).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(order_body(variant.id, 1, "cod")),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = response_json(response).await;
    assert_eq!(body["code"], "unauthorized");
    assert_eq!(app.stock_of(variant.id).await, 5);
}

#[tokio::test]
async fn order_lifecycle_over_http() {
    let app = TestApp::new().await;
    let customer = Actor::customer(Uuid::new_v4());
    let warehouse = Actor::warehouse(Uuid::new_v4());
    let admin = Actor::admin(Uuid::new_v4());
    let agent = Actor::delivery_agent(Uuid::new_v4());
    let variant = app.seed_variant("HTTP-1", dec!(100), 5).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(order_body(variant.id, 1, "cod")),
            Some(customer),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    assert_eq!(body["success"], true);
    let order_number = body["data"]["order"]["order_number"].as_str().unwrap().to_string();
    let item_id = body["data"]["items"][0]["id"].as_str().unwrap().to_string();

    for target in ["picked", "packed", "shipped"] {
        let response = app
            .request(
                Method::POST,
                &format!("/api/v1/order-items/{}/advance", item_id),
                Some(json!({ "target": target })),
                Some(warehouse),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK, "advance to {}", target);
    }

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/cancel", order_number),
            Some(json!({ "reason": "too late" })),
            Some(customer),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = response_json(response).await;
    assert_eq!(body["code"], "cancellation_window_closed");

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/orders/{}/assign", order_number),
            Some(json!({ "agent_id": agent.id })),
            Some(admin),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/order-items/{}/otp/send", item_id),
            None,
            Some(agent),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/order-items/{}/otp/verify", item_id),
            Some(json!({ "code": "9999" })),
            Some(agent),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(response_json(response).await["code"], "invalid_otp");

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/order-items/{}/otp/verify", item_id),
            Some(json!({ "code": TEST_OTP })),
            Some(agent),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["data"]["status"], "delivered");

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", order_number),
            None,
            Some(customer),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["order"]["status"], "delivered");
    assert_eq!(body["data"]["order"]["is_paid"], true);
}

#[tokio::test]
async fn other_customers_cannot_read_an_order() {
    let app = TestApp::new().await;
    let owner = Actor::customer(Uuid::new_v4());
    let variant = app.seed_variant("HTTP-PRIV", dec!(100), 5).await;
    let details = app
        .place_order(
            owner,
            &[(variant.id, 1)],
            fulfillment_api::entities::order::PaymentMethod::Cod,
        )
        .await
        .unwrap();

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", details.order.order_number),
            None,
            Some(Actor::customer(Uuid::new_v4())),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .request(Method::GET, "/api/v1/orders/ORD-00000000-NOPE", None, Some(owner))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn insufficient_stock_maps_to_conflict() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("HTTP-LOW", dec!(100), 1).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(order_body(variant.id, 2, "cod")),
            Some(Actor::customer(Uuid::new_v4())),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(response_json(response).await["code"], "insufficient_stock");
}

#[tokio::test]
async fn cart_routes_merge_and_show_the_cart() {
    let app = TestApp::new().await;
    let customer = Actor::customer(Uuid::new_v4());
    let variant = app.seed_variant("HTTP-CART", dec!(100), 5).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/carts/reconcile",
            Some(json!({
                "items": [{ "variant_id": variant.id, "quantity": 2 }],
                "merge_token": "browser-tab-1"
            })),
            Some(customer),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["merged"][0]["quantity_in_cart"], 2);

    let response = app
        .request(Method::GET, "/api/v1/carts/me", None, Some(customer))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["items"][0]["quantity"], 2);

    let response = app
        .request(
            Method::POST,
            "/api/v1/carts/checkout",
            Some(json!({
                "shipping_address": serde_json::to_value(common::address()).unwrap(),
                "payment_method": "cod"
            })),
            Some(customer),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(app.stock_of(variant.id).await, 3);
}

#[tokio::test]
async fn command_endpoint_routes_tagged_actions() {
    let app = TestApp::new().await;
    let customer = Actor::customer(Uuid::new_v4());
    let warehouse = Actor::warehouse(Uuid::new_v4());
    let variant = app.seed_variant("HTTP-CMD", dec!(100), 5).await;
    let details = app
        .place_order(
            customer,
            &[(variant.id, 1)],
            fulfillment_api::entities::order::PaymentMethod::Cod,
        )
        .await
        .unwrap();
    let item_id = details.items[0].id;

    let response = app
        .request(
            Method::POST,
            "/api/v1/commands",
            Some(json!({ "action": "advance_item", "item_id": item_id, "target": "picked" })),
            Some(warehouse),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["status"], "picked");

    let response = app
        .request(
            Method::POST,
            "/api/v1/commands",
            Some(json!({
                "action": "cancel_order",
                "order_number": details.order.order_number,
                "reason": "changed my mind"
            })),
            Some(customer),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        response_json(response).await["code"],
        "cancellation_window_closed"
    );
}

#[tokio::test]
async fn return_routes_walk_the_sign_off() {
    let app = TestApp::new().await;
    let customer = Actor::customer(Uuid::new_v4());
    let variant = app.seed_variant("HTTP-RET", dec!(100), 5).await;
    let (details, agent) = app.delivered_order(customer, variant.id).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/returns",
            Some(json!({
                "order_item_id": details.items[0].id,
                "reason": "arrived damaged",
                "user_upi": "asha@upi"
            })),
            Some(customer),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let return_id = response_json(response).await["data"]["id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/returns/{}/pickup", return_id),
            Some(json!({ "outcome": "collected" })),
            Some(agent),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/returns/{}/warehouse", return_id),
            Some(json!({ "decision": "approved", "comment": "intact" })),
            Some(Actor::warehouse(Uuid::new_v4())),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/returns/{}/admin", return_id),
            Some(json!({ "decision": "approved", "comment": "refund", "refund_amount": "100" })),
            Some(Actor::admin(Uuid::new_v4())),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/returns/{}", return_id),
            None,
            Some(customer),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["data"]["status"], "refunded");
}
