mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use common::TestApp;
use fulfillment_api::{
    auth::Actor,
    entities::{
        order::PaymentMethod,
        order_item,
        return_request::{Decision, PickupStatus, RefundMethod, RequestStatus},
    },
    errors::ServiceError,
    services::remediation::{
        CreateReplacementRequest, CreateReturnRequest, RemediationKind, RemediationRequest,
    },
};
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, Set};
use uuid::Uuid;

fn return_request(item_id: Uuid, upi: Option<&str>) -> CreateReturnRequest {
    CreateReturnRequest {
        order_item_id: item_id,
        reason: "arrived damaged".to_string(),
        user_upi: upi.map(str::to_string),
    }
}

fn expect_return(request: RemediationRequest) -> fulfillment_api::entities::return_request::Model {
    match request {
        RemediationRequest::Return(model) => model,
        other => panic!("expected a return, got {:?}", other),
    }
}

fn expect_replacement(
    request: RemediationRequest,
) -> fulfillment_api::entities::replacement_request::Model {
    match request {
        RemediationRequest::Replacement(model) => model,
        other => panic!("expected a replacement, got {:?}", other),
    }
}

#[tokio::test]
async fn cod_return_runs_all_three_stages_and_refunds_to_upi() {
    let app = TestApp::new().await;
    let customer = Actor::customer(Uuid::new_v4());
    let variant = app.seed_variant("RET-1", dec!(100), 5).await;
    let (details, agent) = app.delivered_order(customer, variant.id).await;
    let item_id = details.items[0].id;
    let remediation = &app.services().remediation;

    let err = remediation
        .create_return(customer, return_request(item_id, None))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let created = remediation
        .create_return(customer, return_request(item_id, Some("asha@upi")))
        .await
        .unwrap();
    assert_eq!(created.status, RequestStatus::Pending);
    assert_eq!(created.refund_method, RefundMethod::Upi);
    assert_eq!(created.user_upi.as_deref(), Some("asha@upi"));

    let collected = expect_return(
        remediation
            .decide_pickup(agent, RemediationKind::Return, created.id, PickupStatus::Collected, None)
            .await
            .unwrap(),
    );
    assert_eq!(collected.pickup_status, PickupStatus::Collected);
    assert_eq!(collected.status, RequestStatus::InProgress);

    let inspected = expect_return(
        remediation
            .decide_warehouse(
                Actor::warehouse(Uuid::new_v4()),
                RemediationKind::Return,
                created.id,
                Decision::Approved,
                "seal intact",
            )
            .await
            .unwrap(),
    );
    assert_eq!(inspected.warehouse_status, Decision::Approved);
    assert_eq!(inspected.warehouse_comment.as_deref(), Some("seal intact"));

    let refunded = expect_return(
        remediation
            .decide_admin(
                Actor::admin(Uuid::new_v4()),
                RemediationKind::Return,
                created.id,
                Decision::Approved,
                "refund in full",
                Some(dec!(100)),
            )
            .await
            .unwrap(),
    );
    assert_eq!(refunded.status, RequestStatus::Refunded);
    assert_eq!(refunded.admin_status, Decision::Approved);
    assert_eq!(refunded.refund_amount, Some(dec!(100)));
    assert!(refunded.refund_reference.is_some());
    assert!(refunded.refunded_at.is_some());

    let issued = app.refunds.issued();
    assert_eq!(issued.len(), 1);
    assert_eq!(issued[0].user_upi.as_deref(), Some("asha@upi"));
}

#[tokio::test]
async fn expired_return_window_is_not_eligible() {
    let app = TestApp::new().await;
    let customer = Actor::customer(Uuid::new_v4());
    let variant = app.seed_variant("OLD-1", dec!(100), 5).await;
    let (details, _) = app.delivered_order(customer, variant.id).await;
    let item_id = details.items[0].id;

    order_item::ActiveModel {
        id: Set(item_id),
        delivered_at: Set(Some(Utc::now() - Duration::days(10))),
        ..Default::default()
    }
    .update(app.db())
    .await
    .unwrap();

    let err = app
        .services()
        .remediation
        .create_return(customer, return_request(item_id, Some("asha@upi")))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotEligible(_));
}

#[tokio::test]
async fn undelivered_items_cannot_be_returned() {
    let app = TestApp::new().await;
    let customer = Actor::customer(Uuid::new_v4());
    let variant = app.seed_variant("NOTYET-1", dec!(100), 5).await;
    let details = app
        .place_order(customer, &[(variant.id, 1)], PaymentMethod::Cod)
        .await
        .unwrap();

    let err = app
        .services()
        .remediation
        .create_replacement(
            customer,
            CreateReplacementRequest {
                order_item_id: details.items[0].id,
                reason: "wrong colour".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotEligible(_));
}

#[tokio::test]
async fn one_active_return_per_item() {
    let app = TestApp::new().await;
    let customer = Actor::customer(Uuid::new_v4());
    let variant = app.seed_variant("DUP-1", dec!(100), 5).await;
    let (details, agent) = app.delivered_order(customer, variant.id).await;
    let item_id = details.items[0].id;
    let remediation = &app.services().remediation;

    let first = remediation
        .create_return(customer, return_request(item_id, Some("asha@upi")))
        .await
        .unwrap();
    let err = remediation
        .create_return(customer, return_request(item_id, Some("asha@upi")))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotEligible(_));

    remediation
        .decide_pickup(agent, RemediationKind::Return, first.id, PickupStatus::Collected, None)
        .await
        .unwrap();
    let rejected = expect_return(
        remediation
            .decide_warehouse(
                Actor::warehouse(Uuid::new_v4()),
                RemediationKind::Return,
                first.id,
                Decision::Rejected,
                "item shows wear",
            )
            .await
            .unwrap(),
    );
    assert_eq!(rejected.status, RequestStatus::Rejected);

    // A rejected request no longer blocks a fresh one.
    remediation
        .create_return(customer, return_request(item_id, Some("asha@upi")))
        .await
        .unwrap();
}

#[tokio::test]
async fn stages_must_be_signed_in_order() {
    let app = TestApp::new().await;
    let customer = Actor::customer(Uuid::new_v4());
    let variant = app.seed_variant("ORDER-1", dec!(100), 5).await;
    let (details, agent) = app.delivered_order(customer, variant.id).await;
    let remediation = &app.services().remediation;
    let warehouse = Actor::warehouse(Uuid::new_v4());
    let admin = Actor::admin(Uuid::new_v4());

    let created = remediation
        .create_return(customer, return_request(details.items[0].id, Some("asha@upi")))
        .await
        .unwrap();

    let err = remediation
        .decide_warehouse(warehouse, RemediationKind::Return, created.id, Decision::Approved, "ok")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidStage(_));

    let err = remediation
        .decide_admin(admin, RemediationKind::Return, created.id, Decision::Approved, "ok", Some(dec!(50)))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidStage(_));

    let stranger = Actor::delivery_agent(Uuid::new_v4());
    let err = remediation
        .decide_pickup(stranger, RemediationKind::Return, created.id, PickupStatus::Collected, None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotAssigned(_));

    remediation
        .decide_pickup(agent, RemediationKind::Return, created.id, PickupStatus::Collected, None)
        .await
        .unwrap();
    let err = remediation
        .decide_pickup(agent, RemediationKind::Return, created.id, PickupStatus::Collected, None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidStage(_));

    let err = remediation
        .decide_warehouse(warehouse, RemediationKind::Return, created.id, Decision::Approved, "  ")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    remediation
        .decide_warehouse(warehouse, RemediationKind::Return, created.id, Decision::Approved, "fine")
        .await
        .unwrap();

    let err = remediation
        .decide_admin(admin, RemediationKind::Return, created.id, Decision::Approved, "too much", Some(dec!(150)))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let err = remediation
        .decide_admin(warehouse, RemediationKind::Return, created.id, Decision::Approved, "ok", Some(dec!(50)))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Forbidden(_));
}

#[tokio::test]
async fn failed_pickup_blocks_warehouse_approval() {
    let app = TestApp::new().await;
    let customer = Actor::customer(Uuid::new_v4());
    let variant = app.seed_variant("NOPICK-1", dec!(100), 5).await;
    let (details, agent) = app.delivered_order(customer, variant.id).await;
    let remediation = &app.services().remediation;
    let warehouse = Actor::warehouse(Uuid::new_v4());

    let created = remediation
        .create_return(customer, return_request(details.items[0].id, Some("asha@upi")))
        .await
        .unwrap();
    remediation
        .decide_pickup(
            agent,
            RemediationKind::Return,
            created.id,
            PickupStatus::Failed,
            Some("customer absent".to_string()),
        )
        .await
        .unwrap();

    let err = remediation
        .decide_warehouse(warehouse, RemediationKind::Return, created.id, Decision::Approved, "looks fine")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidStage(_));

    // Rejecting after a failed pickup is still allowed.
    let rejected = expect_return(
        remediation
            .decide_warehouse(warehouse, RemediationKind::Return, created.id, Decision::Rejected, "never received")
            .await
            .unwrap(),
    );
    assert_eq!(rejected.status, RequestStatus::Rejected);
}

#[tokio::test]
async fn refund_failure_leaves_return_approved_until_retried() {
    let app = TestApp::new().await;
    let customer = Actor::customer(Uuid::new_v4());
    let variant = app.seed_variant("RFAIL-1", dec!(100), 5).await;
    let (details, agent) = app.delivered_order(customer, variant.id).await;
    let remediation = &app.services().remediation;
    let admin = Actor::admin(Uuid::new_v4());

    let created = remediation
        .create_return(customer, return_request(details.items[0].id, Some("asha@upi")))
        .await
        .unwrap();
    remediation
        .decide_pickup(agent, RemediationKind::Return, created.id, PickupStatus::Collected, None)
        .await
        .unwrap();
    remediation
        .decide_warehouse(
            Actor::warehouse(Uuid::new_v4()),
            RemediationKind::Return,
            created.id,
            Decision::Approved,
            "fine",
        )
        .await
        .unwrap();

    app.refunds.set_failing(true);
    let approved = expect_return(
        remediation
            .decide_admin(admin, RemediationKind::Return, created.id, Decision::Approved, "refund half", Some(dec!(50)))
            .await
            .unwrap(),
    );
    assert_eq!(approved.status, RequestStatus::Approved);
    assert!(approved.refund_reference.is_none());

    let err = remediation.retry_refund(admin, created.id).await.unwrap_err();
    assert_matches!(err, ServiceError::ExternalServiceError(_));

    app.refunds.set_failing(false);
    let refunded = remediation.retry_refund(admin, created.id).await.unwrap();
    assert_eq!(refunded.status, RequestStatus::Refunded);
    assert_eq!(refunded.refund_amount, Some(dec!(50)));

    let err = remediation.retry_refund(admin, created.id).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidStage(_));
}

#[tokio::test]
async fn replacement_is_approved_without_a_refund() {
    let app = TestApp::new().await;
    let customer = Actor::customer(Uuid::new_v4());
    let variant = app.seed_variant("SWAP-1", dec!(100), 5).await;
    let (details, agent) = app.delivered_order(customer, variant.id).await;
    let remediation = &app.services().remediation;
    let admin = Actor::admin(Uuid::new_v4());

    let created = remediation
        .create_replacement(
            customer,
            CreateReplacementRequest {
                order_item_id: details.items[0].id,
                reason: "wrong size".to_string(),
            },
        )
        .await
        .unwrap();
    remediation
        .decide_pickup(agent, RemediationKind::Replacement, created.id, PickupStatus::Collected, None)
        .await
        .unwrap();
    remediation
        .decide_warehouse(
            Actor::warehouse(Uuid::new_v4()),
            RemediationKind::Replacement,
            created.id,
            Decision::Approved,
            "tags attached",
        )
        .await
        .unwrap();

    let err = remediation
        .decide_admin(
            admin,
            RemediationKind::Replacement,
            created.id,
            Decision::Approved,
            "ship a new one",
            Some(dec!(10)),
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let approved = expect_replacement(
        remediation
            .decide_admin(admin, RemediationKind::Replacement, created.id, Decision::Approved, "ship a new one", None)
            .await
            .unwrap(),
    );
    assert_eq!(approved.status, RequestStatus::Approved);
    assert!(app.refunds.issued().is_empty());

    let fetched = remediation.get_replacement(customer, created.id).await.unwrap();
    assert_eq!(fetched.admin_status, Decision::Approved);

    let err = remediation
        .get_replacement(Actor::customer(Uuid::new_v4()), created.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Forbidden(_));
}

#[tokio::test]
async fn requests_are_visible_only_to_the_assigned_agent() {
    let app = TestApp::new().await;
    let customer = Actor::customer(Uuid::new_v4());
    let variant = app.seed_variant("SCOPE-1", dec!(100), 5).await;
    let (details, agent) = app.delivered_order(customer, variant.id).await;
    let remediation = &app.services().remediation;
    let item_id = details.items[0].id;

    let returned = remediation
        .create_return(customer, return_request(item_id, Some("asha@upi")))
        .await
        .unwrap();
    let stranger = Actor::delivery_agent(Uuid::new_v4());

    let err = remediation.get_return(stranger, returned.id).await.unwrap_err();
    assert_matches!(err, ServiceError::NotAssigned(_));
    assert_eq!(remediation.get_return(agent, returned.id).await.unwrap().id, returned.id);
    assert!(remediation
        .get_return(Actor::warehouse(Uuid::new_v4()), returned.id)
        .await
        .is_ok());
    let err = remediation
        .get_return(Actor::customer(Uuid::new_v4()), returned.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Forbidden(_));

    let (swap_details, swap_agent) = app.delivered_order(customer, variant.id).await;
    let replacement = remediation
        .create_replacement(
            customer,
            CreateReplacementRequest {
                order_item_id: swap_details.items[0].id,
                reason: "wrong size".to_string(),
            },
        )
        .await
        .unwrap();
    let err = remediation
        .get_replacement(stranger, replacement.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotAssigned(_));
    assert_matches!(
        remediation.get_replacement(agent, replacement.id).await,
        Err(ServiceError::NotAssigned(_))
    );
    assert!(remediation.get_replacement(swap_agent, replacement.id).await.is_ok());
}
